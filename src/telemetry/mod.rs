//! 硬件遥测
//!
//! 心跳每个周期读取一次设备状态：GPU 通过 `nvidia-smi` 的 CSV 查询获得，
//! 系统内存与 CPU 负载通过 sysinfo 获得。`usage_pct` 是显存 / 内存占用百分比，
//! 驱逐阈值只看它。

use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use sysinfo::System;
use thiserror::Error;

/// 系统内存条目使用的固定序号（排在所有 GPU 之后）
pub const SYSTEM_DEVICE_INDEX: u32 = 99;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TelemetryError {
    #[error("Telemetry probe failed: {0}")]
    Probe(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Gpu,
    System,
}

/// 单个设备的读数
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStats {
    pub device_type: DeviceType,
    pub index: u32,
    pub name: String,
    /// 显存 / 内存占用百分比
    pub usage_pct: f32,
    /// 计算负载百分比
    pub load_pct: f32,
    pub mem_used_mb: u64,
    pub mem_total_mb: u64,
    pub temperature_c: Option<f32>,
}

impl DeviceStats {
    pub fn label(&self) -> String {
        match self.device_type {
            DeviceType::Gpu => format!("GPU_{}: {}", self.index, self.name),
            DeviceType::System => self.name.clone(),
        }
    }
}

/// 遥测 trait（阻塞调用，心跳在 spawn_blocking 中调用）
pub trait HardwareTelemetry: Send + Sync {
    fn stats(&self) -> Result<Vec<DeviceStats>, TelemetryError>;
}

/// 取所有设备中最高的占用率
pub fn peak_usage(stats: &[DeviceStats]) -> Option<&DeviceStats> {
    stats
        .iter()
        .max_by(|a, b| a.usage_pct.total_cmp(&b.usage_pct))
}

fn pct(used: u64, total: u64) -> f32 {
    if total == 0 {
        0.0
    } else {
        ((used as f64 / total as f64) * 1000.0).round() as f32 / 10.0
    }
}

/// 解析 `nvidia-smi --query-gpu=index,name,utilization.gpu,memory.used,memory.total,temperature.gpu
/// --format=csv,noheader,nounits` 的输出；无法解析的行跳过
pub fn parse_nvidia_smi(output: &str) -> Vec<DeviceStats> {
    output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split(',').map(str::trim).collect();
            if cols.len() < 6 {
                return None;
            }
            let index = cols[0].parse().ok()?;
            let used: u64 = cols[3].parse().ok()?;
            let total: u64 = cols[4].parse().ok()?;
            Some(DeviceStats {
                device_type: DeviceType::Gpu,
                index,
                name: cols[1].to_string(),
                usage_pct: pct(used, total),
                load_pct: cols[2].parse().unwrap_or(0.0),
                mem_used_mb: used,
                mem_total_mb: total,
                temperature_c: cols[5].parse().ok(),
            })
        })
        .collect()
}

/// sysinfo + nvidia-smi 实现
pub struct SystemTelemetry {
    system: Mutex<System>,
    /// 找不到 nvidia-smi 后不再尝试
    gpu_probe: AtomicBool,
}

impl SystemTelemetry {
    pub fn new(gpu_probe: bool) -> Self {
        Self {
            system: Mutex::new(System::new()),
            gpu_probe: AtomicBool::new(gpu_probe),
        }
    }

    fn gpu_stats(&self) -> Vec<DeviceStats> {
        if !self.gpu_probe.load(Ordering::Relaxed) {
            return Vec::new();
        }
        let output = Command::new("nvidia-smi")
            .args([
                "--query-gpu=index,name,utilization.gpu,memory.used,memory.total,temperature.gpu",
                "--format=csv,noheader,nounits",
            ])
            .output();
        match output {
            Ok(out) if out.status.success() => parse_nvidia_smi(&String::from_utf8_lossy(&out.stdout)),
            Ok(out) => {
                tracing::warn!("nvidia-smi exited with {}", out.status);
                Vec::new()
            }
            Err(e) => {
                tracing::warn!("nvidia-smi not available ({}), GPU telemetry disabled", e);
                self.gpu_probe.store(false, Ordering::Relaxed);
                Vec::new()
            }
        }
    }
}

impl Default for SystemTelemetry {
    fn default() -> Self {
        Self::new(true)
    }
}

impl HardwareTelemetry for SystemTelemetry {
    fn stats(&self) -> Result<Vec<DeviceStats>, TelemetryError> {
        let mut stats = self.gpu_stats();

        let mut system = self
            .system
            .lock()
            .map_err(|_| TelemetryError::Probe("system handle poisoned".to_string()))?;
        system.refresh_memory();
        system.refresh_cpu_usage();

        let total = system.total_memory();
        if total == 0 {
            return Err(TelemetryError::Probe("system memory size unavailable".to_string()));
        }
        let used = system.used_memory();
        stats.push(DeviceStats {
            device_type: DeviceType::System,
            index: SYSTEM_DEVICE_INDEX,
            name: "SYSTEM RAM".to_string(),
            usage_pct: pct(used, total),
            load_pct: system.global_cpu_usage(),
            mem_used_mb: used / (1024 * 1024),
            mem_total_mb: total / (1024 * 1024),
            temperature_c: None,
        });
        Ok(stats)
    }
}

/// 固定读数（干跑与测试）；可随时改写读数或让下一次读取失败
#[derive(Default)]
pub struct FixedTelemetry {
    stats: Mutex<Vec<DeviceStats>>,
    failing: AtomicBool,
}

impl FixedTelemetry {
    pub fn new(stats: Vec<DeviceStats>) -> Self {
        Self {
            stats: Mutex::new(stats),
            failing: AtomicBool::new(false),
        }
    }

    /// 单块 GPU，指定占用率
    pub fn single_gpu(usage_pct: f32) -> Self {
        Self::new(vec![gpu_reading(0, usage_pct)])
    }

    pub fn set_usage(&self, usage_pct: f32) {
        if let Ok(mut stats) = self.stats.lock() {
            for s in stats.iter_mut() {
                s.usage_pct = usage_pct;
                s.mem_used_mb = (s.mem_total_mb as f32 * usage_pct / 100.0) as u64;
            }
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl HardwareTelemetry for FixedTelemetry {
    fn stats(&self) -> Result<Vec<DeviceStats>, TelemetryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TelemetryError::Probe("scripted telemetry failure".to_string()));
        }
        self.stats
            .lock()
            .map(|s| s.clone())
            .map_err(|_| TelemetryError::Probe("stats poisoned".to_string()))
    }
}

/// 构造一条 24 GB GPU 读数
pub fn gpu_reading(index: u32, usage_pct: f32) -> DeviceStats {
    let total = 24_576;
    DeviceStats {
        device_type: DeviceType::Gpu,
        index,
        name: "Simulated GPU".to_string(),
        usage_pct,
        load_pct: 0.0,
        mem_used_mb: (total as f32 * usage_pct / 100.0) as u64,
        mem_total_mb: total,
        temperature_c: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nvidia_smi_csv() {
        let out = "0, NVIDIA GeForce RTX 3090, 37, 20480, 24576, 61\n\
                   1, NVIDIA GeForce RTX 3060, [N/A], 1024, 12288, [N/A]\n\
                   garbage line\n";
        let gpus = parse_nvidia_smi(out);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].name, "NVIDIA GeForce RTX 3090");
        assert_eq!(gpus[0].usage_pct, 83.3);
        assert_eq!(gpus[0].temperature_c, Some(61.0));
        assert_eq!(gpus[1].load_pct, 0.0);
        assert_eq!(gpus[1].temperature_c, None);
        assert_eq!(gpus[1].label(), "GPU_1: NVIDIA GeForce RTX 3060");
    }

    #[test]
    fn test_peak_usage() {
        let stats = vec![gpu_reading(0, 40.0), gpu_reading(1, 96.0)];
        assert_eq!(peak_usage(&stats).map(|s| s.index), Some(1));
        assert!(peak_usage(&[]).is_none());
    }

    #[test]
    fn test_fixed_telemetry_can_fail() {
        let t = FixedTelemetry::single_gpu(50.0);
        assert_eq!(t.stats().unwrap()[0].usage_pct, 50.0);
        t.set_usage(96.0);
        assert_eq!(t.stats().unwrap()[0].usage_pct, 96.0);
        t.set_failing(true);
        assert!(t.stats().is_err());
    }

    #[test]
    fn test_system_telemetry_reports_ram() {
        let t = SystemTelemetry::new(false);
        let stats = t.stats().unwrap();
        let ram = stats
            .iter()
            .find(|s| s.device_type == DeviceType::System)
            .unwrap();
        assert!(ram.mem_total_mb > 0);
        assert!(ram.usage_pct >= 0.0 && ram.usage_pct <= 100.0);
    }
}
