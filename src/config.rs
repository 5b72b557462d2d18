//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SOULCORE__*` 覆盖（双下划线表示嵌套，如 `SOULCORE__POOL__MAX_WORKERS=2`）。
//! 所有段落都有默认值，空配置也能启动一个没有槽位的内核。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::restart::RestartMode;
use crate::slots::SlotDescriptor;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub api: ApiSection,
    pub pool: PoolSection,
    pub pipeline: PipelineSection,
    pub heartbeat: HeartbeatSection,
    pub hardware: HardwareSection,
    pub storage: StorageSection,
    pub vault: VaultSection,
    /// [[slots]]：按声明顺序启动
    pub slots: Vec<SlotDescriptor>,
}

/// [app] 段：身份与语言
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub identity: String,
    /// 面向用户的语言
    pub user_lang: String,
    /// 决策槽位内部使用的语言
    pub internal_lang: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            identity: "SoulCore".to_string(),
            user_lang: "en".to_string(),
            internal_lang: "en".to_string(),
        }
    }
}

/// [api] 段：HTTP 网关监听地址（仅 `web` feature 使用）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub host: String,
    pub port: u16,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// [pool] 段：阻塞生成线程池
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    /// 同时进行的引擎调用上限
    pub max_workers: usize,
    /// 关闭时等待在途调用完成的秒数
    pub drain_timeout_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_workers: 4,
            drain_timeout_secs: 10,
        }
    }
}

/// [pipeline] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// 决策提示词中带入的最近消息条数
    pub history_turns: usize,
    /// 检索条数上限
    pub retrieval_limit: usize,
    /// note 中出现该标记时触发事实/任务抽取（大小写不敏感）
    pub memory_trigger: String,
    /// 所有兜底之后仍为空时的回复
    pub placeholder: String,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            history_turns: 6,
            retrieval_limit: 5,
            memory_trigger: "TRIGGER_MEMORY".to_string(),
            placeholder: "…".to_string(),
        }
    }
}

/// [heartbeat] 段：心跳间隔、反思周期、告警阈值与重启策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatSection {
    pub interval_secs: u64,
    /// 每隔多少次心跳做一次自我反思
    pub reflection_every: u32,
    /// 连续失败多少次后整进程重启
    pub error_threshold: u32,
    pub warn_pct: f32,
    pub critical_pct: f32,
    /// 内存吃紧时卸载的槽位；未设置时为所有非决策槽位
    pub evict_slots: Option<Vec<String>>,
    pub restart_mode: RestartMode,
    /// 发出重启事件后、真正重启前的等待秒数（让 SSE 客户端收到通知）
    pub restart_grace_secs: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            reflection_every: 20,
            error_threshold: 3,
            warn_pct: 85.0,
            critical_pct: 94.0,
            evict_slots: None,
            restart_mode: RestartMode::default(),
            restart_grace_secs: 2,
        }
    }
}

/// [hardware] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HardwareSection {
    /// 单块 GPU 上已加载槽位 max_vram_mb 之和的上限；None 表示不限制
    pub vram_limit_mb: Option<u64>,
    /// 是否调用 nvidia-smi 采集 GPU 数据
    pub gpu_probe: bool,
}

impl Default for HardwareSection {
    fn default() -> Self {
        Self {
            vram_limit_mb: None,
            gpu_probe: true,
        }
    }
}

/// [storage] 段：SQLite 文件位置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub db_path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("vault/db/soulcore.db"),
        }
    }
}

/// [vault] 段：内置关键词检索库
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VaultSection {
    pub max_entries: usize,
}

impl Default for VaultSection {
    fn default() -> Self {
        Self { max_entries: 2000 }
    }
}

/// 从 config 目录加载配置，环境变量 SOULCORE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SOULCORE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!("Config file {} not found, skipping", path.display());
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SOULCORE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::SlotRole;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.pool.max_workers, 4);
        assert_eq!(cfg.heartbeat.error_threshold, 3);
        assert_eq!(cfg.heartbeat.interval_secs, 10);
        assert_eq!(cfg.pipeline.placeholder, "…");
        assert!(cfg.slots.is_empty());
    }

    #[test]
    fn test_parse_toml_with_slots() {
        let toml = r#"
            [app]
            identity = "Kópé"
            user_lang = "hu"

            [heartbeat]
            critical_pct = 90.0
            evict_slots = ["valet"]

            [[slots]]
            name = "king"
            role = "decision"
            max_vram_mb = 18000
            engine = { kind = "llama_server", url = "http://127.0.0.1:8081" }

            [[slots]]
            name = "valet"
            role = "synthesis"
            enabled = false
            engine = { kind = "mock", reply = "ok" }
        "#;
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(cfg.app.identity, "Kópé");
        assert_eq!(cfg.app.internal_lang, "en");
        assert_eq!(cfg.heartbeat.critical_pct, 90.0);
        assert_eq!(cfg.heartbeat.evict_slots, Some(vec!["valet".to_string()]));
        assert_eq!(cfg.slots.len(), 2);
        assert_eq!(cfg.slots[0].role, SlotRole::Decision);
        assert_eq!(cfg.slots[0].max_vram_mb, 18000);
        assert!(cfg.slots[0].enabled);
        assert!(!cfg.slots[1].enabled);
    }
}
