//! 槽位注册表
//!
//! 按配置顺序持有全部槽位，是运行时状态的唯一所有者。管线和心跳只调用这里的操作：
//! boot_all / get / reload / evict / status / sweep_dead / unload_all。
//! 显存预算按 GPU 统计：已就绪和正在加载的槽位 max_vram_mb 之和不得超过 vram_limit_mb。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::core::error::{KernelError, LoadError};
use crate::core::worker_pool::WorkerPool;

use super::descriptor::{SlotDescriptor, SlotRole};
use super::engine::GenerationEngine;
use super::engines::create_engine;
use super::slot::{Slot, SlotLease, SlotPhase, SlotStatus};

/// boot_all 的结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct BootReport {
    pub loaded: Vec<String>,
    /// (槽位名, 错误信息)
    pub failed: Vec<(String, String)>,
    /// 配置为禁用的槽位
    pub skipped: Vec<String>,
}

/// evict 的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvictionReport {
    pub evicted: Vec<String>,
    /// 正在生成、本次跳过的槽位
    pub skipped_busy: Vec<String>,
}

/// 槽位注册表
pub struct SlotRegistry {
    slots: Vec<Arc<Slot>>,
    index: HashMap<String, usize>,
    pool: Arc<WorkerPool>,
    vram_limit_mb: Option<u64>,
    /// 预算检查与进入 Loading 必须原子完成
    budget: Mutex<()>,
}

impl SlotRegistry {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            slots: Vec::new(),
            index: HashMap::new(),
            pool,
            vram_limit_mb: None,
            budget: Mutex::new(()),
        }
    }

    /// 按描述创建引擎并注册
    pub fn from_descriptors(
        descriptors: &[SlotDescriptor],
        pool: Arc<WorkerPool>,
    ) -> Result<Self, KernelError> {
        let mut registry = Self::new(pool);
        for desc in descriptors {
            registry.register(desc.clone(), create_engine(&desc.engine))?;
        }
        Ok(registry)
    }

    pub fn with_vram_limit(mut self, limit_mb: Option<u64>) -> Self {
        self.vram_limit_mb = limit_mb;
        self
    }

    pub fn register(
        &mut self,
        descriptor: SlotDescriptor,
        engine: Arc<dyn GenerationEngine>,
    ) -> Result<(), KernelError> {
        if self.index.contains_key(&descriptor.name) {
            return Err(KernelError::DuplicateSlot(descriptor.name));
        }
        self.index.insert(descriptor.name.clone(), self.slots.len());
        self.slots.push(Arc::new(Slot::new(descriptor, engine)));
        Ok(())
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn vram_limit_mb(&self) -> Option<u64> {
        self.vram_limit_mb
    }

    fn slot(&self, name: &str) -> Option<&Arc<Slot>> {
        self.index.get(name).map(|&i| &self.slots[i])
    }

    pub fn names(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.name().to_string()).collect()
    }

    /// 该角色的第一个槽位名（不论是否已加载）
    pub fn slot_for_role(&self, role: SlotRole) -> Option<&str> {
        self.slots.iter().find(|s| s.role() == role).map(|s| s.name())
    }

    /// 槽位已加载且启用
    pub fn is_available(&self, name: &str) -> bool {
        self.slot(name)
            .map(|s| s.is_loaded() && s.is_enabled())
            .unwrap_or(false)
    }

    /// 角色对应的槽位当前可用
    pub fn role_available(&self, role: SlotRole) -> bool {
        self.slot_for_role(role)
            .map(|name| self.is_available(name))
            .unwrap_or(false)
    }

    pub fn loaded_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_loaded()).count()
    }

    pub fn loaded_names(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|s| s.is_loaded())
            .map(|s| s.name().to_string())
            .collect()
    }

    pub fn status(&self) -> Vec<SlotStatus> {
        self.slots.iter().map(|s| s.status()).collect()
    }

    pub fn slot_status(&self, name: &str) -> Option<SlotStatus> {
        self.slot(name).map(|s| s.status())
    }

    /// 已加载时返回租约；None 表示该阶段不可用
    pub fn get(&self, name: &str) -> Option<SlotLease> {
        self.slot(name)?.lease(Arc::clone(&self.pool))
    }

    /// 按角色取租约
    pub fn get_role(&self, role: SlotRole) -> Option<SlotLease> {
        let name = self.slot_for_role(role)?;
        self.get(name)
    }

    /// 检查显存预算并进入 Loading
    fn admit(&self, slot: &Slot) -> Result<bool, LoadError> {
        let _guard = self.budget.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(limit) = self.vram_limit_mb {
            let desc = slot.descriptor();
            let used: u64 = self
                .slots
                .iter()
                .filter(|other| other.name() != desc.name && other.descriptor().gpu_id == desc.gpu_id)
                .filter(|other| matches!(other.phase(), SlotPhase::Ready | SlotPhase::Loading))
                .map(|other| other.descriptor().max_vram_mb)
                .sum();
            let available = limit.saturating_sub(used);
            if desc.max_vram_mb > available && slot.phase() == SlotPhase::Unloaded {
                return Err(LoadError::VramBudgetExceeded {
                    slot: desc.name.clone(),
                    gpu_id: desc.gpu_id,
                    requested_mb: desc.max_vram_mb,
                    available_mb: available,
                });
            }
        }

        slot.begin_load()
    }

    async fn load_slot(&self, slot: &Arc<Slot>) -> Result<(), LoadError> {
        match self.admit(slot) {
            Ok(true) => slot.complete_load(&self.pool).await,
            Ok(false) => Ok(()),
            Err(e) => {
                slot.runtime().last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// 启动时加载全部启用的槽位；单个失败只记录，不影响其余槽位
    pub async fn boot_all(&self) -> BootReport {
        let mut report = BootReport::default();
        for slot in &self.slots {
            let name = slot.name().to_string();
            if !slot.is_enabled() {
                tracing::info!("Slot {} disabled, skipping", name);
                report.skipped.push(name);
                continue;
            }
            tracing::info!(
                "Loading slot {} ({}, {} engine)",
                name,
                slot.role(),
                slot.descriptor().engine.family()
            );
            match self.load_slot(slot).await {
                Ok(()) => {
                    tracing::info!("Slot {} ready", name);
                    report.loaded.push(name);
                }
                Err(e) => {
                    tracing::error!("Slot {} failed to load: {}", name, e);
                    report.failed.push((name, e.to_string()));
                }
            }
        }
        report
    }

    /// 单独加载一个槽位
    pub async fn load(&self, name: &str) -> Result<(), LoadError> {
        let slot = self
            .slot(name)
            .ok_or_else(|| LoadError::UnknownSlot(name.to_string()))?;
        self.load_slot(slot).await
    }

    /// 先卸载再加载（自愈）；禁用、忙碌或迁移中的槽位拒绝重载
    pub async fn reload(&self, name: &str) -> Result<(), LoadError> {
        let slot = self
            .slot(name)
            .ok_or_else(|| LoadError::UnknownSlot(name.to_string()))?;
        if !slot.is_enabled() {
            return Err(LoadError::Disabled(name.to_string()));
        }
        tracing::info!("Reloading slot {}", name);
        slot.unload(&self.pool).await?;
        self.load_slot(slot).await
    }

    /// 强制卸载指定槽位，跳过正在生成的槽位
    pub async fn evict(&self, names: &[String]) -> EvictionReport {
        let mut report = EvictionReport::default();
        for name in names {
            let Some(slot) = self.slot(name) else {
                tracing::warn!("Evict: unknown slot {}", name);
                continue;
            };
            match slot.unload(&self.pool).await {
                Ok(true) => {
                    tracing::warn!("Evicted slot {}", name);
                    report.evicted.push(name.clone());
                }
                Ok(false) => {}
                Err(LoadError::Busy(_)) => {
                    tracing::info!("Slot {} is generating, eviction skipped", name);
                    report.skipped_busy.push(name.clone());
                }
                Err(e) => {
                    tracing::info!("Slot {} not evicted: {}", name, e);
                }
            }
        }
        report
    }

    /// 启用或禁用；禁用时顺带卸载（忙碌则留给下一次驱逐）
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), LoadError> {
        let slot = self
            .slot(name)
            .ok_or_else(|| LoadError::UnknownSlot(name.to_string()))?;
        slot.set_enabled(enabled);
        if !enabled {
            self.evict(&[name.to_string()]).await;
        }
        Ok(())
    }

    /// 标记引擎已掉线但状态仍为 Ready 的槽位；返回被标记的槽位名
    pub fn sweep_dead(&self) -> Vec<String> {
        let mut dead = Vec::new();
        for slot in &self.slots {
            if slot.mark_dead_if_stale() {
                tracing::warn!("Slot {} engine is no longer ready, marked unloaded", slot.name());
                dead.push(slot.name().to_string());
            }
        }
        dead
    }

    /// 关闭时卸载全部槽位（线程池排空后调用）
    ///
    /// 先等在途生成与迁移结束，最多等 `idle_timeout`；到期仍在生成的槽位保持加载，
    /// 引擎不会在生成途中被释放。返回未能卸载的槽位名。
    pub async fn unload_all(&self, idle_timeout: Duration) -> Vec<String> {
        let deadline = Instant::now() + idle_timeout;
        let mut left = Vec::new();
        for slot in &self.slots {
            if !slot.wait_idle(deadline).await {
                tracing::warn!(
                    "Slot {} still busy after {:?}, leaving engine loaded",
                    slot.name(),
                    idle_timeout
                );
                left.push(slot.name().to_string());
                continue;
            }
            match slot.unload(&self.pool).await {
                Ok(true) => tracing::info!("Slot {} unloaded", slot.name()),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("Slot {} not unloaded: {}", slot.name(), e);
                    left.push(slot.name().to_string());
                }
            }
        }
        left
    }
}
