//! 槽位句柄：描述 + 引擎 + 运行时状态
//!
//! 状态机：`Unloaded → Loading → Ready → Unloading → Unloaded`。
//! 状态锁只在同步代码里持有，引擎调用在锁外进行，但只由持有该迁移的一方发起；
//! busy 计数由 [`SlotLease`] 维护，busy > 0 时不允许卸载或重载。

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::core::error::{GenerationError, LoadError};
use crate::core::worker_pool::WorkerPool;

use super::descriptor::{GenerationParams, SlotDescriptor, SlotRole};
use super::engine::GenerationEngine;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// 槽位生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotPhase {
    Unloaded,
    Loading,
    Ready,
    Unloading,
}

impl SlotPhase {
    pub fn is_transitioning(&self) -> bool {
        matches!(self, SlotPhase::Loading | SlotPhase::Unloading)
    }
}

/// 运行时状态（只由 Slot / SlotRegistry 修改）
#[derive(Debug, Clone)]
pub struct SlotRuntime {
    pub phase: SlotPhase,
    pub enabled: bool,
    /// 正在进行中的生成调用数
    pub busy: usize,
    pub last_used: Option<DateTime<Utc>>,
    pub invocations: u64,
    pub last_error: Option<String>,
}

/// 状态快照（只读）
#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    pub name: String,
    pub role: SlotRole,
    pub engine: &'static str,
    pub phase: SlotPhase,
    pub loaded: bool,
    pub enabled: bool,
    pub busy: usize,
    pub last_used: Option<DateTime<Utc>>,
    pub invocation_count: u64,
    pub max_vram_mb: u64,
    pub gpu_id: u32,
    pub last_error: Option<String>,
}

/// 单个槽位
pub struct Slot {
    descriptor: SlotDescriptor,
    engine: Arc<dyn GenerationEngine>,
    state: Mutex<SlotRuntime>,
}

impl Slot {
    pub fn new(descriptor: SlotDescriptor, engine: Arc<dyn GenerationEngine>) -> Self {
        let enabled = descriptor.enabled;
        Self {
            descriptor,
            engine,
            state: Mutex::new(SlotRuntime {
                phase: SlotPhase::Unloaded,
                enabled,
                busy: 0,
                last_used: None,
                invocations: 0,
                last_error: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn role(&self) -> SlotRole {
        self.descriptor.role
    }

    pub fn descriptor(&self) -> &SlotDescriptor {
        &self.descriptor
    }

    pub(crate) fn runtime(&self) -> MutexGuard<'_, SlotRuntime> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn phase(&self) -> SlotPhase {
        self.runtime().phase
    }

    pub fn is_loaded(&self) -> bool {
        self.runtime().phase == SlotPhase::Ready
    }

    pub fn is_enabled(&self) -> bool {
        self.runtime().enabled
    }

    pub fn status(&self) -> SlotStatus {
        let rt = self.runtime();
        SlotStatus {
            name: self.descriptor.name.clone(),
            role: self.descriptor.role,
            engine: self.engine.family(),
            phase: rt.phase,
            loaded: rt.phase == SlotPhase::Ready,
            enabled: rt.enabled,
            busy: rt.busy,
            last_used: rt.last_used,
            invocation_count: rt.invocations,
            max_vram_mb: self.descriptor.max_vram_mb,
            gpu_id: self.descriptor.gpu_id,
            last_error: rt.last_error.clone(),
        }
    }

    /// 进入 Loading；返回 Ok(false) 表示已经就绪、无需加载
    pub(crate) fn begin_load(&self) -> Result<bool, LoadError> {
        let mut rt = self.runtime();
        if !rt.enabled {
            return Err(LoadError::Disabled(self.descriptor.name.clone()));
        }
        match rt.phase {
            SlotPhase::Ready => Ok(false),
            SlotPhase::Loading | SlotPhase::Unloading => {
                Err(LoadError::InTransition(self.descriptor.name.clone()))
            }
            SlotPhase::Unloaded => {
                rt.phase = SlotPhase::Loading;
                Ok(true)
            }
        }
    }

    /// 在线程池上执行引擎加载（调用方已通过 begin_load 进入 Loading）
    ///
    /// 加载与阶段提交在独立任务里完成，调用方的 future 被丢弃时阶段照样落定。
    pub(crate) async fn complete_load(self: &Arc<Self>, pool: &Arc<WorkerPool>) -> Result<(), LoadError> {
        let slot = Arc::clone(self);
        let pool = Arc::clone(pool);
        tokio::spawn(async move { slot.run_load(&pool).await })
            .await
            .unwrap_or_else(|e| {
                Err(LoadError::Pool {
                    slot: self.descriptor.name.clone(),
                    reason: e.to_string(),
                })
            })
    }

    async fn run_load(&self, pool: &WorkerPool) -> Result<(), LoadError> {
        let engine = Arc::clone(&self.engine);
        let descriptor = self.descriptor.clone();
        let outcome = pool
            .run(move || -> Result<(), LoadError> {
                engine.load(&descriptor)?;
                if engine.is_ready() {
                    Ok(())
                } else {
                    Err(LoadError::NotReady(descriptor.name.clone()))
                }
            })
            .await
            .map_err(|e| LoadError::Pool {
                slot: self.descriptor.name.clone(),
                reason: e.to_string(),
            })
            .and_then(|r| r);

        let mut rt = self.runtime();
        match outcome {
            Ok(()) => {
                rt.phase = SlotPhase::Ready;
                rt.last_error = None;
                Ok(())
            }
            Err(e) => {
                rt.phase = SlotPhase::Unloaded;
                rt.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// 加载（不做显存预算检查，预算由 SlotRegistry 负责）
    pub async fn load(self: &Arc<Self>, pool: &Arc<WorkerPool>) -> Result<(), LoadError> {
        if self.begin_load()? {
            self.complete_load(pool).await
        } else {
            Ok(())
        }
    }

    /// 卸载；返回 Ok(false) 表示本来就未加载
    ///
    /// 有进行中的生成调用时返回 Busy，引擎不会在生成途中被释放。
    /// 线程池排空后仍可调用（不占许可）；阶段提交同样不受调用方取消影响。
    pub async fn unload(self: &Arc<Self>, pool: &Arc<WorkerPool>) -> Result<bool, LoadError> {
        {
            let mut rt = self.runtime();
            match rt.phase {
                SlotPhase::Unloaded => return Ok(false),
                SlotPhase::Loading | SlotPhase::Unloading => {
                    return Err(LoadError::InTransition(self.descriptor.name.clone()))
                }
                SlotPhase::Ready => {}
            }
            if rt.busy > 0 {
                return Err(LoadError::Busy(self.descriptor.name.clone()));
            }
            rt.phase = SlotPhase::Unloading;
        }

        let slot = Arc::clone(self);
        let pool = Arc::clone(pool);
        let task = tokio::spawn(async move {
            let engine = Arc::clone(&slot.engine);
            let result = pool.run_unbounded(move || engine.unload()).await;

            let mut rt = slot.runtime();
            rt.phase = SlotPhase::Unloaded;
            if let Err(e) = result {
                // 卸载时崩溃也视为已卸载，引擎状态交给下一次 load 重建
                tracing::warn!("Unload of slot {} panicked: {}", slot.descriptor.name, e);
                rt.last_error = Some(e.to_string());
            }
        });
        if let Err(e) = task.await {
            tracing::warn!("Unload task for slot {} failed: {}", self.descriptor.name, e);
        }
        Ok(true)
    }

    /// 等待在途生成与加载/卸载结束；到 deadline 仍未空闲返回 false
    pub(crate) async fn wait_idle(&self, deadline: Instant) -> bool {
        loop {
            let idle = {
                let rt = self.runtime();
                rt.busy == 0 && !rt.phase.is_transitioning()
            };
            if idle {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
    }

    /// 引擎已不再就绪但状态仍为 Ready 时，标记为 Unloaded；返回是否做了标记
    pub(crate) fn mark_dead_if_stale(&self) -> bool {
        let mut rt = self.runtime();
        if rt.phase != SlotPhase::Ready || rt.busy > 0 {
            return false;
        }
        if self.engine.is_ready() {
            return false;
        }
        rt.phase = SlotPhase::Unloaded;
        rt.last_error = Some("engine stopped responding".to_string());
        true
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.runtime().enabled = enabled;
    }

    /// 已加载且启用时发放租约
    pub(crate) fn lease(self: &Arc<Self>, pool: Arc<WorkerPool>) -> Option<SlotLease> {
        let mut rt = self.runtime();
        if rt.phase != SlotPhase::Ready || !rt.enabled {
            return None;
        }
        rt.busy += 1;
        Some(SlotLease {
            slot: Arc::clone(self),
            pool,
        })
    }
}

/// 槽位租约：存在期间槽位 busy 计数加一，drop 时归还
pub struct SlotLease {
    slot: Arc<Slot>,
    pool: Arc<WorkerPool>,
}

impl SlotLease {
    pub fn name(&self) -> &str {
        self.slot.name()
    }

    pub fn role(&self) -> SlotRole {
        self.slot.role()
    }

    /// 槽位配置的默认生成参数
    pub fn params(&self) -> &GenerationParams {
        &self.slot.descriptor.params
    }

    /// 使用槽位默认参数生成
    pub async fn generate(&self, prompt: impl Into<String>) -> Result<String, GenerationError> {
        let params = self.slot.descriptor.params.clone();
        self.generate_with(prompt, params).await
    }

    /// 在线程池上执行一次阻塞生成
    pub async fn generate_with(
        &self,
        prompt: impl Into<String>,
        params: GenerationParams,
    ) -> Result<String, GenerationError> {
        let prompt = prompt.into();
        let engine = Arc::clone(&self.slot.engine);
        let result = self
            .pool
            .run(move || engine.generate(&prompt, &params))
            .await
            .map_err(GenerationError::from)
            .and_then(|r| r);

        let mut rt = self.slot.runtime();
        rt.last_used = Some(Utc::now());
        rt.invocations += 1;
        if let Err(ref e) = result {
            rt.last_error = Some(e.to_string());
        }
        result
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        let mut rt = self.slot.runtime();
        rt.busy = rt.busy.saturating_sub(1);
    }
}
