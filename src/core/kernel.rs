//! 内核：统一的组件装配与生命周期
//!
//! `KernelBuilder` 按配置创建槽位注册表、存储、检索、遥测与事件总线，
//! 每个协作者都可以替换（测试里换成内存库与脚本化引擎）。
//! 构建出的 `Kernel` 以 `Arc` 在 HTTP 网关、心跳与 main 之间共享，没有全局单例。

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::core::error::{KernelError, PipelineError};
use crate::core::events::EventBus;
use crate::core::restart::{RestartSignal, ShutdownRestart};
use crate::core::shutdown::{ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
use crate::core::worker_pool::WorkerPool;
use crate::memory::{KeywordVault, PersistenceStore, RetrievalProvider, SqliteStore};
use crate::pipeline::{PipelineCoordinator, PipelineRequest, PipelineResult, PipelineSettings};
use crate::slots::{BootReport, SlotRegistry, SlotStatus};
use crate::supervisor::{
    EventProactiveHook, HealthSnapshot, Heartbeat, HeartbeatSettings, HeartbeatState, ProactiveHook,
};
use crate::telemetry::{DeviceStats, HardwareTelemetry, SystemTelemetry};

/// 内核构建器：未显式提供的协作者按配置创建
pub struct KernelBuilder {
    config: AppConfig,
    registry: Option<SlotRegistry>,
    store: Option<Arc<dyn PersistenceStore>>,
    retrieval: Option<Arc<dyn RetrievalProvider>>,
    telemetry: Option<Arc<dyn HardwareTelemetry>>,
    proactive: Option<Arc<dyn ProactiveHook>>,
    shutdown: Option<Arc<ShutdownManager>>,
    events: Option<EventBus>,
}

impl KernelBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            registry: None,
            store: None,
            retrieval: None,
            telemetry: None,
            proactive: None,
            shutdown: None,
            events: None,
        }
    }

    /// 使用已注册好引擎的槽位注册表（替代 `[[slots]]`）
    pub fn with_registry(mut self, registry: SlotRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn PersistenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_retrieval(mut self, retrieval: Arc<dyn RetrievalProvider>) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn HardwareTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn with_proactive(mut self, hook: Arc<dyn ProactiveHook>) -> Self {
        self.proactive = Some(hook);
        self
    }

    pub fn with_shutdown(mut self, shutdown: Arc<ShutdownManager>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn build_registry(&self) -> Result<SlotRegistry, KernelError> {
        let pool = Arc::new(WorkerPool::new(self.config.pool.max_workers));
        Ok(SlotRegistry::from_descriptors(&self.config.slots, pool)?
            .with_vram_limit(self.config.hardware.vram_limit_mb))
    }

    /// 装配内核（不加载槽位，加载见 [`Kernel::boot`]）
    pub fn build(mut self) -> Result<Kernel, KernelError> {
        let registry = match self.registry.take() {
            Some(registry) => registry,
            None => self.build_registry()?,
        };
        let registry = Arc::new(registry);

        let store: Arc<dyn PersistenceStore> = match self.store.take() {
            Some(store) => store,
            None => Arc::new(SqliteStore::open(&self.config.storage.db_path)?),
        };
        let retrieval: Arc<dyn RetrievalProvider> = match self.retrieval.take() {
            Some(retrieval) => retrieval,
            None => Arc::new(
                KeywordVault::new(self.config.vault.max_entries)
                    .with_default_limit(self.config.pipeline.retrieval_limit),
            ),
        };
        let telemetry: Arc<dyn HardwareTelemetry> = match self.telemetry.take() {
            Some(telemetry) => telemetry,
            None => Arc::new(SystemTelemetry::new(self.config.hardware.gpu_probe)),
        };
        let events = self.events.take().unwrap_or_default();
        let proactive: Arc<dyn ProactiveHook> = match self.proactive.take() {
            Some(hook) => hook,
            None => Arc::new(EventProactiveHook::new(events.clone())),
        };
        let shutdown = self
            .shutdown
            .take()
            .unwrap_or_else(|| Arc::new(ShutdownManager::new()));

        let coordinator = PipelineCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&retrieval),
            Arc::clone(&store),
            PipelineSettings::from_config(&self.config),
            shutdown.token(),
        );

        Ok(Kernel {
            config: self.config,
            registry,
            coordinator,
            store,
            retrieval,
            telemetry,
            proactive,
            shutdown,
            events,
            started_at: Instant::now(),
            health: Mutex::new(None),
        })
    }
}

/// GET /status 的返回体
#[derive(Debug, Clone, Serialize)]
pub struct KernelStatus {
    pub status: &'static str,
    pub identity: String,
    pub uptime_secs: u64,
    pub loaded_slots: Vec<String>,
    pub slots: Vec<SlotStatus>,
    pub hardware: Vec<DeviceStats>,
    /// 心跳尚未运行时为 None
    pub health: Option<HealthSnapshot>,
    pub vram_limit_mb: Option<u64>,
    pub pool_size: usize,
    pub pool_available: usize,
}

/// 编排内核
pub struct Kernel {
    config: AppConfig,
    registry: Arc<SlotRegistry>,
    coordinator: PipelineCoordinator,
    store: Arc<dyn PersistenceStore>,
    retrieval: Arc<dyn RetrievalProvider>,
    telemetry: Arc<dyn HardwareTelemetry>,
    proactive: Arc<dyn ProactiveHook>,
    shutdown: Arc<ShutdownManager>,
    events: EventBus,
    started_at: Instant,
    health: Mutex<Option<watch::Receiver<HealthSnapshot>>>,
}

impl Kernel {
    pub fn builder(config: AppConfig) -> KernelBuilder {
        KernelBuilder::new(config)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SlotRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn PersistenceStore> {
        &self.store
    }

    pub fn retrieval(&self) -> &Arc<dyn RetrievalProvider> {
        &self.retrieval
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn shutdown_manager(&self) -> &Arc<ShutdownManager> {
        &self.shutdown
    }

    /// 按声明顺序加载全部启用的槽位
    pub async fn boot(&self) -> BootReport {
        let report = self.registry.boot_all().await;
        tracing::info!(
            "Boot finished: {} loaded, {} failed, {} skipped",
            report.loaded.len(),
            report.failed.len(),
            report.skipped.len()
        );
        report
    }

    /// 处理一次请求
    pub async fn process(&self, request: PipelineRequest) -> Result<PipelineResult, PipelineError> {
        self.coordinator.run(request).await
    }

    /// 启动心跳；关闭管理器的 token 取消时循环结束
    pub fn spawn_heartbeat(&self) -> JoinHandle<HeartbeatState> {
        let heartbeat = Heartbeat::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.telemetry),
            self.restart_signal(),
            Arc::clone(&self.proactive),
            self.events.clone(),
            HeartbeatSettings::from_config(&self.config),
        );
        *self.health.lock().unwrap_or_else(|p| p.into_inner()) = Some(heartbeat.snapshots());
        tokio::spawn(heartbeat.run(self.shutdown.token()))
    }

    fn restart_signal(&self) -> Arc<dyn RestartSignal> {
        Arc::new(ShutdownRestart::new(
            Arc::clone(&self.shutdown),
            self.events.clone(),
            Duration::from_secs(self.config.heartbeat.restart_grace_secs),
        ))
    }

    /// 手动请求整进程重启（与心跳走同一条路径）
    pub fn request_restart(&self, reason: &str) {
        self.restart_signal().request_restart(reason);
    }

    /// 手动请求停止
    pub fn request_stop(&self) -> bool {
        tracing::info!("Stop requested");
        self.shutdown.shutdown(ShutdownReason::UserInitiated)
    }

    fn latest_health(&self) -> Option<HealthSnapshot> {
        self.health
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|rx| rx.borrow().clone())
            .filter(|s| s.ticks > 0)
    }

    async fn live_hardware(&self) -> Vec<DeviceStats> {
        let telemetry = Arc::clone(&self.telemetry);
        match tokio::task::spawn_blocking(move || telemetry.stats()).await {
            Ok(Ok(stats)) => stats,
            Ok(Err(e)) => {
                tracing::warn!("Telemetry unavailable: {}", e);
                Vec::new()
            }
            Err(e) => {
                tracing::warn!("Telemetry probe panicked: {}", e);
                Vec::new()
            }
        }
    }

    /// 状态快照：优先使用最近一次心跳的硬件数据
    pub async fn status(&self) -> KernelStatus {
        let health = self.latest_health();
        let hardware = match health {
            Some(ref h) => h.devices.clone(),
            None => self.live_hardware().await,
        };
        let pool = self.registry.pool();
        KernelStatus {
            status: if self.shutdown.is_shutdown() {
                "shutting_down"
            } else {
                "online"
            },
            identity: self.config.app.identity.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            loaded_slots: self.registry.loaded_names(),
            slots: self.registry.status(),
            hardware,
            health,
            vram_limit_mb: self.registry.vram_limit_mb(),
            pool_size: pool.size(),
            pool_available: pool.available(),
        }
    }

    /// 关闭：停止接收新请求，排空线程池，再卸载全部槽位
    pub async fn shutdown(&self) {
        self.shutdown.shutdown(ShutdownReason::UserInitiated);

        let drain_secs = self.config.pool.drain_timeout_secs;
        let mut coordinator = ShutdownCoordinator::new().with_timeout(drain_secs + 5);
        coordinator.register(PoolDrain {
            registry: Arc::clone(&self.registry),
            timeout: Duration::from_secs(drain_secs),
        });
        coordinator.register(SlotUnload {
            registry: Arc::clone(&self.registry),
            idle_timeout: Duration::from_secs(drain_secs),
        });
        coordinator.run_cleanup().await;
    }
}

/// 清理任务：排空线程池
struct PoolDrain {
    registry: Arc<SlotRegistry>,
    timeout: Duration,
}

#[async_trait::async_trait]
impl ShutdownCleanup for PoolDrain {
    async fn cleanup(&self) -> anyhow::Result<()> {
        if self.registry.pool().drain(self.timeout).await {
            Ok(())
        } else {
            anyhow::bail!("in-flight generations still running after {:?}", self.timeout)
        }
    }

    fn name(&self) -> &'static str {
        "worker_pool_drain"
    }
}

/// 清理任务：释放全部引擎；排空超时后仍在生成的槽位不卸载
struct SlotUnload {
    registry: Arc<SlotRegistry>,
    idle_timeout: Duration,
}

#[async_trait::async_trait]
impl ShutdownCleanup for SlotUnload {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let left = self.registry.unload_all(self.idle_timeout).await;
        if left.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("slots still loaded: {}", left.join(", "))
        }
    }

    fn name(&self) -> &'static str {
        "slot_unload"
    }
}
