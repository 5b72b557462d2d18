//! 优雅关闭与重启请求
//!
//! 提供统一的关闭信号监听和清理逻辑，确保：
//! - 心跳循环先停
//! - 线程池排空后再释放引擎
//! - 关闭原因只记录第一次（重启请求不会被后来的信号覆盖）

use std::future::Future;
use std::sync::{Arc, OnceLock};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    /// 关闭信号 token
    shutdown_token: CancellationToken,
    /// 关闭原因广播
    reason_tx: broadcast::Sender<ShutdownReason>,
    /// 第一次触发时的原因
    reason: Arc<OnceLock<ShutdownReason>>,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// 用户发起的退出 (Ctrl+C 或 /system/stop)
    UserInitiated,
    /// SIGTERM 信号
    Signal,
    /// 心跳或手动触发的整进程重启
    Restart(String),
}

impl ShutdownReason {
    pub fn is_restart(&self) -> bool {
        matches!(self, ShutdownReason::Restart(_))
    }
}

impl ShutdownManager {
    /// 创建新的关闭管理器
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
            reason: Arc::new(OnceLock::new()),
        }
    }

    /// 获取关闭 token（用于取消正在进行的任务）
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// 触发关闭；返回 false 表示此前已经触发过
    pub fn shutdown(&self, reason: ShutdownReason) -> bool {
        let first = self.reason.set(reason.clone()).is_ok();
        if first {
            let _ = self.reason_tx.send(reason);
            self.shutdown_token.cancel();
        }
        first
    }

    /// 是否已触发关闭
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// 第一次触发关闭时的原因
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().cloned()
    }

    /// 订阅关闭原因
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    /// 等待关闭信号
    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    /// 执行清理，返回清理是否成功
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序执行清理任务
pub struct ShutdownCoordinator {
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    /// 单个清理任务的超时时间（秒）
    timeout_secs: u64,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            cleanup_tasks: Vec::new(),
            timeout_secs: 5,
        }
    }

    /// 设置清理超时时间
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// 注册清理任务
    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 顺序执行所有清理任务；单个任务失败或超时不影响后续任务
    pub async fn run_cleanup(&self) {
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());

        let timeout = tokio::time::Duration::from_secs(self.timeout_secs);

        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!("Cleanup task '{}' completed successfully", name);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Cleanup task '{}' failed: {}", name, e);
                }
                Err(_) => {
                    tracing::warn!("Cleanup task '{}' timed out after {}s", name, self.timeout_secs);
                }
            }
        }

        tracing::info!("All cleanup tasks finished");
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// 运行主应用直到收到关闭信号，然后执行清理；返回关闭原因
pub async fn run_with_graceful_shutdown<F, Fut>(
    shutdown_manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) -> Option<ShutdownReason>
where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    shutdown_manager.install_signal_handlers();

    tokio::select! {
        _ = app => {
            tracing::info!("Application finished normally");
        }
        _ = shutdown_manager.wait_for_shutdown() => {
            tracing::info!("Shutdown signal received");
        }
    }

    cleanup().await;
    shutdown_manager.reason()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_manager_new() {
        let manager = ShutdownManager::new();
        assert!(!manager.is_shutdown());
        assert!(manager.reason().is_none());
    }

    #[test]
    fn test_shutdown_manager_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!token.is_cancelled());
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        assert!(manager.shutdown(ShutdownReason::Restart("heartbeat".into())));
        assert!(!manager.shutdown(ShutdownReason::Signal));
        assert_eq!(
            manager.reason(),
            Some(ShutdownReason::Restart("heartbeat".into()))
        );
        assert!(manager.reason().unwrap().is_restart());
    }

    struct MockCleanup {
        order: Arc<std::sync::Mutex<Vec<&'static str>>>,
        name: &'static str,
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for MockCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.order.lock().unwrap().push(self.name);
            Ok(())
        }

        fn name(&self) -> &'static str {
            self.name
        }
    }

    #[tokio::test]
    async fn test_shutdown_coordinator_runs_in_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut coordinator = ShutdownCoordinator::new();
        coordinator.register(MockCleanup { order: order.clone(), name: "pool" });
        coordinator.register(MockCleanup { order: order.clone(), name: "slots" });

        coordinator.run_cleanup().await;
        assert_eq!(*order.lock().unwrap(), vec!["pool", "slots"]);
    }

    #[tokio::test]
    async fn test_run_with_graceful_shutdown_returns_reason() {
        let manager = Arc::new(ShutdownManager::new());
        let trigger = manager.clone();
        let reason = run_with_graceful_shutdown(
            manager,
            async move {
                trigger.shutdown(ShutdownReason::Restart("manual".into()));
                std::future::pending::<()>().await;
            },
            || async {},
        )
        .await;
        assert_eq!(reason, Some(ShutdownReason::Restart("manual".into())));
    }
}
