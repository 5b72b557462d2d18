//! 整进程重启原语
//!
//! 心跳判定致命故障后，先广播 `restarting` 事件，等待一个宽限期，再通过
//! [`ShutdownManager`] 以 `Restart` 原因触发正常关闭流程（停心跳、排空线程池、卸载引擎）。
//! 所有引擎释放后，由 main 调用 [`finish_restart`]：
//! - `relaunch`：以相同参数启动当前可执行文件的新进程，旧进程退出；
//! - `exit`：以退出码 75 退出，交给外部守护（systemd、包装脚本）拉起。

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::events::{EventBus, SystemEvent};
use super::shutdown::{ShutdownManager, ShutdownReason};

/// 交给外部守护进程时使用的退出码（EX_TEMPFAIL）
pub const RESTART_EXIT_CODE: i32 = 75;

/// 重启方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartMode {
    #[default]
    Relaunch,
    Exit,
}

/// 重启请求的接收方（心跳只依赖这个 trait，测试里可以计数）
pub trait RestartSignal: Send + Sync {
    fn request_restart(&self, reason: &str);
}

/// 通过关闭管理器实现的重启信号
pub struct ShutdownRestart {
    shutdown: Arc<ShutdownManager>,
    events: EventBus,
    grace: Duration,
}

impl ShutdownRestart {
    pub fn new(shutdown: Arc<ShutdownManager>, events: EventBus, grace: Duration) -> Self {
        Self {
            shutdown,
            events,
            grace,
        }
    }
}

impl RestartSignal for ShutdownRestart {
    fn request_restart(&self, reason: &str) {
        if self.shutdown.is_shutdown() {
            tracing::warn!("Restart requested ({}) but shutdown already in progress", reason);
            return;
        }
        tracing::error!("Requesting full process restart: {}", reason);
        self.events.emit(SystemEvent::Restarting {
            reason: reason.to_string(),
        });

        let shutdown = Arc::clone(&self.shutdown);
        let grace = self.grace;
        let reason = reason.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            shutdown.shutdown(ShutdownReason::Restart(reason));
        });
    }
}

/// 清理完成后执行重启，返回进程应使用的退出码
pub fn finish_restart(mode: RestartMode) -> i32 {
    match mode {
        RestartMode::Exit => {
            tracing::info!("Exiting with code {} for external restart", RESTART_EXIT_CODE);
            RESTART_EXIT_CODE
        }
        RestartMode::Relaunch => match relaunch() {
            Ok(pid) => {
                tracing::info!("Relaunched as pid {}", pid);
                0
            }
            Err(e) => {
                tracing::error!("Relaunch failed ({}), exiting with {}", e, RESTART_EXIT_CODE);
                RESTART_EXIT_CODE
            }
        },
    }
}

/// 以相同参数启动当前可执行文件的新实例
fn relaunch() -> std::io::Result<u32> {
    let exe = std::env::current_exe()?;
    let child = Command::new(exe).args(std::env::args_os().skip(1)).spawn()?;
    Ok(child.id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_mode_code() {
        assert_eq!(finish_restart(RestartMode::Exit), RESTART_EXIT_CODE);
    }

    #[test]
    fn test_mode_parses_snake_case() {
        let mode: RestartMode = serde_json::from_str("\"exit\"").unwrap();
        assert_eq!(mode, RestartMode::Exit);
        assert_eq!(RestartMode::default(), RestartMode::Relaunch);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_triggers_shutdown_after_grace() {
        let shutdown = Arc::new(ShutdownManager::new());
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let signal = ShutdownRestart::new(shutdown.clone(), events, Duration::from_secs(2));

        signal.request_restart("three failed ticks");
        assert!(matches!(rx.recv().await.unwrap(), SystemEvent::Restarting { .. }));
        assert!(!shutdown.is_shutdown());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(
            shutdown.reason(),
            Some(ShutdownReason::Restart("three failed ticks".into()))
        );
    }
}
