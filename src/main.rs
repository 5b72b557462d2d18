//! SoulCore 入口
//!
//! 初始化日志与配置，装配内核并加载槽位，启动心跳（以及 `web` feature 下的 HTTP 网关），
//! 等待关闭信号后依次停心跳、排空线程池、卸载引擎；若关闭原因是重启，则按配置重新拉起进程。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use soulcore::config::load_config;
use soulcore::core::{finish_restart, run_with_graceful_shutdown, Kernel, ShutdownReason};
use soulcore::observability;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    // 显式配置路径：SOULCORE_CONFIG 优先，其次第一个命令行参数
    let config_path = std::env::var_os("SOULCORE_CONFIG")
        .or_else(|| std::env::args_os().nth(1))
        .map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;
    let restart_mode = config.heartbeat.restart_mode;

    tracing::info!(
        "Starting {} with {} slot(s), {} worker(s)",
        config.app.identity,
        config.slots.len(),
        config.pool.max_workers
    );

    let kernel = Arc::new(
        Kernel::builder(config)
            .build()
            .context("Failed to build kernel")?,
    );
    let report = kernel.boot().await;
    for (slot, err) in &report.failed {
        tracing::warn!("Slot {} unavailable after boot: {}", slot, err);
    }

    let heartbeat = kernel.spawn_heartbeat();
    let shutdown = Arc::clone(kernel.shutdown_manager());

    let app = {
        let kernel = Arc::clone(&kernel);
        async move { serve(kernel).await }
    };

    let cleanup = {
        let kernel = Arc::clone(&kernel);
        move || async move {
            kernel.shutdown_manager().shutdown(ShutdownReason::UserInitiated);
            match heartbeat.await {
                Ok(state) => tracing::info!("Heartbeat finished: {:?}", state),
                Err(e) => tracing::warn!("Heartbeat task failed: {}", e),
            }
            kernel.shutdown().await;
        }
    };

    let reason = run_with_graceful_shutdown(shutdown, app, cleanup).await;
    tracing::info!("Shutdown complete ({:?})", reason);

    if let Some(ShutdownReason::Restart(why)) = reason {
        tracing::warn!("Restarting process: {}", why);
        let code = finish_restart(restart_mode);
        if code != 0 {
            std::process::exit(code);
        }
    }
    Ok(())
}

#[cfg(feature = "web")]
async fn serve(kernel: Arc<Kernel>) {
    let api = &kernel.config().api;
    let addr = match format!("{}:{}", api.host, api.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("Invalid listen address {}:{}: {}", api.host, api.port, e);
            return;
        }
    };
    if let Err(e) = soulcore::web::serve(Arc::clone(&kernel), addr).await {
        tracing::error!("HTTP gateway failed: {}", e);
    }
}

#[cfg(not(feature = "web"))]
async fn serve(kernel: Arc<Kernel>) {
    tracing::info!("Running headless (build with --features web for the HTTP gateway)");
    kernel.shutdown_manager().wait_for_shutdown().await;
}
