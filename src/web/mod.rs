//! HTTP 网关（feature = "web"）
//!
//! - `GET  /status`          内核与槽位状态、硬件读数
//! - `POST /process`         处理一条消息（`query` 或 `message`）
//! - `POST /settings`        批量写入持久化配置项
//! - `GET  /stream`          系统事件 SSE（restarting / resource_critical / proactive / slot_lost）
//! - `POST /system/restart`  手动整进程重启
//! - `POST /system/stop`     手动停止

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;

use crate::core::error::PipelineError;
use crate::core::kernel::{Kernel, KernelStatus};
use crate::memory::PersistenceStore;
use crate::pipeline::{Outcome, ProcessRequest, ProcessResponse};

/// 构建路由
pub fn router(kernel: Arc<Kernel>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/process", post(process))
        .route("/settings", post(update_settings))
        .route("/stream", get(stream_events))
        .route("/system/restart", post(restart))
        .route("/system/stop", post(stop))
        .with_state(kernel)
}

/// 监听并服务，直到内核进入关闭流程
pub async fn serve(kernel: Arc<Kernel>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP gateway listening on http://{}", addr);

    let shutdown = Arc::clone(kernel.shutdown_manager());
    axum::serve(listener, router(kernel))
        .with_graceful_shutdown(async move { shutdown.wait_for_shutdown().await })
        .await
}

fn error_body(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// GET /status
async fn status(State(kernel): State<Arc<Kernel>>) -> Json<KernelStatus> {
    Json(kernel.status().await)
}

/// POST /process：空消息 400，决策槽位不可用 503（仍返回占位回复）
async fn process(State(kernel): State<Arc<Kernel>>, Json(body): Json<ProcessRequest>) -> Response {
    if body.query.trim().is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "Empty message");
    }

    match kernel.process(body.into_request()).await {
        Ok(result) => {
            let code = if result.outcome == Outcome::Unavailable {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            };
            (code, Json(ProcessResponse::from(result))).into_response()
        }
        Err(PipelineError::ShuttingDown) => {
            error_body(StatusCode::SERVICE_UNAVAILABLE, "Kernel is shutting down")
        }
    }
}

/// POST /settings：对象的每个键写入配置表，非字符串值按 JSON 文本保存
async fn update_settings(
    State(kernel): State<Arc<Kernel>>,
    Json(body): Json<Map<String, Value>>,
) -> Response {
    if body.is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "No settings given");
    }

    let mut updated = Vec::with_capacity(body.len());
    for (key, value) in body {
        let value = match value {
            Value::String(s) => s,
            other => other.to_string(),
        };
        if let Err(e) = kernel.store().set_config(&key, &value).await {
            tracing::error!("Failed to save setting {}: {}", key, e);
            return error_body(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save settings");
        }
        updated.push(key);
    }
    tracing::info!("Updated settings: {:?}", updated);
    Json(json!({ "status": "updated", "updated": updated })).into_response()
}

/// GET /stream：每个系统事件一条 SSE，event 名为事件类型，data 为 JSON
async fn stream_events(
    State(kernel): State<Arc<Kernel>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = kernel.events().subscribe();
    let event_stream = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(ev) => match Event::default().event(ev.kind()).json_data(&ev) {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(e) => tracing::warn!("Failed to encode system event: {}", e),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("SSE client lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(event_stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    )
}

/// POST /system/restart
async fn restart(State(kernel): State<Arc<Kernel>>) -> Response {
    kernel.request_restart("manual restart requested via API");
    (StatusCode::ACCEPTED, Json(json!({ "status": "restarting" }))).into_response()
}

/// POST /system/stop
async fn stop(State(kernel): State<Arc<Kernel>>) -> Response {
    kernel.request_stop();
    (StatusCode::ACCEPTED, Json(json!({ "status": "stopping" }))).into_response()
}
