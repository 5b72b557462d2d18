//! llama.cpp server 适配器
//!
//! 模型运行在外部 llama-server 进程里；load 等待 `/health` 返回 200，
//! generate 调用 `/completion`。使用 reqwest 阻塞客户端：客户端在 load 时创建、
//! unload 时销毁，两者都发生在线程池的阻塞线程上。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::error::{GenerationError, LoadError};
use crate::slots::descriptor::{GenerationParams, SlotDescriptor};
use crate::slots::engine::GenerationEngine;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
    n_predict: u32,
    temperature: f32,
    stop: &'a [String],
    cache_prompt: bool,
}

#[derive(Deserialize)]
struct CompletionResponse {
    content: String,
}

/// llama-server HTTP 引擎
pub struct LlamaServerEngine {
    base_url: String,
    timeout: Duration,
    health_timeout: Duration,
    client: Mutex<Option<reqwest::blocking::Client>>,
    ready: AtomicBool,
}

impl LlamaServerEngine {
    pub fn new(url: impl Into<String>, timeout: Duration, health_timeout: Duration) -> Self {
        Self {
            base_url: url.into().trim_end_matches('/').to_string(),
            timeout,
            health_timeout,
            client: Mutex::new(None),
            ready: AtomicBool::new(false),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn client(&self) -> Option<reqwest::blocking::Client> {
        self.client
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn wait_healthy(&self, client: &reqwest::blocking::Client, slot: &str) -> Result<(), LoadError> {
        let url = format!("{}/health", self.base_url);
        let deadline = Instant::now() + self.health_timeout;
        loop {
            let last = match client.get(&url).send() {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                // 503 表示模型仍在加载
                Ok(resp) => format!("health returned {}", resp.status()),
                Err(e) => e.to_string(),
            };
            if Instant::now() >= deadline {
                return Err(LoadError::Unavailable {
                    slot: slot.to_string(),
                    reason: last,
                });
            }
            std::thread::sleep(HEALTH_POLL_INTERVAL);
        }
    }
}

impl GenerationEngine for LlamaServerEngine {
    fn family(&self) -> &'static str {
        "llama_server"
    }

    fn load(&self, descriptor: &SlotDescriptor) -> Result<(), LoadError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| LoadError::Unavailable {
                slot: descriptor.name.clone(),
                reason: e.to_string(),
            })?;

        self.wait_healthy(&client, &descriptor.name)?;
        tracing::debug!("llama-server at {} is healthy", self.base_url);

        *self.client.lock().unwrap_or_else(|p| p.into_inner()) = Some(client);
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn unload(&self) {
        self.ready.store(false, Ordering::SeqCst);
        let client = self.client.lock().unwrap_or_else(|p| p.into_inner()).take();
        drop(client);
    }

    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String, GenerationError> {
        let client = self
            .client()
            .ok_or_else(|| GenerationError::NotLoaded(self.base_url.clone()))?;

        let body = CompletionRequest {
            prompt,
            n_predict: params.max_tokens,
            temperature: params.temperature,
            stop: &params.stop,
            cache_prompt: true,
        };

        let resp = client
            .post(format!("{}/completion", self.base_url))
            .json(&body)
            .send()
            .map_err(|e| {
                if e.is_connect() {
                    // 后端进程不在了，交给心跳的 sweep_dead 处理
                    self.ready.store(false, Ordering::SeqCst);
                }
                GenerationError::EngineFault(e.to_string())
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().unwrap_or_default();
            return Err(GenerationError::EngineFault(format!(
                "completion returned {}: {}",
                status, text
            )));
        }

        let parsed: CompletionResponse = resp
            .json()
            .map_err(|e| GenerationError::EngineFault(format!("bad completion body: {}", e)))?;
        Ok(parsed.content)
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
