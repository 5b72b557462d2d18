//! 引擎实现：llama.cpp server 适配器与脚本化 mock

mod llama_server;
mod mock;

use std::sync::Arc;
use std::time::Duration;

pub use llama_server::LlamaServerEngine;
pub use mock::ScriptedEngine;

use super::descriptor::EngineConfig;
use super::engine::GenerationEngine;

/// 按配置创建引擎实例
pub fn create_engine(config: &EngineConfig) -> Arc<dyn GenerationEngine> {
    match config {
        EngineConfig::LlamaServer {
            url,
            timeout_secs,
            health_timeout_secs,
        } => Arc::new(LlamaServerEngine::new(
            url.clone(),
            Duration::from_secs(*timeout_secs),
            Duration::from_secs(*health_timeout_secs),
        )),
        EngineConfig::Mock { reply } => {
            let engine = ScriptedEngine::new();
            match reply {
                Some(reply) => Arc::new(engine.with_reply(reply.clone())),
                None => Arc::new(engine),
            }
        }
    }
}
