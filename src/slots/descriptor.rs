//! 槽位描述：身份、角色、资源预算、生成参数与后端选择
//!
//! 从 [[slots]] 配置反序列化而来，加载后除 enabled 外不再变化（enabled 存在运行时状态里）。

use serde::{Deserialize, Serialize};

/// 槽位在管线中的职能
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotRole {
    /// 意图分析 / 结构化抽取
    Analysis,
    /// 检索结果综合
    Synthesis,
    /// 最终决策（主人格）
    Decision,
    /// 语言转换
    Translation,
}

impl SlotRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotRole::Analysis => "analysis",
            SlotRole::Synthesis => "synthesis",
            SlotRole::Decision => "decision",
            SlotRole::Translation => "translation",
        }
    }
}

impl std::fmt::Display for SlotRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单次生成参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub stop: Vec<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 0.7,
            stop: vec![
                "<|eot_id|>".to_string(),
                "<|im_end|>".to_string(),
                "User:".to_string(),
            ],
        }
    }
}

impl GenerationParams {
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_stop(mut self, stop: impl Into<String>) -> Self {
        self.stop.push(stop.into());
        self
    }
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_health_timeout_secs() -> u64 {
    60
}

/// 后端引擎选择
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineConfig {
    /// 外部 llama.cpp server 进程
    LlamaServer {
        url: String,
        /// 单次生成超时
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
        /// load 时等待 /health 就绪的最长时间
        #[serde(default = "default_health_timeout_secs")]
        health_timeout_secs: u64,
    },
    /// 脚本化引擎：固定回复（未设置时回显 prompt 尾部）
    Mock {
        #[serde(default)]
        reply: Option<String>,
    },
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::Mock { reply: None }
    }
}

impl EngineConfig {
    pub fn family(&self) -> &'static str {
        match self {
            EngineConfig::LlamaServer { .. } => "llama_server",
            EngineConfig::Mock { .. } => "mock",
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_context_size() -> u32 {
    4096
}

/// 槽位描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotDescriptor {
    pub name: String,
    pub role: SlotRole,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 该槽位加载后占用的显存上限
    #[serde(default)]
    pub max_vram_mb: u64,
    #[serde(default)]
    pub gpu_id: u32,
    #[serde(default = "default_context_size")]
    pub context_size: u32,
    #[serde(default)]
    pub params: GenerationParams,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl SlotDescriptor {
    /// 以 mock 引擎创建描述（测试与干跑）
    pub fn new(name: impl Into<String>, role: SlotRole) -> Self {
        Self {
            name: name.into(),
            role,
            enabled: true,
            max_vram_mb: 0,
            gpu_id: 0,
            context_size: default_context_size(),
            params: GenerationParams::default(),
            engine: EngineConfig::default(),
        }
    }

    pub fn with_vram(mut self, max_vram_mb: u64, gpu_id: u32) -> Self {
        self.max_vram_mb = max_vram_mb;
        self.gpu_id = gpu_id;
        self
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}
