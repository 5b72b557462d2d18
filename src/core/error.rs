//! 内核错误类型
//!
//! 槽位加载、生成、结构化输出解析、线程池与心跳各自一类错误；
//! 管线内部的阶段错误全部被吸收为降级输出，只有心跳判定的系统性故障才会升级为整进程重启。

use thiserror::Error;

/// 槽位加载失败（启动时容忍，运行时决策槽位失败会触发重启）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    #[error("Unknown slot: {0}")]
    UnknownSlot(String),

    #[error("Slot {0} is disabled")]
    Disabled(String),

    #[error("Slot {0} is busy")]
    Busy(String),

    /// 另一个加载/卸载正在进行
    #[error("Slot {0} is already transitioning")]
    InTransition(String),

    #[error("VRAM budget exceeded for slot {slot}: requested {requested_mb} MB, {available_mb} MB left on GPU {gpu_id}")]
    VramBudgetExceeded {
        slot: String,
        gpu_id: u32,
        requested_mb: u64,
        available_mb: u64,
    },

    /// 引擎返回成功但没有进入就绪状态
    #[error("Engine for slot {0} did not become ready")]
    NotReady(String),

    #[error("Engine unavailable for slot {slot}: {reason}")]
    Unavailable { slot: String, reason: String },

    #[error("Load job for slot {slot} failed: {reason}")]
    Pool { slot: String, reason: String },
}

/// 生成失败：阶段降级为空输出
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("Slot not loaded: {0}")]
    NotLoaded(String),

    #[error("Engine fault: {0}")]
    EngineFault(String),

    /// 线程池已关闭，调用未执行
    #[error("Worker pool is shutting down")]
    ShuttingDown,
}

/// 结构化输出（JSON）解析失败：回退到默认负载，从不向上传播
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Malformed structured output: {0}")]
pub struct ParseError(pub String);

/// 线程池错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("Worker pool is shutting down")]
    ShuttingDown,

    #[error("Blocking job panicked: {0}")]
    Panicked(String),
}

impl From<PoolError> for GenerationError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::ShuttingDown => GenerationError::ShuttingDown,
            PoolError::Panicked(msg) => GenerationError::EngineFault(msg),
        }
    }
}

/// 需要整进程重启的致命状态
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SupervisorFatal {
    #[error("{count} consecutive heartbeat failures")]
    ConsecutiveErrors { count: u32 },

    #[error("Decision slot {slot} could not be reloaded: {source}")]
    DecisionSlotLost { slot: String, source: LoadError },
}

/// 单次心跳失败的原因
#[derive(Error, Debug)]
pub enum HeartbeatError {
    #[error("Telemetry failed: {0}")]
    Telemetry(#[from] crate::telemetry::TelemetryError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Fatal(#[from] SupervisorFatal),
}

/// 管线运行错误：只有关闭会让一次请求失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Kernel is shutting down")]
    ShuttingDown,
}

/// 内核构建失败
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] crate::memory::StoreError),

    #[error("Duplicate slot name: {0}")]
    DuplicateSlot(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_error_maps_to_generation_error() {
        assert_eq!(
            GenerationError::from(PoolError::ShuttingDown),
            GenerationError::ShuttingDown
        );
        assert!(matches!(
            GenerationError::from(PoolError::Panicked("boom".into())),
            GenerationError::EngineFault(msg) if msg == "boom"
        ));
    }

    #[test]
    fn test_fatal_message_names_slot() {
        let fatal = SupervisorFatal::DecisionSlotLost {
            slot: "king".into(),
            source: LoadError::NotReady("king".into()),
        };
        assert!(fatal.to_string().contains("king"));
    }
}
