//! 核心层：错误分类、关闭与重启、阻塞线程池、系统事件、内核装配

pub mod error;
pub mod events;
pub mod kernel;
pub mod restart;
pub mod shutdown;
pub mod worker_pool;

pub use error::{
    GenerationError, HeartbeatError, KernelError, LoadError, ParseError, PipelineError, PoolError,
    SupervisorFatal,
};
pub use events::{EventBus, SystemEvent};
pub use kernel::{Kernel, KernelBuilder, KernelStatus};
pub use restart::{finish_restart, RestartMode, RestartSignal, ShutdownRestart, RESTART_EXIT_CODE};
pub use shutdown::{
    run_with_graceful_shutdown, ShutdownCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason,
};
pub use worker_pool::WorkerPool;
