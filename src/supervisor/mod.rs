//! 监管层：心跳自愈循环与主动行为钩子

pub mod heartbeat;
pub mod proactive;

pub use heartbeat::{Heartbeat, HeartbeatSettings, HeartbeatState, HealthSnapshot, ResourceLevel};
pub use proactive::{EventProactiveHook, NoopProactiveHook, ProactiveHook};
