//! 主动行为钩子：反思周期判定"需要主动行动"后调用

use async_trait::async_trait;

use crate::core::events::{EventBus, SystemEvent};

/// 反思结果为 YES 时调用；实现方自行决定如何主动联系用户
#[async_trait]
pub trait ProactiveHook: Send + Sync {
    async fn on_proactive(&self, reflection: &str);
}

/// 默认实现：把反思结果作为系统事件推送到 /stream
pub struct EventProactiveHook {
    events: EventBus,
}

impl EventProactiveHook {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }
}

#[async_trait]
impl ProactiveHook for EventProactiveHook {
    async fn on_proactive(&self, reflection: &str) {
        tracing::info!("Proactive intent: {}", reflection);
        self.events.emit(SystemEvent::Proactive {
            message: reflection.to_string(),
        });
    }
}

/// 空实现
pub struct NoopProactiveHook;

#[async_trait]
impl ProactiveHook for NoopProactiveHook {
    async fn on_proactive(&self, _reflection: &str) {}
}
