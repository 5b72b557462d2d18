//! 系统事件广播（SSE /stream 的数据源）

use serde::Serialize;
use tokio::sync::broadcast;

/// 内核对外广播的系统事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SystemEvent {
    /// 即将整进程重启
    Restarting { reason: String },
    /// 设备使用率越过临界阈值，已卸载辅助槽位
    ResourceCritical {
        device: String,
        usage_pct: f32,
        evicted: Vec<String>,
    },
    /// 反思周期判定需要主动行动
    Proactive { message: String },
    /// 非决策槽位重载失败（容忍）
    SlotLost { slot: String, error: String },
}

impl SystemEvent {
    /// SSE 事件名
    pub fn kind(&self) -> &'static str {
        match self {
            SystemEvent::Restarting { .. } => "restarting",
            SystemEvent::ResourceCritical { .. } => "resource_critical",
            SystemEvent::Proactive { .. } => "proactive",
            SystemEvent::SlotLost { .. } => "slot_lost",
        }
    }
}

/// 事件总线；没有订阅者时事件直接丢弃
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: SystemEvent) {
        tracing::debug!(kind = event.kind(), "system event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(SystemEvent::Restarting { reason: "test".into() });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "restarting");
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(SystemEvent::SlotLost {
            slot: "valet".into(),
            error: "boom".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "slot_lost");
        assert_eq!(json["slot"], "valet");
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(1);
        bus.emit(SystemEvent::Proactive { message: "hi".into() });
    }
}
