//! 心跳：周期性自愈循环
//!
//! 每个周期依次执行：
//! 1. 卡死检测：引擎不再就绪的槽位标记为未加载；
//! 2. 资源检查：读取遥测，超过告警阈值记日志，超过临界阈值驱逐辅助槽位；
//! 3. 健康检查：重载所有启用但未加载的槽位，决策槽位重载失败直接判定致命；
//! 4. 反思：每 N 个周期让决策槽位回答一次 YES/NO，不阻塞循环。
//!
//! 单个周期出错时连续错误计数加一，成功时清零；达到阈值（或出现致命错误）时
//! 只发出一次重启请求，循环随即结束。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::error::{HeartbeatError, LoadError, SupervisorFatal};
use crate::core::events::{EventBus, SystemEvent};
use crate::core::restart::RestartSignal;
use crate::pipeline::prompts;
use crate::slots::{SlotPhase, SlotRegistry, SlotRole};
use crate::telemetry::{peak_usage, DeviceStats, HardwareTelemetry, TelemetryError};

use super::proactive::ProactiveHook;

/// 资源水位
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceLevel {
    #[default]
    Normal,
    Warning,
    Critical,
}

/// 心跳结束时的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    /// 收到关闭信号
    Stopped,
    /// 已发出重启请求（本进程实例的终态）
    Restarting,
}

/// 最近一次心跳的健康快照
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSnapshot {
    pub devices: Vec<DeviceStats>,
    pub peak_usage_pct: f32,
    pub level: ResourceLevel,
    pub consecutive_errors: u32,
    pub reflection_counter: u32,
    pub ticks: u64,
    /// 因内存压力被驱逐、尚未重载的槽位
    pub evicted: Vec<String>,
    pub taken_at: Option<DateTime<Utc>>,
}

/// 心跳参数
#[derive(Debug, Clone)]
pub struct HeartbeatSettings {
    pub interval: Duration,
    pub reflection_every: u32,
    pub error_threshold: u32,
    pub warn_pct: f32,
    pub critical_pct: f32,
    /// None 表示驱逐所有非决策槽位
    pub evict_slots: Option<Vec<String>>,
    pub identity: String,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl HeartbeatSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        let hb = &cfg.heartbeat;
        Self {
            interval: Duration::from_secs(hb.interval_secs.max(1)),
            reflection_every: hb.reflection_every,
            error_threshold: hb.error_threshold.max(1),
            warn_pct: hb.warn_pct,
            critical_pct: hb.critical_pct,
            evict_slots: hb.evict_slots.clone(),
            identity: cfg.app.identity.clone(),
        }
    }

    fn level(&self, usage_pct: f32) -> ResourceLevel {
        if usage_pct >= self.critical_pct {
            ResourceLevel::Critical
        } else if usage_pct >= self.warn_pct {
            ResourceLevel::Warning
        } else {
            ResourceLevel::Normal
        }
    }
}

/// 心跳循环（运行时独占自己的计数与快照）
pub struct Heartbeat {
    registry: Arc<SlotRegistry>,
    telemetry: Arc<dyn HardwareTelemetry>,
    restart: Arc<dyn RestartSignal>,
    proactive: Arc<dyn ProactiveHook>,
    events: EventBus,
    settings: HeartbeatSettings,

    snapshot: HealthSnapshot,
    snapshot_tx: watch::Sender<HealthSnapshot>,
    evicted: HashSet<String>,
    reflection: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn new(
        registry: Arc<SlotRegistry>,
        telemetry: Arc<dyn HardwareTelemetry>,
        restart: Arc<dyn RestartSignal>,
        proactive: Arc<dyn ProactiveHook>,
        events: EventBus,
        settings: HeartbeatSettings,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(HealthSnapshot::default());
        Self {
            registry,
            telemetry,
            restart,
            proactive,
            events,
            settings,
            snapshot: HealthSnapshot::default(),
            snapshot_tx,
            evicted: HashSet::new(),
            reflection: None,
        }
    }

    /// 订阅健康快照
    pub fn snapshots(&self) -> watch::Receiver<HealthSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> &HealthSnapshot {
        &self.snapshot
    }

    /// 主循环：直到关闭或发出重启请求
    pub async fn run(mut self, shutdown: CancellationToken) -> HeartbeatState {
        tracing::info!(
            "Heartbeat started (interval {:?}, error threshold {})",
            self.settings.interval,
            self.settings.error_threshold
        );
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            // 进行中的 tick 跑完再检查取消，重载不会停在半途
            let result = self.tick().await;
            if self.handle_tick_result(result) {
                self.abort_reflection();
                return HeartbeatState::Restarting;
            }
        }

        self.abort_reflection();
        tracing::info!("Heartbeat stopped");
        HeartbeatState::Stopped
    }

    fn abort_reflection(&mut self) {
        if let Some(handle) = self.reflection.take() {
            handle.abort();
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot.clone());
    }

    /// 处理一个周期的结果；返回 true 表示已发出重启请求
    fn handle_tick_result(&mut self, result: Result<(), HeartbeatError>) -> bool {
        let restart_reason = match result {
            Ok(()) => {
                self.snapshot.consecutive_errors = 0;
                None
            }
            Err(HeartbeatError::Fatal(fatal)) => {
                tracing::error!("Heartbeat fatal: {}", fatal);
                Some(fatal.to_string())
            }
            Err(e) => {
                self.snapshot.consecutive_errors += 1;
                let count = self.snapshot.consecutive_errors;
                tracing::error!(
                    "Heartbeat error ({}/{}): {}",
                    count,
                    self.settings.error_threshold,
                    e
                );
                (count >= self.settings.error_threshold)
                    .then(|| SupervisorFatal::ConsecutiveErrors { count }.to_string())
            }
        };
        self.publish();

        match restart_reason {
            Some(reason) => {
                self.restart.request_restart(&reason);
                true
            }
            None => false,
        }
    }

    /// 执行一个周期
    pub async fn tick(&mut self) -> Result<(), HeartbeatError> {
        self.snapshot.ticks += 1;
        self.snapshot.taken_at = Some(Utc::now());

        self.registry.sweep_dead();
        let level = self.check_resources().await?;
        self.check_health(level).await?;
        self.maybe_reflect();
        Ok(())
    }

    async fn read_telemetry(&self) -> Result<Vec<DeviceStats>, TelemetryError> {
        let telemetry = Arc::clone(&self.telemetry);
        tokio::task::spawn_blocking(move || telemetry.stats())
            .await
            .map_err(|e| TelemetryError::Probe(e.to_string()))?
    }

    async fn check_resources(&mut self) -> Result<ResourceLevel, HeartbeatError> {
        let devices = self.read_telemetry().await?;
        let (peak_pct, peak_label) = peak_usage(&devices)
            .map(|d| (d.usage_pct, d.label()))
            .unwrap_or((0.0, String::new()));
        let level = self.settings.level(peak_pct);

        self.snapshot.devices = devices;
        self.snapshot.peak_usage_pct = peak_pct;
        self.snapshot.level = level;

        match level {
            ResourceLevel::Normal => {
                if !self.evicted.is_empty() {
                    tracing::info!("Memory pressure relieved, evicted slots may reload");
                    self.evicted.clear();
                }
            }
            ResourceLevel::Warning => {
                tracing::warn!("{} usage at {:.1}% (warn {:.1}%)", peak_label, peak_pct, self.settings.warn_pct);
            }
            ResourceLevel::Critical => {
                tracing::error!(
                    "{} usage at {:.1}% (critical {:.1}%), evicting auxiliary slots",
                    peak_label,
                    peak_pct,
                    self.settings.critical_pct
                );
                let targets = self.eviction_targets();
                let report = self.registry.evict(&targets).await;
                self.evicted.extend(report.evicted.iter().cloned());
                self.events.emit(SystemEvent::ResourceCritical {
                    device: peak_label,
                    usage_pct: peak_pct,
                    evicted: report.evicted,
                });
            }
        }

        let mut evicted: Vec<String> = self.evicted.iter().cloned().collect();
        evicted.sort();
        self.snapshot.evicted = evicted;
        Ok(level)
    }

    fn eviction_targets(&self) -> Vec<String> {
        match self.settings.evict_slots {
            Some(ref names) => names.clone(),
            None => self
                .registry
                .status()
                .into_iter()
                .filter(|s| s.role != SlotRole::Decision)
                .map(|s| s.name)
                .collect(),
        }
    }

    async fn check_health(&mut self, level: ResourceLevel) -> Result<(), HeartbeatError> {
        for status in self.registry.status() {
            if !status.enabled || status.phase != SlotPhase::Unloaded {
                continue;
            }
            if self.evicted.contains(&status.name) && level >= ResourceLevel::Warning {
                tracing::debug!("Slot {} held back until memory pressure drops", status.name);
                continue;
            }

            tracing::warn!("Slot {} is not loaded, attempting reload", status.name);
            match self.registry.reload(&status.name).await {
                Ok(()) => {
                    tracing::info!("Slot {} recovered", status.name);
                    self.evicted.remove(&status.name);
                }
                Err(LoadError::InTransition(_)) | Err(LoadError::Busy(_)) => {}
                Err(e) if status.role == SlotRole::Decision => {
                    return Err(SupervisorFatal::DecisionSlotLost {
                        slot: status.name,
                        source: e,
                    }
                    .into());
                }
                Err(e) => {
                    tracing::warn!("Slot {} reload failed, tolerated: {}", status.name, e);
                    self.events.emit(SystemEvent::SlotLost {
                        slot: status.name,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn maybe_reflect(&mut self) {
        if self.settings.reflection_every == 0 {
            return;
        }
        self.snapshot.reflection_counter += 1;
        if self.snapshot.reflection_counter < self.settings.reflection_every {
            return;
        }
        self.snapshot.reflection_counter = 0;

        if self.reflection.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::debug!("Previous reflection still running, skipping");
            return;
        }
        let Some(lease) = self.registry.get_role(SlotRole::Decision) else {
            return;
        };

        let prompt = prompts::reflection(&self.settings.identity, &Local::now());
        let params = lease
            .params()
            .clone()
            .with_max_tokens(10)
            .with_temperature(0.3);
        let hook = Arc::clone(&self.proactive);
        self.reflection = Some(tokio::spawn(async move {
            let result = lease.generate_with(prompt, params).await;
            drop(lease);
            match result {
                Ok(answer) => {
                    let answer = answer.trim();
                    tracing::debug!("Reflection answer: {}", answer);
                    if answer.to_uppercase().starts_with('Y') {
                        hook.on_proactive(answer).await;
                    }
                }
                Err(e) => tracing::warn!("Reflection failed: {}", e),
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::core::worker_pool::WorkerPool;
    use crate::slots::{ScriptedEngine, SlotDescriptor};
    use crate::telemetry::FixedTelemetry;

    #[derive(Default)]
    struct CountingRestart {
        count: AtomicUsize,
        reasons: Mutex<Vec<String>>,
    }

    impl RestartSignal for CountingRestart {
        fn request_restart(&self, reason: &str) {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.reasons.lock().unwrap().push(reason.to_string());
        }
    }

    #[derive(Default)]
    struct CountingHook {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ProactiveHook for CountingHook {
        async fn on_proactive(&self, _reflection: &str) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Rig {
        registry: Arc<SlotRegistry>,
        telemetry: Arc<FixedTelemetry>,
        restart: Arc<CountingRestart>,
        hook: Arc<CountingHook>,
        engines: Vec<Arc<ScriptedEngine>>,
        events: EventBus,
    }

    impl Rig {
        async fn new(usage_pct: f32, engines: Vec<(SlotDescriptor, ScriptedEngine)>) -> Self {
            let mut registry = SlotRegistry::new(Arc::new(WorkerPool::new(2)));
            let mut handles = Vec::new();
            for (desc, engine) in engines {
                let engine = Arc::new(engine);
                handles.push(engine.clone());
                registry.register(desc, engine).unwrap();
            }
            registry.boot_all().await;
            Self {
                registry: Arc::new(registry),
                telemetry: Arc::new(FixedTelemetry::single_gpu(usage_pct)),
                restart: Arc::new(CountingRestart::default()),
                hook: Arc::new(CountingHook::default()),
                engines: handles,
                events: EventBus::default(),
            }
        }

        fn heartbeat(&self, settings: HeartbeatSettings) -> Heartbeat {
            Heartbeat::new(
                self.registry.clone(),
                self.telemetry.clone(),
                self.restart.clone(),
                self.hook.clone(),
                self.events.clone(),
                settings,
            )
        }
    }

    fn three_slots() -> Vec<(SlotDescriptor, ScriptedEngine)> {
        vec![
            (SlotDescriptor::new("king", SlotRole::Decision), ScriptedEngine::new().with_reply("YES")),
            (SlotDescriptor::new("prince", SlotRole::Analysis), ScriptedEngine::new()),
            (SlotDescriptor::new("valet", SlotRole::Synthesis), ScriptedEngine::new()),
        ]
    }

    fn settings() -> HeartbeatSettings {
        HeartbeatSettings {
            interval: Duration::from_secs(10),
            reflection_every: 0,
            error_threshold: 3,
            warn_pct: 85.0,
            critical_pct: 94.0,
            evict_slots: None,
            identity: "SoulCore".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failed_ticks_restart_exactly_once() {
        let rig = Rig::new(50.0, three_slots()).await;
        rig.telemetry.set_failing(true);
        let hb = rig.heartbeat(settings());
        let snapshots = hb.snapshots();

        let state = hb.run(CancellationToken::new()).await;
        assert_eq!(state, HeartbeatState::Restarting);
        assert_eq!(rig.restart.count.load(Ordering::SeqCst), 1);
        assert!(rig.restart.reasons.lock().unwrap()[0].contains("3 consecutive"));
        assert_eq!(snapshots.borrow().consecutive_errors, 3);
    }

    #[tokio::test]
    async fn test_success_resets_error_counter() {
        let rig = Rig::new(50.0, three_slots()).await;
        let mut hb = rig.heartbeat(settings());
        let fail = || Err(HeartbeatError::Telemetry(TelemetryError::Probe("x".into())));

        assert!(!hb.handle_tick_result(fail()));
        assert!(!hb.handle_tick_result(fail()));
        assert!(!hb.handle_tick_result(Ok(())));
        assert!(!hb.handle_tick_result(fail()));
        assert!(!hb.handle_tick_result(fail()));
        assert_eq!(rig.restart.count.load(Ordering::SeqCst), 0);
        assert!(hb.handle_tick_result(fail()));
        assert_eq!(rig.restart.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_critical_usage_evicts_only_designated_slots() {
        let rig = Rig::new(96.0, three_slots()).await;
        let mut events = rig.events.subscribe();
        let mut hb = rig.heartbeat(HeartbeatSettings {
            evict_slots: Some(vec!["valet".to_string()]),
            ..settings()
        });

        hb.tick().await.unwrap();
        assert!(rig.registry.is_available("king"));
        assert!(rig.registry.is_available("prince"));
        assert!(!rig.registry.is_available("valet"));
        assert_eq!(hb.snapshot().level, ResourceLevel::Critical);
        assert_eq!(hb.snapshot().evicted, vec!["valet"]);

        match events.recv().await.unwrap() {
            SystemEvent::ResourceCritical { evicted, usage_pct, .. } => {
                assert_eq!(evicted, vec!["valet"]);
                assert_eq!(usage_pct, 96.0);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_default_eviction_spares_decision_slot() {
        let rig = Rig::new(96.0, three_slots()).await;
        let mut hb = rig.heartbeat(settings());
        hb.tick().await.unwrap();
        assert_eq!(rig.registry.loaded_names(), vec!["king"]);
    }

    #[tokio::test]
    async fn test_evicted_slot_held_back_until_pressure_drops() {
        let rig = Rig::new(96.0, three_slots()).await;
        let mut hb = rig.heartbeat(HeartbeatSettings {
            evict_slots: Some(vec!["valet".to_string()]),
            ..settings()
        });
        hb.tick().await.unwrap();

        rig.telemetry.set_usage(90.0);
        hb.tick().await.unwrap();
        assert!(!rig.registry.is_available("valet"));

        rig.telemetry.set_usage(40.0);
        hb.tick().await.unwrap();
        assert!(rig.registry.is_available("valet"));
        assert!(hb.snapshot().evicted.is_empty());
    }

    #[tokio::test]
    async fn test_crashed_auxiliary_slot_is_reloaded() {
        let rig = Rig::new(30.0, three_slots()).await;
        let mut hb = rig.heartbeat(settings());
        rig.engines[1].crash();

        hb.tick().await.unwrap();
        assert!(rig.registry.is_available("prince"));
        assert_eq!(rig.engines[1].load_calls(), 2);
    }

    #[tokio::test]
    async fn test_auxiliary_reload_failure_is_tolerated() {
        let rig = Rig::new(30.0, three_slots()).await;
        let mut events = rig.events.subscribe();
        let mut hb = rig.heartbeat(settings());
        rig.engines[2].crash();
        rig.engines[2].set_failing_loads(u32::MAX);

        hb.tick().await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            SystemEvent::SlotLost { ref slot, .. } if slot == "valet"
        ));
        assert_eq!(rig.restart.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_decision_reload_failure_restarts_immediately() {
        let rig = Rig::new(30.0, three_slots()).await;
        rig.engines[0].crash();
        rig.engines[0].set_failing_loads(u32::MAX);
        let hb = rig.heartbeat(settings());

        let state = hb.run(CancellationToken::new()).await;
        assert_eq!(state, HeartbeatState::Restarting);
        assert_eq!(rig.restart.count.load(Ordering::SeqCst), 1);
        assert!(rig.restart.reasons.lock().unwrap()[0].contains("king"));
    }

    #[tokio::test]
    async fn test_disabled_slot_never_reloaded() {
        let rig = Rig::new(
            30.0,
            vec![
                (SlotDescriptor::new("king", SlotRole::Decision), ScriptedEngine::new()),
                (
                    SlotDescriptor::new("interpreter", SlotRole::Translation).disabled(),
                    ScriptedEngine::new(),
                ),
            ],
        )
        .await;
        let mut hb = rig.heartbeat(settings());
        hb.tick().await.unwrap();
        hb.tick().await.unwrap();
        assert_eq!(rig.engines[1].load_calls(), 0);
    }

    #[tokio::test]
    async fn test_reflection_calls_hook_on_yes() {
        let rig = Rig::new(30.0, three_slots()).await;
        let mut hb = rig.heartbeat(HeartbeatSettings {
            reflection_every: 2,
            ..settings()
        });

        hb.tick().await.unwrap();
        assert!(hb.reflection.is_none());
        hb.tick().await.unwrap();
        hb.reflection.take().unwrap().await.unwrap();
        assert_eq!(rig.hook.calls.load(Ordering::SeqCst), 1);
        assert_eq!(hb.snapshot().reflection_counter, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let rig = Rig::new(30.0, three_slots()).await;
        let hb = rig.heartbeat(settings());
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(hb.run(token).await, HeartbeatState::Stopped);
        assert_eq!(rig.restart.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_lets_in_flight_reload_finish() {
        let rig = Rig::new(
            50.0,
            vec![
                (SlotDescriptor::new("king", SlotRole::Decision), ScriptedEngine::new()),
                (
                    SlotDescriptor::new("prince", SlotRole::Analysis),
                    ScriptedEngine::new().with_load_delay(Duration::from_millis(150)),
                ),
            ],
        )
        .await;
        rig.engines[1].crash();

        let token = CancellationToken::new();
        let running = tokio::spawn(rig.heartbeat(settings()).run(token.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();

        assert_eq!(running.await.unwrap(), HeartbeatState::Stopped);
        assert_eq!(rig.registry.slot_status("prince").unwrap().phase, SlotPhase::Ready);
        assert_eq!(rig.engines[1].load_calls(), 2);
    }
}
