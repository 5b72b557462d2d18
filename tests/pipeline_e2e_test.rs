//! 端到端管线测试：脚本化引擎 + 内存 SQLite + 关键词检索库

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use soulcore::config::AppConfig;
    use soulcore::core::WorkerPool;
    use soulcore::memory::{ChatRole, KeywordVault, PersistenceStore, RetrievalProvider, SqliteStore};
    use soulcore::pipeline::{Stage, StageStatus};
    use soulcore::slots::{ScriptedEngine, SlotDescriptor, SlotRegistry, SlotRole};
    use soulcore::telemetry::FixedTelemetry;
    use soulcore::{Kernel, Outcome, PipelineRequest};

    struct Rig {
        kernel: Kernel,
        store: Arc<SqliteStore>,
        vault: Arc<KeywordVault>,
        decision: Arc<ScriptedEngine>,
    }

    async fn rig(decision: Option<ScriptedEngine>, analysis_reply: &str) -> Rig {
        let mut registry = SlotRegistry::new(Arc::new(WorkerPool::new(2)));
        let decision = decision.map(Arc::new);
        if let Some(ref engine) = decision {
            registry
                .register(SlotDescriptor::new("king", SlotRole::Decision), engine.clone())
                .unwrap();
        }
        registry
            .register(
                SlotDescriptor::new("prince", SlotRole::Analysis),
                Arc::new(ScriptedEngine::new().with_reply(analysis_reply)),
            )
            .unwrap();

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let vault = Arc::new(KeywordVault::new(100));
        let kernel = Kernel::builder(AppConfig::default())
            .with_registry(registry)
            .with_store(store.clone())
            .with_retrieval(vault.clone())
            .with_telemetry(Arc::new(FixedTelemetry::single_gpu(20.0)))
            .build()
            .unwrap();
        kernel.boot().await;

        Rig {
            kernel,
            store,
            vault,
            decision: decision.unwrap_or_default(),
        }
    }

    const WEATHER_ANALYSIS: &str =
        r#"{"category": "question", "keywords": ["weather", "tomorrow"], "summary": "weather forecast", "day_is": "tomorrow", "urgency": "low"}"#;

    #[tokio::test]
    async fn test_weather_question_answered_and_persisted() {
        let rig = rig(
            Some(ScriptedEngine::new().with_reply("<message>It will be sunny.</message>")),
            WEATHER_ANALYSIS,
        )
        .await;

        let result = rig
            .kernel
            .process(PipelineRequest::new("what's the weather tomorrow", "c1", "u1"))
            .await
            .unwrap();

        assert_eq!(result.response, "It will be sunny.");
        assert_eq!(result.chat_id, "c1");
        let analysis = result.diagnostics.analysis.as_ref().unwrap();
        assert_eq!(analysis.day_is, "tomorrow");
        assert_eq!(
            result.diagnostics.stage(Stage::Decision).unwrap().status,
            StageStatus::Completed
        );

        let history = rig.store.chat_history("c1", 10).await.unwrap();
        let assistant: Vec<_> = history
            .iter()
            .filter(|m| m.role == ChatRole::Assistant)
            .collect();
        assert_eq!(assistant.len(), 1);
        assert_eq!(assistant[0].text, "It will be sunny.");
        assert!(history
            .iter()
            .any(|m| m.role == ChatRole::User && m.text == "what's the weather tomorrow"));
    }

    #[tokio::test]
    async fn test_unavailable_decision_returns_placeholder() {
        let rig = rig(None, WEATHER_ANALYSIS).await;
        let placeholder = rig.kernel.config().pipeline.placeholder.clone();

        let result = rig
            .kernel
            .process(PipelineRequest::new("anyone there?", "c2", "u1"))
            .await
            .unwrap();

        assert_eq!(result.outcome, Outcome::Unavailable);
        assert_eq!(result.response, placeholder);
        assert!(result.diagnostics.analysis.is_none());
    }

    #[tokio::test]
    async fn test_decision_slot_crash_degrades_without_error() {
        let rig = rig(Some(ScriptedEngine::new().with_reply("<message>hi</message>")), WEATHER_ANALYSIS).await;
        rig.decision.set_fail_generate(true);

        let result = rig
            .kernel
            .process(PipelineRequest::new("hello", "c3", "u1"))
            .await
            .unwrap();
        assert_eq!(result.outcome, Outcome::Degraded);
        assert_eq!(result.response, rig.kernel.config().pipeline.placeholder);
    }

    #[tokio::test]
    async fn test_memory_span_reaches_retrieval_for_next_run() {
        let rig = rig(
            Some(ScriptedEngine::new().with_script([
                "</note><message>Noted.</message><memory>the user drinks green tea every morning</memory>",
                "<message>Green tea, as usual?</message>",
            ])),
            WEATHER_ANALYSIS,
        )
        .await;

        rig.kernel
            .process(PipelineRequest::new("I drink green tea every morning", "c4", "u1"))
            .await
            .unwrap();
        assert_eq!(rig.vault.len(), 1);

        let passages = rig
            .vault
            .query("green tea", Some("u1"), None)
            .await
            .unwrap();
        assert_eq!(passages.len(), 1);
        assert!(passages[0].text.contains("green tea"));

        let second = rig
            .kernel
            .process(PipelineRequest::new("what should I drink?", "c4", "u1"))
            .await
            .unwrap();
        assert_eq!(second.response, "Green tea, as usual?");
    }

    #[tokio::test]
    async fn test_bare_text_reply_is_cleaned() {
        let rig = rig(
            Some(ScriptedEngine::new().with_reply("thinking about it</note>Sure, <memory>x</memory>see you at noon.")),
            WEATHER_ANALYSIS,
        )
        .await;
        let result = rig
            .kernel
            .process(PipelineRequest::new("lunch?", "c5", "u1"))
            .await
            .unwrap();
        assert_eq!(result.diagnostics.note.as_deref(), Some("thinking about it"));
        assert_eq!(result.response, "Sure, see you at noon.");
    }
}
