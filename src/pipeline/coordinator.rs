//! 管线协调器：分析 → 综合 → 决策
//!
//! 每个阶段都是可选的：槽位不可用时静默跳过并使用中性默认值；生成失败、JSON 解析失败、
//! 检索失败、翻译失败都被吸收为降级输出。一次运行只有两种"错误"：
//! - 没有可用的决策槽位 → `Outcome::Unavailable` + 占位回复（仍然是 Ok）；
//! - 内核正在关闭 → `PipelineError::ShuttingDown`。

use std::sync::Arc;
use std::time::Instant;

use chrono::{Local, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::error::{GenerationError, PipelineError};
use crate::directive::{self, DirectiveSet};
use crate::memory::{ChatRole, PersistenceStore, RetrievalProvider, StoredMessage};
use crate::slots::{SlotRegistry, SlotRole};

use super::analysis::{self, AnalysisPayload};
use super::prompts::{self, DecisionContext};
use super::types::{
    Diagnostics, Outcome, PipelineRequest, PipelineResult, Stage, StageStatus, StageTrace,
};

/// 管线运行参数
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub identity: String,
    pub user_lang: String,
    pub internal_lang: String,
    pub history_turns: usize,
    pub retrieval_limit: usize,
    pub memory_trigger: String,
    pub placeholder: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl PipelineSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            identity: cfg.app.identity.clone(),
            user_lang: cfg.app.user_lang.clone(),
            internal_lang: cfg.app.internal_lang.clone(),
            history_turns: cfg.pipeline.history_turns,
            retrieval_limit: cfg.pipeline.retrieval_limit,
            memory_trigger: cfg.pipeline.memory_trigger.clone(),
            placeholder: cfg.pipeline.placeholder.clone(),
        }
    }
}

/// 单阶段计时
struct StageClock {
    stage: Stage,
    started: Instant,
}

impl StageClock {
    fn start(stage: Stage) -> Self {
        Self {
            stage,
            started: Instant::now(),
        }
    }

    fn finish(self, status: StageStatus, detail: Option<String>) -> StageTrace {
        StageTrace {
            stage: self.stage,
            status,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            detail,
        }
    }
}

fn skipped(stage: Stage) -> StageTrace {
    StageTrace {
        stage,
        status: StageStatus::Skipped,
        elapsed_ms: 0,
        detail: None,
    }
}

/// 生成失败时：关闭错误向上传播，其余吸收
fn absorb(err: GenerationError) -> Result<String, PipelineError> {
    match err {
        GenerationError::ShuttingDown => Err(PipelineError::ShuttingDown),
        other => Ok(other.to_string()),
    }
}

/// 管线协调器
pub struct PipelineCoordinator {
    registry: Arc<SlotRegistry>,
    retrieval: Arc<dyn RetrievalProvider>,
    store: Arc<dyn PersistenceStore>,
    settings: PipelineSettings,
    shutdown: CancellationToken,
}

impl PipelineCoordinator {
    pub fn new(
        registry: Arc<SlotRegistry>,
        retrieval: Arc<dyn RetrievalProvider>,
        store: Arc<dyn PersistenceStore>,
        settings: PipelineSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            retrieval,
            store,
            settings,
            shutdown,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    fn ensure_running(&self) -> Result<(), PipelineError> {
        if self.shutdown.is_cancelled() {
            Err(PipelineError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// 执行一次完整管线
    pub async fn run(&self, request: PipelineRequest) -> Result<PipelineResult, PipelineError> {
        self.ensure_running()?;
        let started = Instant::now();
        let preview: String = request.query.chars().take(50).collect();
        tracing::info!(request_id = %request.id, chat_id = %request.chat_id, "Pipeline start: {}", preview);

        let history = if self.settings.history_turns > 0 {
            self.store
                .chat_history(&request.chat_id, self.settings.history_turns)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!("Failed to load chat history: {}", e);
                    Vec::new()
                })
        } else {
            Vec::new()
        };

        if let Err(e) = self
            .store
            .save_message(&request.chat_id, ChatRole::User, &request.query, None)
            .await
        {
            tracing::warn!("Failed to save user message: {}", e);
        }

        let mut diag = Diagnostics::default();

        if !self.registry.role_available(SlotRole::Decision) {
            tracing::warn!(request_id = %request.id, "No decision slot available, returning placeholder");
            return Ok(self.finish(&request, started, self.settings.placeholder.clone(), Outcome::Unavailable, diag));
        }

        // 1. 分析
        let analysis = self.analysis_stage(&request, &mut diag).await?;
        self.ensure_running()?;

        // 2. 综合
        let report = self.synthesis_stage(&request, &analysis, &mut diag).await?;
        diag.synthesis_report = report.clone();
        self.ensure_running()?;

        // 3. 决策
        let internal_query = self
            .translate(&request.query, &self.settings.internal_lang, Stage::TranslateIn, &mut diag)
            .await?;
        let facts = self.store.all_facts().await.unwrap_or_else(|e| {
            tracing::warn!("Failed to load facts: {}", e);
            Vec::new()
        });

        let Some(parsed) = self
            .decision_stage(&request, &report, &facts, &history, &internal_query, &mut diag)
            .await?
        else {
            // 决策槽位在分析/综合期间被卸载
            return Ok(self.finish(&request, started, self.settings.placeholder.clone(), Outcome::Unavailable, diag));
        };
        diag.note = parsed.note.clone().filter(|n| !n.is_empty());

        self.apply_side_effects(&request, &parsed, &internal_query, &mut diag).await?;

        // 4. 最终回复
        let response = match parsed.translate_target() {
            Some(text) => {
                self.translate(text, &self.settings.user_lang, Stage::TranslateOut, &mut diag)
                    .await?
            }
            None => parsed.clean_text.clone(),
        };
        let response = if response.trim().is_empty() {
            self.settings.placeholder.clone()
        } else {
            response.trim().to_string()
        };

        let outcome = if diag.degraded() || response == self.settings.placeholder {
            Outcome::Degraded
        } else {
            Outcome::Complete
        };

        let debug = json!({
            "note": diag.note,
            "report": diag.synthesis_report,
            "analysis": diag.analysis,
            "request_id": request.id.to_string(),
            "outcome": outcome,
        });
        if let Err(e) = self
            .store
            .save_message(&request.chat_id, ChatRole::Assistant, &response, Some(debug))
            .await
        {
            tracing::warn!("Failed to save assistant message: {}", e);
        }

        Ok(self.finish(&request, started, response, outcome, diag))
    }

    fn finish(
        &self,
        request: &PipelineRequest,
        started: Instant,
        response: String,
        outcome: Outcome,
        diagnostics: Diagnostics,
    ) -> PipelineResult {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(request_id = %request.id, ?outcome, "Pipeline end ({} ms)", elapsed_ms);
        PipelineResult {
            request_id: request.id,
            identity: self.settings.identity.clone(),
            chat_id: request.chat_id.clone(),
            response,
            outcome,
            diagnostics,
            elapsed_ms,
        }
    }

    async fn analysis_stage(
        &self,
        request: &PipelineRequest,
        diag: &mut Diagnostics,
    ) -> Result<AnalysisPayload, PipelineError> {
        let Some(lease) = self.registry.get_role(SlotRole::Analysis) else {
            diag.stages.push(skipped(Stage::Analysis));
            return Ok(AnalysisPayload::default());
        };

        let clock = StageClock::start(Stage::Analysis);
        let params = lease.params().clone().with_temperature(0.1);
        let payload = match lease
            .generate_with(prompts::analysis(&request.query, &Local::now()), params)
            .await
        {
            Ok(raw) => match analysis::parse_analysis(&raw) {
                Ok(payload) => {
                    diag.stages.push(clock.finish(StageStatus::Completed, None));
                    payload
                }
                Err(e) => {
                    tracing::warn!("Analysis output unparseable, using default: {}", e);
                    diag.stages.push(clock.finish(StageStatus::Fallback, Some(e.to_string())));
                    AnalysisPayload::default()
                }
            },
            Err(e) => {
                let detail = absorb(e)?;
                tracing::warn!("Analysis stage failed: {}", detail);
                diag.stages.push(clock.finish(StageStatus::Failed, Some(detail)));
                AnalysisPayload::default()
            }
        };
        tracing::debug!(?payload, "Analysis payload");
        diag.analysis = Some(payload.clone());
        Ok(payload)
    }

    async fn synthesis_stage(
        &self,
        request: &PipelineRequest,
        analysis: &AnalysisPayload,
        diag: &mut Diagnostics,
    ) -> Result<String, PipelineError> {
        let Some(lease) = self.registry.get_role(SlotRole::Synthesis) else {
            diag.stages.push(skipped(Stage::Synthesis));
            return Ok(String::new());
        };

        let clock = StageClock::start(Stage::Synthesis);
        let search = analysis.search_text(&request.query);
        let passages = self
            .retrieval
            .query(&search, Some(&request.user_id), Some(self.settings.retrieval_limit))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Retrieval failed, continuing without passages: {}", e);
                Vec::new()
            });

        let params = lease.params().clone().with_temperature(0.1);
        match lease
            .generate_with(prompts::synthesis(&request.query, &passages, analysis), params)
            .await
        {
            Ok(report) => {
                let report = report.trim().to_string();
                tracing::debug!("Situational report: {}", report);
                diag.stages.push(clock.finish(
                    StageStatus::Completed,
                    Some(format!("{} passages", passages.len())),
                ));
                Ok(report)
            }
            Err(e) => {
                let detail = absorb(e)?;
                tracing::warn!("Synthesis stage failed: {}", detail);
                diag.stages.push(clock.finish(StageStatus::Failed, Some(detail)));
                Ok(String::new())
            }
        }
    }

    /// 决策；返回 None 表示决策槽位已不可用
    async fn decision_stage(
        &self,
        request: &PipelineRequest,
        report: &str,
        facts: &[(String, String)],
        history: &[StoredMessage],
        internal_query: &str,
        diag: &mut Diagnostics,
    ) -> Result<Option<DirectiveSet>, PipelineError> {
        let Some(lease) = self.registry.get_role(SlotRole::Decision) else {
            diag.stages.push(skipped(Stage::Decision));
            return Ok(None);
        };

        let clock = StageClock::start(Stage::Decision);
        let prompt = prompts::decision(&DecisionContext {
            identity: &self.settings.identity,
            user_lang: &self.settings.user_lang,
            internal_lang: &self.settings.internal_lang,
            report,
            facts,
            history,
            query: internal_query,
            memory_trigger: &self.settings.memory_trigger,
        });

        match lease.generate(prompt).await {
            Ok(raw) => {
                // 提示词以 <note> 结尾，输出是它的续写
                let parsed = directive::parse(&format!("<note>{}", raw));
                tracing::info!(request_id = %request.id, "Decision note: {:?}", parsed.note);
                diag.stages.push(clock.finish(StageStatus::Completed, None));
                Ok(Some(parsed))
            }
            Err(e) => {
                let detail = absorb(e)?;
                tracing::error!("Decision stage failed: {}", detail);
                diag.stages.push(clock.finish(StageStatus::Failed, Some(detail)));
                Ok(Some(DirectiveSet::default()))
            }
        }
    }

    /// note / memory 片段带来的副作用：笔记入库、向量库写入、事实抽取
    async fn apply_side_effects(
        &self,
        request: &PipelineRequest,
        parsed: &DirectiveSet,
        internal_query: &str,
        diag: &mut Diagnostics,
    ) -> Result<(), PipelineError> {
        if let Some(note) = diag.note.as_deref() {
            if let Err(e) = self
                .store
                .save_message(&request.chat_id, ChatRole::InternalNote, note, None)
                .await
            {
                tracing::warn!("Failed to save internal note: {}", e);
            }
        }

        if let Some(entry) = parsed.memory_entry() {
            if let Err(e) = self
                .retrieval
                .store(entry, &request.user_id, &request.chat_id)
                .await
            {
                tracing::warn!("Failed to store memory span: {}", e);
            }
        }

        let triggered = diag
            .note
            .as_deref()
            .map(|n| n.to_lowercase().contains(&self.settings.memory_trigger.to_lowercase()))
            .unwrap_or(false);
        if triggered {
            diag.facts_written = self.extraction_stage(internal_query, diag).await?;
        }
        Ok(())
    }

    /// 事实/任务抽取，返回写入条数
    async fn extraction_stage(
        &self,
        internal_query: &str,
        diag: &mut Diagnostics,
    ) -> Result<usize, PipelineError> {
        let Some(lease) = self.registry.get_role(SlotRole::Analysis) else {
            diag.stages.push(skipped(Stage::Extraction));
            return Ok(0);
        };

        let clock = StageClock::start(Stage::Extraction);
        let params = lease
            .params()
            .clone()
            .with_temperature(0.05)
            .with_max_tokens(256);
        let raw = match lease.generate_with(prompts::extraction(internal_query), params).await {
            Ok(raw) => raw,
            Err(e) => {
                let detail = absorb(e)?;
                tracing::warn!("Extraction failed: {}", detail);
                diag.stages.push(clock.finish(StageStatus::Failed, Some(detail)));
                return Ok(0);
            }
        };
        drop(lease);

        let payload = match analysis::parse_extraction(&raw) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Extraction output unparseable: {}", e);
                diag.stages.push(clock.finish(StageStatus::Fallback, Some(e.to_string())));
                return Ok(0);
            }
        };

        let millis = Utc::now().timestamp_millis();
        let mut entries: Vec<(String, String)> = payload
            .tasks
            .iter()
            .enumerate()
            .map(|(n, task)| (format!("task_{}_{}", millis, n), format!("TASK: {}", task)))
            .collect();
        if !payload.memory.trim().is_empty() {
            entries.push((format!("fact_{}", millis), payload.memory.trim().to_string()));
        }

        let mut written = 0;
        for (key, text) in &entries {
            match self.store.set_fact(key, text).await {
                Ok(()) => written += 1,
                Err(e) => tracing::warn!("Failed to write {}: {}", key, e),
            }
        }
        tracing::info!("Extraction wrote {} entries", written);
        diag.stages.push(clock.finish(StageStatus::Completed, Some(format!("{} entries", written))));
        Ok(written)
    }

    /// 尽力翻译：同语言、无翻译槽位或失败时返回原文
    async fn translate(
        &self,
        text: &str,
        to_lang: &str,
        stage: Stage,
        diag: &mut Diagnostics,
    ) -> Result<String, PipelineError> {
        if text.trim().is_empty() || self.settings.user_lang == self.settings.internal_lang {
            return Ok(text.to_string());
        }
        let Some(lease) = self.registry.get_role(SlotRole::Translation) else {
            diag.stages.push(skipped(stage));
            return Ok(text.to_string());
        };

        let clock = StageClock::start(stage);
        let params = lease.params().clone().with_temperature(0.1);
        match lease.generate_with(prompts::translation(text, to_lang), params).await {
            Ok(out) if !out.trim().is_empty() => {
                diag.stages.push(clock.finish(StageStatus::Completed, None));
                Ok(out.trim().to_string())
            }
            Ok(_) => {
                diag.stages.push(clock.finish(StageStatus::Fallback, Some("empty translation".into())));
                Ok(text.to_string())
            }
            Err(e) => {
                let detail = absorb(e)?;
                tracing::warn!("Translation failed, using original text: {}", detail);
                diag.stages.push(clock.finish(StageStatus::Fallback, Some(detail)));
                Ok(text.to_string())
            }
        }
    }
}
