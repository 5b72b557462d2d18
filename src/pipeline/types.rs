//! 管线请求 / 结果 / 诊断数据

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::analysis::AnalysisPayload;

/// 一次管线运行的输入（接受后不再变化）
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRequest {
    pub id: Uuid,
    pub query: String,
    pub chat_id: String,
    pub user_id: String,
    pub received_at: DateTime<Utc>,
}

impl PipelineRequest {
    pub fn new(query: impl Into<String>, chat_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            query: query.into(),
            chat_id: chat_id.into(),
            user_id: user_id.into(),
            received_at: Utc::now(),
        }
    }
}

fn default_chat_id() -> String {
    "default_chat".to_string()
}

fn default_user_id() -> String {
    "anonymous".to_string()
}

/// 传输层请求体：`query`（或 `message`）、`chat_id`、`user_id`
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessRequest {
    #[serde(alias = "message", default)]
    pub query: String,
    #[serde(default = "default_chat_id")]
    pub chat_id: String,
    #[serde(default = "default_user_id")]
    pub user_id: String,
}

impl ProcessRequest {
    pub fn into_request(self) -> PipelineRequest {
        PipelineRequest::new(self.query, self.chat_id, self.user_id)
    }
}

/// 运行结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// 所有可用阶段都正常完成
    Complete,
    /// 有阶段失败或回退，返回的是尽力而为的结果
    Degraded,
    /// 没有可用的决策槽位
    Unavailable,
}

/// 管线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analysis,
    Synthesis,
    TranslateIn,
    Decision,
    Extraction,
    TranslateOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    /// 输出不可用，已用默认值代替
    Fallback,
    /// 槽位不可用，阶段未执行
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageTrace {
    pub stage: Stage,
    pub status: StageStatus,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// 各阶段诊断
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    /// 分析阶段输出；阶段未执行时为 None
    pub analysis: Option<AnalysisPayload>,
    pub synthesis_report: String,
    pub note: Option<String>,
    pub facts_written: usize,
    pub stages: Vec<StageTrace>,
}

impl Diagnostics {
    pub fn stage(&self, stage: Stage) -> Option<&StageTrace> {
        self.stages.iter().find(|t| t.stage == stage)
    }

    pub(crate) fn degraded(&self) -> bool {
        self.stages
            .iter()
            .any(|t| matches!(t.status, StageStatus::Failed | StageStatus::Fallback))
    }
}

/// 一次运行的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineResult {
    pub request_id: Uuid,
    pub identity: String,
    pub chat_id: String,
    pub response: String,
    pub outcome: Outcome,
    pub diagnostics: Diagnostics,
    pub elapsed_ms: u64,
}

/// 传输层响应体
#[derive(Debug, Clone, Serialize)]
pub struct ProcessResponse {
    pub identity: String,
    pub chat_id: String,
    pub response: String,
    pub outcome: Outcome,
    pub diagnostics: Diagnostics,
    pub timing_ms: u64,
}

impl From<PipelineResult> for ProcessResponse {
    fn from(r: PipelineResult) -> Self {
        Self {
            identity: r.identity,
            chat_id: r.chat_id,
            response: r.response,
            outcome: r.outcome,
            diagnostics: r.diagnostics,
            timing_ms: r.elapsed_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_request_accepts_message_alias() {
        let req: ProcessRequest =
            serde_json::from_str(r#"{"message": "hello", "chat_id": "c1"}"#).unwrap();
        assert_eq!(req.query, "hello");
        assert_eq!(req.user_id, "anonymous");

        let req: ProcessRequest = serde_json::from_str(r#"{"query": "hi"}"#).unwrap();
        assert_eq!(req.chat_id, "default_chat");
        let pipeline_req = req.into_request();
        assert_eq!(pipeline_req.query, "hi");
    }

    #[test]
    fn test_response_serializes_outcome() {
        let resp = ProcessResponse {
            identity: "SoulCore".into(),
            chat_id: "c1".into(),
            response: "…".into(),
            outcome: Outcome::Unavailable,
            diagnostics: Diagnostics::default(),
            timing_ms: 3,
        };
        let json = serde_json::to_value(resp).unwrap();
        assert_eq!(json["outcome"], "unavailable");
        assert!(json["diagnostics"]["analysis"].is_null());
    }
}
