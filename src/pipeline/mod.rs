//! 三阶段推理管线（分析 → 综合 → 决策）

pub mod analysis;
pub mod coordinator;
pub mod prompts;
pub mod types;

pub use analysis::{AnalysisPayload, ExtractionPayload};
pub use coordinator::{PipelineCoordinator, PipelineSettings};
pub use types::{
    Diagnostics, Outcome, PipelineRequest, PipelineResult, ProcessRequest, ProcessResponse, Stage,
    StageStatus, StageTrace,
};
