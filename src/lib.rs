//! SoulCore - 多槽位本地模型编排内核
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、关闭与重启、阻塞线程池、系统事件、内核装配
//! - **slots**: 槽位描述、生成引擎抽象、槽位注册表
//! - **directive**: 决策输出中的 `<note>` / `<message>` / `<translate>` / `<memory>` 标签解析
//! - **pipeline**: 分析 → 综合 → 决策三阶段管线
//! - **memory**: 检索与持久化协作者
//! - **telemetry**: 硬件遥测
//! - **supervisor**: 心跳自愈与反思
//! - **web**: axum HTTP 网关（feature = "web"）

pub mod config;
pub mod core;
pub mod directive;
pub mod memory;
pub mod observability;
pub mod pipeline;
pub mod slots;
pub mod supervisor;
pub mod telemetry;
#[cfg(feature = "web")]
pub mod web;

pub use crate::core::{Kernel, KernelBuilder, KernelStatus};
pub use crate::pipeline::{Outcome, PipelineRequest, PipelineResult};
pub use crate::slots::{SlotDescriptor, SlotRegistry, SlotRole};
