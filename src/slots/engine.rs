//! 生成引擎抽象
//!
//! 每种后端（llama.cpp server / 脚本化 mock）实现 GenerationEngine。
//! 所有方法都是阻塞调用，只能在 WorkerPool 的阻塞线程上执行。

use crate::core::error::{GenerationError, LoadError};

use super::descriptor::{GenerationParams, SlotDescriptor};

/// 生成引擎 trait：load / unload / generate / is_ready
pub trait GenerationEngine: Send + Sync {
    /// 后端族名（日志与状态展示）
    fn family(&self) -> &'static str;

    /// 分配引擎资源；失败后允许再次调用
    fn load(&self, descriptor: &SlotDescriptor) -> Result<(), LoadError>;

    /// 释放资源；未加载时为空操作
    fn unload(&self);

    /// 阻塞生成；未加载时返回 NotLoaded
    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String, GenerationError>;

    /// 引擎是否就绪（心跳用它检测卡死/掉线的后端）
    fn is_ready(&self) -> bool;
}
