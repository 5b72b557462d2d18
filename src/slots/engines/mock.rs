//! 脚本化引擎（用于测试与干跑，无需模型）
//!
//! 回复来源优先级：排队的脚本回复 → responder 闭包 → 固定回复 → 回显 prompt 最后一行。
//! 可以让 load / generate 失败、模拟后端掉线、记录收到的 prompt。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::core::error::{GenerationError, LoadError};
use crate::slots::descriptor::{GenerationParams, SlotDescriptor};
use crate::slots::engine::GenerationEngine;

type Responder = Box<dyn Fn(&str) -> String + Send + Sync>;

/// 脚本化引擎
#[derive(Default)]
pub struct ScriptedEngine {
    loaded: AtomicBool,
    fixed_reply: Option<String>,
    script: Mutex<VecDeque<String>>,
    responder: Option<Responder>,
    /// 剩余需要失败的 load 次数；u32::MAX 表示永远失败
    failing_loads: AtomicU32,
    fail_generate: AtomicBool,
    delay: Option<Duration>,
    load_delay: Option<Duration>,
    generating: AtomicUsize,
    unloads_while_generating: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    load_calls: AtomicUsize,
    unload_calls: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次生成都返回同一段文本
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.fixed_reply = Some(reply.into());
        self
    }

    /// 按顺序依次返回的回复
    pub fn with_script<I, S>(self, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut script) = self.script.lock() {
            script.extend(replies.into_iter().map(Into::into));
        }
        self
    }

    /// 根据 prompt 决定回复
    pub fn with_responder(mut self, f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.responder = Some(Box::new(f));
        self
    }

    /// load 永远失败
    pub fn failing_load(self) -> Self {
        self.failing_loads.store(u32::MAX, Ordering::SeqCst);
        self
    }

    /// 接下来 n 次 load 失败，之后成功
    pub fn failing_loads(self, n: u32) -> Self {
        self.failing_loads.store(n, Ordering::SeqCst);
        self
    }

    /// 每次生成前阻塞一段时间（模拟慢模型）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 每次 load 阻塞一段时间（模拟大模型冷启动）
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    /// 运行中改写剩余失败的 load 次数
    pub fn set_failing_loads(&self, n: u32) {
        self.failing_loads.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_generate(&self, fail: bool) {
        self.fail_generate.store(fail, Ordering::SeqCst);
    }

    /// 模拟后端进程掉线：引擎不再就绪，但没有经过 unload
    pub fn crash(&self) {
        self.loaded.store(false, Ordering::SeqCst);
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    pub fn unload_calls(&self) -> usize {
        self.unload_calls.load(Ordering::SeqCst)
    }

    /// 有生成调用在途时发生的 unload 次数
    pub fn unloads_while_generating(&self) -> usize {
        self.unloads_while_generating.load(Ordering::SeqCst)
    }

    /// 收到过的全部 prompt
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn next_reply(&self, prompt: &str) -> String {
        if let Some(reply) = self.script.lock().ok().and_then(|mut s| s.pop_front()) {
            return reply;
        }
        if let Some(ref responder) = self.responder {
            return responder(prompt);
        }
        if let Some(ref reply) = self.fixed_reply {
            return reply.clone();
        }
        prompt
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .to_string()
    }
}

impl GenerationEngine for ScriptedEngine {
    fn family(&self) -> &'static str {
        "mock"
    }

    fn load(&self, descriptor: &SlotDescriptor) -> Result<(), LoadError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.load_delay {
            std::thread::sleep(delay);
        }
        let remaining = self.failing_loads.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.failing_loads.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(LoadError::Unavailable {
                slot: descriptor.name.clone(),
                reason: "scripted load failure".to_string(),
            });
        }
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn unload(&self) {
        self.unload_calls.fetch_add(1, Ordering::SeqCst);
        if self.generating.load(Ordering::SeqCst) > 0 {
            self.unloads_while_generating.fetch_add(1, Ordering::SeqCst);
        }
        self.loaded.store(false, Ordering::SeqCst);
    }

    fn generate(&self, prompt: &str, _params: &GenerationParams) -> Result<String, GenerationError> {
        if !self.loaded.load(Ordering::SeqCst) {
            return Err(GenerationError::NotLoaded("mock".to_string()));
        }
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        self.generating.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.generating.fetch_sub(1, Ordering::SeqCst);
        if self.fail_generate.load(Ordering::SeqCst) {
            return Err(GenerationError::EngineFault("scripted generation failure".to_string()));
        }
        Ok(self.next_reply(prompt))
    }

    fn is_ready(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::descriptor::SlotRole;

    fn desc() -> SlotDescriptor {
        SlotDescriptor::new("test", SlotRole::Decision)
    }

    #[test]
    fn test_generate_requires_load() {
        let engine = ScriptedEngine::new().with_reply("hi");
        let params = GenerationParams::default();
        assert!(matches!(
            engine.generate("x", &params),
            Err(GenerationError::NotLoaded(_))
        ));
        engine.load(&desc()).unwrap();
        assert_eq!(engine.generate("x", &params).unwrap(), "hi");
    }

    #[test]
    fn test_script_then_fallback() {
        let engine = ScriptedEngine::new()
            .with_script(["first", "second"])
            .with_reply("rest");
        engine.load(&desc()).unwrap();
        let params = GenerationParams::default();
        assert_eq!(engine.generate("a", &params).unwrap(), "first");
        assert_eq!(engine.generate("a", &params).unwrap(), "second");
        assert_eq!(engine.generate("a", &params).unwrap(), "rest");
        assert_eq!(engine.prompts().len(), 3);
    }

    #[test]
    fn test_failing_loads_then_succeeds() {
        let engine = ScriptedEngine::new().failing_loads(1);
        assert!(engine.load(&desc()).is_err());
        assert!(!engine.is_ready());
        assert!(engine.load(&desc()).is_ok());
        assert!(engine.is_ready());
        assert_eq!(engine.load_calls(), 2);
    }

    #[test]
    fn test_echo_last_line() {
        let engine = ScriptedEngine::new();
        engine.load(&desc()).unwrap();
        let out = engine
            .generate("line one\nline two\n\n", &GenerationParams::default())
            .unwrap();
        assert_eq!(out, "line two");
    }

    #[test]
    fn test_crash_marks_not_ready() {
        let engine = ScriptedEngine::new();
        engine.load(&desc()).unwrap();
        engine.crash();
        assert!(!engine.is_ready());
        assert_eq!(engine.unload_calls(), 0);
    }
}
