//! 检索：外部相似度检索库的接口，以及内置的关键词检索实现
//!
//! 管线只依赖 RetrievalProvider；真正的向量库在进程外，这里的 KeywordVault
//! 按词重叠打分，作为未接入外部库时的默认实现。

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// 不属于任何用户的公共条目
pub const COMMON_SCOPE: &str = "common";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetrievalError {
    #[error("Retrieval backend unavailable: {0}")]
    Unavailable(String),
    #[error("Retrieval failed: {0}")]
    Backend(String),
}

/// 一条检索结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Passage {
    pub text: String,
    pub score: f32,
    pub user_id: String,
    pub chat_id: Option<String>,
}

/// 检索库 trait
#[async_trait]
pub trait RetrievalProvider: Send + Sync {
    /// 按相关度降序返回；user_id 为 None 时不限制用户
    async fn query(
        &self,
        text: &str,
        user_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Passage>, RetrievalError>;

    async fn store(&self, text: &str, user_id: &str, chat_id: &str) -> Result<(), RetrievalError>;
}

/// 空实现：不存储、永远无结果
#[derive(Clone, Default)]
pub struct NoopRetrieval;

#[async_trait]
impl RetrievalProvider for NoopRetrieval {
    async fn query(
        &self,
        _text: &str,
        _user_id: Option<&str>,
        _limit: Option<usize>,
    ) -> Result<Vec<Passage>, RetrievalError> {
        Ok(Vec::new())
    }

    async fn store(&self, _text: &str, _user_id: &str, _chat_id: &str) -> Result<(), RetrievalError> {
        Ok(())
    }
}

struct VaultEntry {
    text: String,
    tokens: HashSet<String>,
    user_id: String,
    chat_id: Option<String>,
}

/// 将文本切分为小写词集合（按非字母数字字符分割，丢弃单字符词）
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() > 1)
        .collect()
}

/// 内存关键词检索库：词重叠打分，按用户隔离，条数有上限（超出时丢弃最旧的）
#[derive(Clone)]
pub struct KeywordVault {
    entries: Arc<RwLock<Vec<VaultEntry>>>,
    max_entries: usize,
    default_limit: usize,
}

impl KeywordVault {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            max_entries: max_entries.max(1),
            default_limit: 5,
        }
    }

    pub fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit;
        self
    }

    /// 写入公共条目（所有用户可见）
    pub fn add_common(&self, text: &str) {
        self.insert(text, COMMON_SCOPE, None);
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, text: &str, user_id: &str, chat_id: Option<&str>) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let entry = VaultEntry {
            text: text.to_string(),
            tokens: tokenize_lower(text),
            user_id: user_id.to_string(),
            chat_id: chat_id.map(str::to_string),
        };
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.push(entry);
        let n = entries.len();
        if n > self.max_entries {
            entries.drain(0..n - self.max_entries);
        }
    }
}

impl Default for KeywordVault {
    fn default() -> Self {
        Self::new(2000)
    }
}

#[async_trait]
impl RetrievalProvider for KeywordVault {
    async fn query(
        &self,
        text: &str,
        user_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Passage>, RetrievalError> {
        let query_tokens = tokenize_lower(text);
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }
        let limit = limit.unwrap_or(self.default_limit);

        let entries = self
            .entries
            .read()
            .map_err(|_| RetrievalError::Backend("vault lock poisoned".to_string()))?;

        // 新条目在后，倒序遍历使同分时较新的排在前面
        let mut scored: Vec<(usize, &VaultEntry)> = entries
            .iter()
            .rev()
            .filter(|e| match user_id {
                Some(uid) => e.user_id == uid || e.user_id == COMMON_SCOPE,
                None => true,
            })
            .map(|e| (query_tokens.intersection(&e.tokens).count(), e))
            .filter(|(overlap, _)| *overlap > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        let total = query_tokens.len() as f32;
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(overlap, e)| Passage {
                text: e.text.clone(),
                score: overlap as f32 / total,
                user_id: e.user_id.clone(),
                chat_id: e.chat_id.clone(),
            })
            .collect())
    }

    async fn store(&self, text: &str, user_id: &str, chat_id: &str) -> Result<(), RetrievalError> {
        self.insert(text, user_id, Some(chat_id));
        Ok(())
    }
}
