//! 结构化输出：分析负载与事实/任务抽取
//!
//! 小模型经常在 JSON 前后夹带闲聊，或者因为提示词预填了 `{` 而输出缺少开括号。
//! 解析顺序：首个 `{` 到最后一个 `}`；补一个 `{` 再截到最后一个 `}`；补齐两侧括号。
//! 全部失败时返回 ParseError，由调用方换成默认负载。

use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::ParseError;

/// 分析阶段的结构化结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisPayload {
    pub category: String,
    #[serde(deserialize_with = "string_or_list")]
    pub keywords: Vec<String>,
    pub summary: String,
    /// 日期类型（workday / weekend / holiday / unknown）
    pub day_is: String,
    #[serde(deserialize_with = "lenient_string")]
    pub urgency: String,
}

impl Default for AnalysisPayload {
    fn default() -> Self {
        Self {
            category: "chat".to_string(),
            keywords: Vec::new(),
            summary: String::new(),
            day_is: "unknown".to_string(),
            urgency: String::new(),
        }
    }
}

impl AnalysisPayload {
    /// 检索用的查询文本：有关键词用关键词，否则用原始问题
    pub fn search_text<'a>(&'a self, fallback: &'a str) -> std::borrow::Cow<'a, str> {
        if self.keywords.is_empty() {
            std::borrow::Cow::Borrowed(fallback)
        } else {
            std::borrow::Cow::Owned(self.keywords.join(" "))
        }
    }
}

/// 记忆抽取结果
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExtractionPayload {
    #[serde(deserialize_with = "lenient_string")]
    pub memory: String,
    #[serde(deserialize_with = "string_or_list")]
    pub tasks: Vec<String>,
}

impl ExtractionPayload {
    pub fn is_empty(&self) -> bool {
        self.memory.trim().is_empty() && self.tasks.is_empty()
    }
}

fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => Ok(s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()),
        Value::Array(items) => Ok(items
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect()),
        other => Err(de::Error::custom(format!("expected string or list, got {}", other))),
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(de::Error::custom(format!("expected scalar, got {}", other))),
    }
}

fn candidates(raw: &str) -> Vec<String> {
    let s = raw.trim();
    let mut out = Vec::new();
    if let (Some(start), Some(end)) = (s.find('{'), s.rfind('}')) {
        if start < end {
            out.push(s[start..=end].to_string());
        }
    }
    if let Some(end) = s.rfind('}') {
        out.push(format!("{{{}", &s[..=end]));
    }
    out.push(format!("{{{}}}", s));
    out
}

/// 从模型输出中尽力取出一个 JSON 对象并反序列化
pub fn parse_object<T: DeserializeOwned>(raw: &str) -> Result<T, ParseError> {
    let mut last_err = String::from("no JSON object found");
    for candidate in candidates(raw) {
        match serde_json::from_str::<Value>(&candidate) {
            Ok(value @ Value::Object(_)) => match serde_json::from_value(value) {
                Ok(parsed) => return Ok(parsed),
                Err(e) => last_err = e.to_string(),
            },
            Ok(_) => last_err = "not a JSON object".to_string(),
            Err(e) => last_err = e.to_string(),
        }
    }
    Err(ParseError(last_err))
}

pub fn parse_analysis(raw: &str) -> Result<AnalysisPayload, ParseError> {
    parse_object(raw)
}

pub fn parse_extraction(raw: &str) -> Result<ExtractionPayload, ParseError> {
    parse_object(raw)
}
