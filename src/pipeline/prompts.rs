//! 各阶段提示词模板（Llama-3 / ChatML 聊天格式）

use chrono::{DateTime, Local};

use crate::memory::{ChatRole, Passage, StoredMessage};

use super::analysis::AnalysisPayload;

fn llama3(system: &str, user: &str, prefill: &str) -> String {
    format!(
        "<|start_header_id|>system<|end_header_id|>\n\n{system}<|eot_id|>\
         <|start_header_id|>user<|end_header_id|>\n\n{user}<|eot_id|>\
         <|start_header_id|>assistant<|end_header_id|>\n\n{prefill}"
    )
}

/// 分析：输出以 `{` 预填
pub fn analysis(query: &str, now: &DateTime<Local>) -> String {
    let system = format!(
        "Task: extract metadata and intent from the user input.\n\
         Output format: STRICT JSON ONLY.\n\
         Schema: {{\"category\": \"task|fact|chat\", \"keywords\": [\"word\"], \"summary\": \"one sentence\", \
         \"day_is\": \"workday|weekend|holiday|unknown\", \"urgency\": \"low|high\"}}\n\
         Time: {}",
        now.format("%Y-%m-%d %A %H:%M")
    );
    llama3(&system, query, "{")
}

/// 综合：检索片段 + 分析结果 → 情况报告
pub fn synthesis(query: &str, passages: &[Passage], analysis: &AnalysisPayload) -> String {
    let vault = if passages.is_empty() {
        "(none)".to_string()
    } else {
        passages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join(" | ")
    };
    format!(
        "<|im_start|>system\nYou are the Valet. Compare the rules and facts below with the request \
         and write one short situational report.\n\
         VAULT: {vault}\n\
         CATEGORY: {}\n\
         DAY TYPE: {}<|im_end|>\n\
         <|im_start|>user\n{query}<|im_end|>\n\
         <|im_start|>assistant\n",
        analysis.category, analysis.day_is
    )
}

/// 决策阶段上下文
pub struct DecisionContext<'a> {
    pub identity: &'a str,
    pub user_lang: &'a str,
    pub internal_lang: &'a str,
    pub report: &'a str,
    pub facts: &'a [(String, String)],
    pub history: &'a [StoredMessage],
    pub query: &'a str,
    pub memory_trigger: &'a str,
}

/// 决策：输出以 `<note>` 预填
pub fn decision(ctx: &DecisionContext<'_>) -> String {
    let memory = if ctx.facts.is_empty() {
        "(empty)".to_string()
    } else {
        ctx.facts
            .iter()
            .map(|(_, text)| format!("- {}", text))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let history = ctx
        .history
        .iter()
        .filter_map(|m| match m.role {
            ChatRole::User => Some(format!("User: {}", m.text)),
            ChatRole::Assistant => Some(format!("{}: {}", ctx.identity, m.text)),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n");

    let language_rule = if ctx.user_lang == ctx.internal_lang {
        "Put the reply for the user in <message>.".to_string()
    } else {
        format!(
            "Put a reply written in {} in <message>, or a reply written in {} in <translate>.",
            ctx.user_lang, ctx.internal_lang
        )
    };

    let system = format!(
        "Identity: {}.\n\
         SITUATIONAL REPORT: {}\n\
         MEMORY:\n{}\n\
         RECENT CONVERSATION:\n{}\n\
         INSTRUCTION: Use <note> for internal thoughts (write {} in it if the user shared new facts or tasks). \
         Use <memory> for anything worth storing in the vault. {}",
        ctx.identity,
        if ctx.report.is_empty() { "(none)" } else { ctx.report },
        memory,
        if history.is_empty() { "(none)" } else { history.as_str() },
        ctx.memory_trigger,
        language_rule
    );
    llama3(&system, ctx.query, "<note>")
}

/// 翻译
pub fn translation(text: &str, to_lang: &str) -> String {
    let system = format!(
        "You are the Translation Gate. Translate the user's text to {}. \
         Respond ONLY with the translated text, no explanation.",
        to_lang
    );
    llama3(&system, text, "")
}

/// 事实/任务抽取：输出以 `{` 预填
pub fn extraction(query: &str) -> String {
    llama3(
        "Extract ONLY new facts and tasks into JSON.\n\
         Format: {\"memory\": \"fact\", \"tasks\": [\"task\"]}",
        query,
        "{",
    )
}

/// 心跳反思：只需要 YES / NO
pub fn reflection(identity: &str, now: &DateTime<Local>) -> String {
    let system = format!(
        "You are {}. SYSTEM_STATUS: operational. Current time: {}.",
        identity,
        now.format("%H:%M")
    );
    llama3(
        &system,
        "Do you have any proactive thought worth telling the user right now? Answer YES or NO.",
        "",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_prompt_prefills_note() {
        let facts = vec![("fact_1".to_string(), "User likes tea".to_string())];
        let ctx = DecisionContext {
            identity: "Kópé",
            user_lang: "hu",
            internal_lang: "en",
            report: "",
            facts: &facts,
            history: &[],
            query: "hello",
            memory_trigger: "TRIGGER_MEMORY",
        };
        let prompt = decision(&ctx);
        assert!(prompt.ends_with("<note>"));
        assert!(prompt.contains("- User likes tea"));
        assert!(prompt.contains("<translate>"));
        assert!(prompt.contains("TRIGGER_MEMORY"));
    }

    #[test]
    fn test_synthesis_joins_passages() {
        let passages = vec![
            Passage {
                text: "a".into(),
                score: 1.0,
                user_id: "u".into(),
                chat_id: None,
            },
            Passage {
                text: "b".into(),
                score: 0.5,
                user_id: "u".into(),
                chat_id: None,
            },
        ];
        let prompt = synthesis("q", &passages, &AnalysisPayload::default());
        assert!(prompt.contains("VAULT: a | b"));
        assert!(prompt.contains("DAY TYPE: unknown"));
    }

    #[test]
    fn test_json_prompts_prefill_brace() {
        assert!(analysis("q", &Local::now()).ends_with('{'));
        assert!(extraction("q").ends_with('{'));
    }
}
