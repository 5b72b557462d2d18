//! 指令标签解析
//!
//! 从模型原始输出中抽取 `<note>` / `<message>` / `<translate>` / `<memory>` 片段。
//! 两遍扫描：先找开标签，再从开标签之后找第一个闭标签；找不到闭标签时取到文本末尾
//! （生成被截断）。标签名大小写不敏感，片段内容去掉首尾空白。
//!
//! 可见文本（clean text）的优先级：
//! 1. 有非空 message 片段时取 message；
//! 2. 否则有非空 translate 片段时取 translate；
//! 3. 否则删除所有已知标签片段（含开闭标签，所有出现位置，未闭合的删到末尾）
//!    以及孤立的已知开/闭标签，剩余部分去掉首尾空白。
//!
//! 未知标签原样保留。

/// 已知指令标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Note,
    Message,
    Translate,
    Memory,
}

impl Tag {
    pub const ALL: [Tag; 4] = [Tag::Note, Tag::Message, Tag::Translate, Tag::Memory];

    pub fn name(&self) -> &'static str {
        match self {
            Tag::Note => "note",
            Tag::Message => "message",
            Tag::Translate => "translate",
            Tag::Memory => "memory",
        }
    }

    fn open(&self) -> String {
        format!("<{}>", self.name())
    }

    fn close(&self) -> String {
        format!("</{}>", self.name())
    }
}

/// 一次输出中抽取到的指令片段
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectiveSet {
    pub note: Option<String>,
    pub message: Option<String>,
    pub translate: Option<String>,
    pub memory: Option<String>,
    /// 按优先级规则得到的用户可见文本
    pub clean_text: String,
}

impl DirectiveSet {
    pub fn get(&self, tag: Tag) -> Option<&str> {
        match tag {
            Tag::Note => self.note.as_deref(),
            Tag::Message => self.message.as_deref(),
            Tag::Translate => self.translate.as_deref(),
            Tag::Memory => self.memory.as_deref(),
        }
    }

    /// 非空 translate 片段
    pub fn translate_target(&self) -> Option<&str> {
        non_empty(self.translate.as_deref())
    }

    /// 非空 memory 片段
    pub fn memory_entry(&self) -> Option<&str> {
        non_empty(self.memory.as_deref())
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.is_empty())
}

/// ASCII 大小写不敏感查找，返回字节偏移
fn find_ci(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let hay = haystack.as_bytes();
    let needle = needle.as_bytes();
    if from > hay.len() || needle.is_empty() || hay.len() - from < needle.len() {
        return None;
    }
    hay[from..]
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
        .map(|p| p + from)
}

/// 抽取单个标签的第一个片段
pub fn extract(text: &str, tag: Tag) -> Option<String> {
    let open = tag.open();
    let start = find_ci(text, &open, 0)? + open.len();
    let end = find_ci(text, &tag.close(), start).unwrap_or(text.len());
    Some(text[start..end].trim().to_string())
}

/// 所有已知标签片段与孤立标签的字节区间
fn tag_ranges(text: &str) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    for tag in Tag::ALL {
        let open = tag.open();
        let close = tag.close();

        let mut pos = 0;
        while let Some(start) = find_ci(text, &open, pos) {
            let body = start + open.len();
            let end = find_ci(text, &close, body)
                .map(|c| c + close.len())
                .unwrap_or(text.len());
            ranges.push((start, end));
            pos = end;
        }

        let mut pos = 0;
        while let Some(start) = find_ci(text, &close, pos) {
            ranges.push((start, start + close.len()));
            pos = start + close.len();
        }
    }

    ranges.sort_unstable();
    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// 删除全部已知标签片段后的剩余文本
pub fn strip_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, end) in tag_ranges(text) {
        out.push_str(&text[cursor..start]);
        cursor = end;
    }
    out.push_str(&text[cursor..]);
    out.trim().to_string()
}

/// 解析一段原始输出
pub fn parse(text: &str) -> DirectiveSet {
    let note = extract(text, Tag::Note);
    let message = extract(text, Tag::Message);
    let translate = extract(text, Tag::Translate);
    let memory = extract(text, Tag::Memory);

    let clean_text = if let Some(m) = non_empty(message.as_deref()) {
        m.to_string()
    } else if let Some(t) = non_empty(translate.as_deref()) {
        t.to_string()
    } else {
        strip_tags(text)
    };

    DirectiveSet {
        note,
        message,
        translate,
        memory,
        clean_text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wins_regardless_of_other_tags() {
        let set = parse("<note>thinking</note> chatter <message> Hello there </message> <memory>x</memory>");
        assert_eq!(set.clean_text, "Hello there");
        assert_eq!(set.note.as_deref(), Some("thinking"));
        assert_eq!(set.memory_entry(), Some("x"));
    }

    #[test]
    fn test_unterminated_note_runs_to_end() {
        let set = parse("<note>partial text");
        assert_eq!(set.note.as_deref(), Some("partial text"));
        assert_eq!(set.clean_text, "");
    }

    #[test]
    fn test_message_beats_translate() {
        let set = parse("<translate>B</translate><message>A</message>");
        assert_eq!(set.clean_text, "A");
        assert_eq!(set.translate_target(), Some("B"));
    }

    #[test]
    fn test_translate_used_without_message() {
        let set = parse("<note>n</note><translate>Szia</translate>");
        assert_eq!(set.clean_text, "Szia");
    }

    #[test]
    fn test_empty_message_falls_through() {
        let set = parse("<message></message><translate>B</translate>");
        assert_eq!(set.message.as_deref(), Some(""));
        assert_eq!(set.clean_text, "B");
    }

    #[test]
    fn test_strip_all_occurrences_and_keep_unknown_tags() {
        let set = parse("<note>a</note>Hello <b>world</b><note>b</note>!");
        assert_eq!(set.note.as_deref(), Some("a"));
        assert_eq!(set.clean_text, "Hello <b>world</b>!");
    }

    #[test]
    fn test_case_insensitive_tags() {
        let set = parse("<NOTE>n</Note><Message>Hi</MESSAGE>");
        assert_eq!(set.note.as_deref(), Some("n"));
        assert_eq!(set.clean_text, "Hi");
    }

    #[test]
    fn test_first_close_ends_span() {
        assert_eq!(
            extract("<note>one</note> mid <note>two</note>", Tag::Note).as_deref(),
            Some("one")
        );
    }

    #[test]
    fn test_stray_close_marker_removed() {
        assert_eq!(strip_tags("plain answer</note>"), "plain answer");
    }

    #[test]
    fn test_plain_text_passthrough() {
        let set = parse("  just words  ");
        assert!(set.note.is_none());
        assert_eq!(set.clean_text, "just words");
    }

    #[test]
    fn test_multibyte_content() {
        let set = parse("<note>gondolat</note>Árvíztűrő tükörfúrógép 🌞");
        assert_eq!(set.clean_text, "Árvíztűrő tükörfúrógép 🌞");
    }
}
