//! Post-processing of LLM output: pulling text out of loosely shaped JSON,
//! removing chatty prefixes and pinning the original opening sentence.

use serde_json::Value;

/// Fields tried after `response`, in order
const FALLBACK_FIELDS: &[&str] = &["text", "content", "generated_text", "output"];

/// Metadata fields that are never the generated text
const IGNORED_FIELDS: &[&str] = &[
    "model",
    "created_at",
    "done",
    "done_reason",
    "context",
    "total_duration",
    "load_duration",
    "prompt_eval_count",
    "prompt_eval_duration",
    "eval_count",
    "eval_duration",
    "thinking",
];

/// Prefixes models like to put before the answer. First match wins.
pub const BOILERPLATE_PREFIXES: &[&str] = &[
    "仿写：",
    "仿写文案：",
    "改写：",
    "改写文案：",
    "以下是仿写后的文案：",
    "以下为仿写结果：",
    "结果：",
    "输出：",
    "Rewritten text:",
    "Rewritten:",
    "Result:",
    "Output:",
];

/// Sentence delimiters in priority order; a line break counts as one
const OPENING_DELIMITERS: &[char] = &['。', '！', '？', '\n'];

/// Best-effort text extraction from a generate response. Never fails.
pub fn extract_response_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(extract_response_text).collect(),
        Value::Object(map) => {
            let non_empty = |key: &str| {
                map.get(key)
                    .and_then(Value::as_str)
                    .filter(|s| !s.trim().is_empty())
                    .map(str::to_string)
            };

            if let Some(text) = non_empty("response") {
                return text;
            }

            if let Some(text) = FALLBACK_FIELDS.iter().find_map(|key| non_empty(key)) {
                return text;
            }

            let candidates: Vec<(&String, &str)> = map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k, s)))
                .collect();

            if let Some((_, text)) = candidates
                .iter()
                .find(|(k, s)| !IGNORED_FIELDS.contains(&k.as_str()) && !s.trim().is_empty())
            {
                return text.to_string();
            }

            candidates
                .iter()
                .map(|(_, s)| *s)
                .filter(|s| !s.trim().is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        }
        _ => String::new(),
    }
}

/// Trim and drop at most one known prefix (case-sensitive, start of text only)
pub fn strip_boilerplate(text: &str) -> &str {
    let text = text.trim();
    BOILERPLATE_PREFIXES
        .iter()
        .find_map(|prefix| text.strip_prefix(prefix))
        .map(str::trim)
        .unwrap_or(text)
}

/// First sentence of the text including its delimiter. The first line,
/// newline included, counts as a sentence when no `。！？` appears; text
/// without any delimiter is its own opening.
pub fn opening_of(original: &str) -> &str {
    let original = original.trim();
    for delimiter in OPENING_DELIMITERS {
        if let Some(idx) = original.find(*delimiter) {
            return &original[..idx + delimiter.len_utf8()];
        }
    }
    original
}

/// Make sure `rewritten` starts exactly like `original`. A no-op on compliant text.
pub fn ensure_same_opening(original: &str, rewritten: &str) -> String {
    let opening = opening_of(original);
    let rewritten = rewritten.trim();

    if opening.is_empty() || rewritten.is_empty() || rewritten.starts_with(opening) {
        return rewritten.to_string();
    }

    format!("{}{}", opening, rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_prefers_response_field() {
        let body = json!({"model": "qwen2:1.5b", "response": "正文", "done": true});
        assert_eq!(extract_response_text(&body), "正文");
    }

    #[test]
    fn test_extract_fallback_fields() {
        let body = json!({"model": "m", "response": "", "content": "内容"});
        assert_eq!(extract_response_text(&body), "内容");

        let body = json!({"model": "m", "done_reason": "stop", "answer": "答案"});
        assert_eq!(extract_response_text(&body), "答案");
    }

    #[test]
    fn test_extract_never_fails_on_odd_shapes() {
        assert_eq!(extract_response_text(&json!("plain")), "plain");
        assert_eq!(extract_response_text(&json!(["a", "b"])), "ab");
        assert_eq!(extract_response_text(&json!(42)), "");
        assert_eq!(extract_response_text(&json!({"model": "m", "done_reason": "stop"})), "stop m");
        assert_eq!(extract_response_text(&json!({})), "");
    }

    #[test]
    fn test_strip_boilerplate_first_match_only() {
        assert_eq!(strip_boilerplate("  仿写：新的文案 "), "新的文案");
        assert_eq!(strip_boilerplate("Result: Output: text"), "Output: text");
        assert_eq!(strip_boilerplate("result: text"), "result: text");
        assert_eq!(strip_boilerplate("文案 结果：x"), "文案 结果：x");
    }

    #[test]
    fn test_opening_priority_and_fallback() {
        assert_eq!(opening_of("你好，今天天气不错。明天下雨！"), "你好，今天天气不错。");
        // '。' outranks an earlier '！'
        assert_eq!(opening_of("快看！这是第一句。"), "快看！这是第一句。");
        assert_eq!(opening_of("第一行\n第二行"), "第一行\n");
        assert_eq!(opening_of("  no delimiter at all  "), "no delimiter at all");
    }

    #[test]
    fn test_ensure_same_opening_prepends() {
        let original = "你好，今天天气不错。我们去公园吧。";
        let fixed = ensure_same_opening(original, "天气真好，一起出门。");
        assert!(fixed.starts_with("你好，"));
        assert_eq!(fixed, "你好，今天天气不错。天气真好，一起出门。");
    }

    #[test]
    fn test_line_opening_includes_the_break() {
        // Sharing the first line's text is not enough; the line must be reproduced whole.
        assert_eq!(ensure_same_opening("第一行\n第二行", "第一行改写"), "第一行\n第一行改写");
        assert_eq!(ensure_same_opening("第一行\n第二行", "第一行\n新的内容"), "第一行\n新的内容");
        assert_eq!(ensure_same_opening("没有分隔符", "另一段"), "没有分隔符另一段");
    }

    #[test]
    fn test_ensure_same_opening_is_idempotent() {
        let cases = [
            ("你好，今天天气不错。", "完全不同的内容"),
            ("第一行\n第二行", "改写"),
            ("没有分隔符", "另一段"),
            ("Hello there? ok", "fine"),
            ("你好，今天天气不错。", "你好，今天天气不错。已经合规"),
        ];
        for (original, rewritten) in cases {
            let once = ensure_same_opening(original, rewritten);
            assert!(once.starts_with(opening_of(original)), "{:?}", once);
            assert_eq!(ensure_same_opening(original, &once), once);
        }

        assert_eq!(ensure_same_opening("", "anything"), "anything");
        assert_eq!(ensure_same_opening("原文。", "   "), "");
    }
}
