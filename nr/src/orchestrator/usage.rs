//! Best-effort token usage extraction from agent output streams
//!
//! Structured JSON usage keys are preferred; textual key/value markers are
//! the fallback. Totals that had to be summed from parts are flagged as
//! estimated rather than reported.

use std::sync::LazyLock;

use regex::Regex;

pub const USAGE_PARSER_VERSION: &str = "v1";

static JSON_PROMPT_TOKENS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)"prompt_tokens"\s*:\s*(\d+)"#).expect("static regex"));
static JSON_COMPLETION_TOKENS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)"completion_tokens"\s*:\s*(\d+)"#).expect("static regex"));
static JSON_TOTAL_TOKENS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)"total_tokens"\s*:\s*(\d+)"#).expect("static regex"));

static CODEX_TOKENS_USED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)tokens used\s*[\r\n ]+\s*([\d,]+)").expect("static regex"));
static INPUT_TOKENS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)input[_ ]tokens?\s*[:=]\s*([\d,]+)").expect("static regex"));
static OUTPUT_TOKENS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:output|completion)[_ ]tokens?\s*[:=]\s*([\d,]+)").expect("static regex")
});
static TOTAL_TOKENS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)total[_ ]tokens?\s*[:=]\s*([\d,]+)").expect("static regex"));

/// Best-effort token usage extraction result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageExtraction {
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub usage_status: String,
    pub usage_source: String,
    pub parser_version: String,
    pub reason: Option<String>,
}

/// Extract token usage from structured or textual backend output.
pub fn extract_usage(agent: &str, stdout: &str, stderr: &str) -> UsageExtraction {
    if let Some(structured) = extract_structured(stdout, stderr) {
        return structured;
    }
    if let Some(textual) = extract_textual(agent, stdout, stderr) {
        return textual;
    }
    UsageExtraction {
        prompt_tokens: None,
        completion_tokens: None,
        total_tokens: None,
        usage_status: "unknown".to_string(),
        usage_source: "none".to_string(),
        parser_version: USAGE_PARSER_VERSION.to_string(),
        reason: Some("no_usage_markers".to_string()),
    }
}

fn extract_structured(stdout: &str, stderr: &str) -> Option<UsageExtraction> {
    for (source_name, text) in [("agent_stdout", stdout), ("agent_stderr", stderr)] {
        let prompt = extract_int(&JSON_PROMPT_TOKENS, text);
        let completion = extract_int(&JSON_COMPLETION_TOKENS, text);
        let total = extract_int(&JSON_TOTAL_TOKENS, text);
        let total_was_reported = total.is_some();
        if prompt.is_none() && completion.is_none() && total.is_none() {
            continue;
        }
        let total = total.or_else(|| sum_known(prompt, completion));
        return Some(UsageExtraction {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
            usage_status: if total_was_reported {
                "reported".to_string()
            } else {
                "estimated".to_string()
            },
            usage_source: source_name.to_string(),
            parser_version: USAGE_PARSER_VERSION.to_string(),
            reason: None,
        });
    }
    None
}

fn extract_textual(agent: &str, stdout: &str, stderr: &str) -> Option<UsageExtraction> {
    let mut prompt: Option<i64> = None;
    let mut completion: Option<i64> = None;
    let mut total: Option<i64> = None;
    let mut total_was_reported = false;
    let mut sources_used: Vec<&str> = Vec::new();

    for (source_name, text) in [("agent_stderr", stderr), ("agent_stdout", stdout)] {
        let mut source_used = false;
        if total.is_none() {
            if let Some(parsed) = extract_int(&TOTAL_TOKENS, text) {
                total = Some(parsed);
                total_was_reported = true;
                source_used = true;
            }
        }
        if prompt.is_none() {
            if let Some(parsed) = extract_int(&INPUT_TOKENS, text) {
                prompt = Some(parsed);
                source_used = true;
            }
        }
        if completion.is_none() {
            if let Some(parsed) = extract_int(&OUTPUT_TOKENS, text) {
                completion = Some(parsed);
                source_used = true;
            }
        }
        if total.is_none() && agent == "codex" {
            if let Some(parsed) = extract_int(&CODEX_TOKENS_USED, text) {
                total = Some(parsed);
                total_was_reported = true;
                source_used = true;
            }
        }
        if source_used {
            sources_used.push(source_name);
        }
    }

    if prompt.is_none() && completion.is_none() && total.is_none() {
        return None;
    }
    let total = total.or_else(|| sum_known(prompt, completion));
    let distinct: std::collections::HashSet<&str> = sources_used.iter().copied().collect();
    let usage_source = if distinct.len() > 1 {
        "both".to_string()
    } else {
        sources_used.first().copied().unwrap_or("none").to_string()
    };
    Some(UsageExtraction {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
        usage_status: if total_was_reported {
            "reported".to_string()
        } else {
            "estimated".to_string()
        },
        usage_source,
        parser_version: USAGE_PARSER_VERSION.to_string(),
        reason: None,
    })
}

fn sum_known(prompt: Option<i64>, completion: Option<i64>) -> Option<i64> {
    match (prompt, completion) {
        (None, None) => None,
        (left, right) => Some(left.unwrap_or(0) + right.unwrap_or(0)),
    }
}

fn extract_int(pattern: &Regex, text: &str) -> Option<i64> {
    let capture = pattern.captures(text)?;
    let raw = capture.get(1)?.as_str().replace(',', "");
    raw.trim().parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_json_usage_from_stdout() {
        let stdout = r#"{"usage": {"prompt_tokens": 120, "completion_tokens": 30, "total_tokens": 150}}"#;
        let usage = extract_usage("claude", stdout, "");
        assert_eq!(usage.prompt_tokens, Some(120));
        assert_eq!(usage.completion_tokens, Some(30));
        assert_eq!(usage.total_tokens, Some(150));
        assert_eq!(usage.usage_status, "reported");
        assert_eq!(usage.usage_source, "agent_stdout");
    }

    #[test]
    fn test_structured_without_total_is_estimated() {
        let stdout = r#"{"prompt_tokens": 100, "completion_tokens": 25}"#;
        let usage = extract_usage("claude", stdout, "");
        assert_eq!(usage.total_tokens, Some(125));
        assert_eq!(usage.usage_status, "estimated");
    }

    #[test]
    fn test_textual_markers_with_commas() {
        let stderr = "input_tokens: 1,200\noutput tokens = 340";
        let usage = extract_usage("gemini", "", stderr);
        assert_eq!(usage.prompt_tokens, Some(1200));
        assert_eq!(usage.completion_tokens, Some(340));
        assert_eq!(usage.total_tokens, Some(1540));
        assert_eq!(usage.usage_source, "agent_stderr");
        assert_eq!(usage.usage_status, "estimated");
    }

    #[test]
    fn test_codex_tokens_used_marker() {
        let stderr = "tokens used\n 4,321";
        let usage = extract_usage("codex", "", stderr);
        assert_eq!(usage.total_tokens, Some(4321));
        assert_eq!(usage.usage_status, "reported");

        // Non-codex agents ignore the marker.
        let usage = extract_usage("claude", "", stderr);
        assert_eq!(usage.usage_source, "none");
        assert!(usage.total_tokens.is_none());
    }

    #[test]
    fn test_sources_combined_reports_both() {
        let stdout = "output_tokens: 10";
        let stderr = "input_tokens: 20";
        let usage = extract_usage("gemini", stdout, stderr);
        assert_eq!(usage.usage_source, "both");
        assert_eq!(usage.total_tokens, Some(30));
    }

    #[test]
    fn test_no_markers_is_unknown() {
        let usage = extract_usage("codex", "plain output", "plain errors");
        assert_eq!(usage.usage_status, "unknown");
        assert_eq!(usage.usage_source, "none");
        assert_eq!(usage.reason.as_deref(), Some("no_usage_markers"));
    }
}
