//! HTML to text cleaning and URL normalization
//!
//! The cleaner is intentionally tag-agnostic: scripts and styles are cut
//! out, remaining markup is stripped, entities are decoded, and whitespace
//! is collapsed. Canonical URLs drop fragments and sort query params so
//! hashing is idempotent across feed variations.

use std::sync::LazyLock;

use regex::Regex;
use sha1::{Digest, Sha1};
use url::Url;

static SCRIPT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script>").expect("static regex")
});
static STYLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style\b[^>]*>.*?</style>").expect("static regex"));
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("static regex"));
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));
static MULTI_SLASH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/{2,}").expect("static regex"));

const FULL_CONTENT_MIN_CHARS: usize = 700;
const CONTENT_OVER_SUMMARY_MARGIN: usize = 200;

/// Output of HTML to text cleaning
#[derive(Debug, Clone)]
pub struct CleanedText {
    pub text: String,
    pub is_truncated: bool,
    pub is_full_content: bool,
    pub needs_enrichment: bool,
}

/// Clean HTML payload and infer whether full content is available.
pub fn clean_article_text(
    content_html: Option<&str>,
    summary_html: Option<&str>,
    max_chars: usize,
) -> CleanedText {
    let content_text = html_to_text(content_html.unwrap_or(""));
    let summary_text = html_to_text(summary_html.unwrap_or(""));

    let mut chosen = if content_text.is_empty() {
        summary_text.clone()
    } else {
        content_text.clone()
    };
    let mut is_full_content =
        !content_text.is_empty() && content_text.chars().count() >= FULL_CONTENT_MIN_CHARS;
    if !is_full_content && !content_text.is_empty() && !summary_text.is_empty() {
        is_full_content = content_text.chars().count()
            >= summary_text.chars().count() + CONTENT_OVER_SUMMARY_MARGIN;
    }

    let mut truncated = false;
    if chosen.chars().count() > max_chars {
        chosen = chosen.chars().take(max_chars).collect::<String>();
        chosen.truncate(chosen.trim_end().len());
        truncated = true;
    }

    CleanedText {
        text: chosen,
        is_truncated: truncated,
        is_full_content,
        needs_enrichment: !is_full_content,
    }
}

/// Convert HTML markup into normalized plain text.
pub fn html_to_text(raw_html: &str) -> String {
    if raw_html.is_empty() {
        return String::new();
    }
    let no_scripts = SCRIPT_RE.replace_all(raw_html, " ");
    let no_styles = STYLE_RE.replace_all(&no_scripts, " ");
    let stripped = TAG_RE.replace_all(&no_styles, " ");
    let unescaped = html_escape::decode_html_entities(stripped.as_ref()).into_owned();
    let normalized = WHITESPACE_RE.replace_all(&unescaped, " ");
    normalized.trim().to_string()
}

/// Normalize a URL for idempotent hashing and uniqueness checks.
pub fn canonicalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(mut parsed) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };

    let scheme = parsed.scheme().to_ascii_lowercase();
    if let Some(host) = parsed.host_str() {
        let lowered = host.to_ascii_lowercase();
        let _ = parsed.set_host(Some(&lowered));
    }
    match (scheme.as_str(), parsed.port()) {
        ("http", Some(80)) | ("https", Some(443)) => {
            let _ = parsed.set_port(None);
        }
        _ => {}
    }

    let path = MULTI_SLASH_RE.replace_all(parsed.path(), "/").into_owned();
    parsed.set_path(if path.is_empty() { "/" } else { &path });

    let mut pairs: Vec<String> = parsed
        .query()
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(str::to_string)
        .collect();
    pairs.sort();
    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.set_query(Some(&pairs.join("&")));
    }
    parsed.set_fragment(None);

    parsed.to_string()
}

/// Stable hash of the canonical URL.
pub fn url_hash(url: &str) -> String {
    let canonical = canonicalize_url(url);
    let mut hasher = Sha1::new();
    hasher.update(canonical.as_bytes());
    hex_digest(&hasher.finalize())
}

/// Normalized domain from a URL.
pub fn extract_domain(url: &str) -> String {
    Url::parse(url.trim())
        .ok()
        .and_then(|parsed| parsed.host_str().map(|host| host.to_ascii_lowercase()))
        .unwrap_or_else(|| "unknown".to_string())
}

pub(crate) fn sha1_hex(input: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input);
    hex_digest(&hasher.finalize())
}

fn hex_digest(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
