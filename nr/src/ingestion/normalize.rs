//! Source article normalization
//!
//! Turns raw source payloads into persistence-ready records: cleaned text,
//! canonical URL and hash, domain, and a coarse language guess.

use newsstore::{NormalizedArticle, SourceArticle};

use super::cleaning::{canonicalize_url, clean_article_text, extract_domain, url_hash};

/// Normalizes source articles for one source adapter.
#[derive(Debug, Clone)]
pub struct ArticleNormalizer {
    source_name: String,
    clean_text_max_chars: usize,
}

impl ArticleNormalizer {
    pub fn new(source_name: impl Into<String>, clean_text_max_chars: usize) -> Self {
        Self {
            source_name: source_name.into(),
            clean_text_max_chars,
        }
    }

    pub fn normalize(&self, article: &SourceArticle) -> NormalizedArticle {
        let cleaned = clean_article_text(
            article.content.as_deref(),
            article.summary.as_deref(),
            self.clean_text_max_chars,
        );
        let clean_text_chars = cleaned.text.chars().count() as i64;
        NormalizedArticle {
            source_name: self.source_name.clone(),
            external_id: article.external_id.clone(),
            url: article.url.clone(),
            url_canonical: canonicalize_url(&article.url),
            url_hash: url_hash(&article.url),
            title: article.title.clone(),
            source_domain: extract_domain(&article.url),
            published_at: article.published_at,
            language_detected: detect_language(&article.title, &cleaned.text),
            content_raw: article.content.clone(),
            summary_raw: article.summary.clone(),
            is_full_content: cleaned.is_full_content,
            needs_enrichment: cleaned.needs_enrichment,
            clean_text: cleaned.text,
            clean_text_chars,
            is_truncated: cleaned.is_truncated,
        }
    }
}

/// Coarse script-based language guess; enough for retention and reporting.
fn detect_language(title: &str, clean_text: &str) -> String {
    let sample: String = title.chars().chain(clean_text.chars()).take(400).collect();
    let mut cyrillic = 0usize;
    let mut latin = 0usize;
    for ch in sample.chars() {
        if ('\u{0400}'..='\u{04FF}').contains(&ch) {
            cyrillic += 1;
        } else if ch.is_ascii_alphabetic() {
            latin += 1;
        }
    }
    if cyrillic > latin {
        "ru".to_string()
    } else if latin > 0 {
        "en".to_string()
    } else {
        "und".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source_article(content: Option<&str>, summary: Option<&str>) -> SourceArticle {
        SourceArticle {
            external_id: "feed:guid-1".to_string(),
            url: "https://Example.com/a?b=2&a=1".to_string(),
            title: "Example headline".to_string(),
            source: "Example".to_string(),
            published_at: "2026-03-01T10:00:00Z".parse().unwrap(),
            content: content.map(str::to_string),
            summary: summary.map(str::to_string),
            raw_payload: json!({}),
        }
    }

    #[test]
    fn test_normalize_fills_url_fields() {
        let normalizer = ArticleNormalizer::new("rss", 12_000);
        let normalized = normalizer.normalize(&source_article(Some("<p>body</p>"), None));

        assert_eq!(normalized.source_name, "rss");
        assert_eq!(normalized.url_canonical, "https://example.com/a?a=1&b=2");
        assert_eq!(normalized.source_domain, "example.com");
        assert_eq!(normalized.clean_text, "body");
        assert_eq!(normalized.clean_text_chars, 4);
        assert!(!normalized.is_full_content);
    }

    #[test]
    fn test_normalize_language_guess() {
        let normalizer = ArticleNormalizer::new("rss", 12_000);
        let mut article = source_article(None, Some("короткая сводка новостей"));
        article.title = "Заголовок".to_string();
        let normalized = normalizer.normalize(&article);
        assert_eq!(normalized.language_detected, "ru");

        let normalized = normalizer.normalize(&source_article(None, Some("plain text")));
        assert_eq!(normalized.language_detected, "en");
    }
}
