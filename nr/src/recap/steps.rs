//! Pure helpers threading outputs between recap pipeline steps

use std::collections::{HashMap, HashSet};
use std::path::Path;

use newsstore::SourceCorpusEntry;
use serde_json::Value;
use uuid::Uuid;

use crate::orchestrator::contracts::ArticleIndexEntry;

/// Events with at least this many articles are significant regardless of
/// the agent's significance grade.
pub const MIN_ARTICLES_FOR_SIGNIFICANT_EVENT: usize = 2;

/// Enrichment result for one article.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichedArticle {
    pub new_title: String,
    pub clean_text: String,
}

pub fn to_article_index(entries: &[SourceCorpusEntry]) -> Vec<ArticleIndexEntry> {
    entries
        .iter()
        .map(|entry| ArticleIndexEntry {
            source_id: entry.source_id.clone(),
            title: entry.title.clone(),
            url: entry.url.clone(),
            source: entry.source.clone(),
            published_at: Some(entry.published_at.to_rfc3339()),
        })
        .collect()
}

/// Turn a source id into a filesystem-safe string.
pub fn safe_file_id(source_id: &str) -> String {
    source_id.replace([':', '/'], "_")
}

/// One `{id}_in.txt` per article containing only the headline.
pub fn articles_to_individual_files(entries: &[SourceCorpusEntry]) -> Vec<(String, Vec<u8>)> {
    entries
        .iter()
        .map(|entry| {
            (
                format!("{}_in.txt", safe_file_id(&entry.source_id)),
                entry.title.clone().into_bytes(),
            )
        })
        .collect()
}

/// Read the `{id}_out.txt` verdict files written by the classify agent.
///
/// Each file holds one word: `ok`, `enrich`, or `trash`. A missing file
/// keeps the article. Returns (kept_ids, enrich_ids); `ok` and `enrich`
/// are both kept.
pub fn parse_classify_out_files(
    results_dir: &Path,
    entries: &[SourceCorpusEntry],
) -> (Vec<String>, Vec<String>) {
    let mut kept = Vec::new();
    let mut enrich = Vec::new();
    for entry in entries {
        let out_path = results_dir.join(format!("{}_out.txt", safe_file_id(&entry.source_id)));
        let verdict = std::fs::read_to_string(&out_path)
            .map(|raw| raw.trim().to_lowercase())
            .unwrap_or_default();
        if verdict == "trash" {
            continue;
        }
        kept.push(entry.source_id.clone());
        if verdict == "enrich" {
            enrich.push(entry.source_id.clone());
        }
    }
    (kept, enrich)
}

/// `{article_id: enrichment}` from an enrich step output payload.
pub fn parse_enrich_result(payload: &Value) -> HashMap<String, EnrichedArticle> {
    let mut result = HashMap::new();
    let Some(enriched) = payload.get("enriched").and_then(Value::as_array) else {
        return result;
    };
    for item in enriched {
        let article_id = item
            .get("article_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        result.insert(
            article_id.to_string(),
            EnrichedArticle {
                new_title: item
                    .get("new_title")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                clean_text: item
                    .get("clean_text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
        );
    }
    result
}

/// Events list from a group step output payload.
pub fn parse_group_result(payload: &Value) -> Vec<Value> {
    payload
        .get("events")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Update article titles from the enrichment pass.
pub fn merge_enriched_into_index(
    entries: &[ArticleIndexEntry],
    enriched: &HashMap<String, EnrichedArticle>,
) -> Vec<ArticleIndexEntry> {
    entries
        .iter()
        .map(|entry| {
            match enriched
                .get(&entry.source_id)
                .filter(|data| !data.new_title.is_empty())
            {
                Some(data) => ArticleIndexEntry {
                    title: data.new_title.clone(),
                    ..entry.clone()
                },
                None => entry.clone(),
            }
        })
        .collect()
}

/// Events worth full-text loading: high/medium significance or multi-article.
pub fn select_significant_events(events: &[Value]) -> Vec<Value> {
    events
        .iter()
        .filter(|event| {
            let significance = event
                .get("significance")
                .and_then(Value::as_str)
                .unwrap_or("");
            let article_count = event
                .get("article_ids")
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0);
            matches!(significance, "high" | "medium")
                || article_count >= MIN_ARTICLES_FOR_SIGNIFICANT_EVENT
        })
        .cloned()
        .collect()
}

/// Unique articles from significant events, in first-seen order.
pub fn articles_needing_full_text(
    events: &[Value],
    article_map: &HashMap<String, ArticleIndexEntry>,
) -> Vec<ArticleIndexEntry> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut result = Vec::new();
    for event in events {
        let Some(article_ids) = event.get("article_ids").and_then(Value::as_array) else {
            continue;
        };
        for article_id in article_ids.iter().filter_map(Value::as_str) {
            if seen.insert(article_id) {
                if let Some(entry) = article_map.get(article_id) {
                    result.push(entry.clone());
                }
            }
        }
    }
    result
}

/// Merge enriched texts into event payloads for synthesis.
pub fn build_event_payloads(
    events: &[Value],
    enriched: &HashMap<String, EnrichedArticle>,
    enriched_full: &HashMap<String, EnrichedArticle>,
    article_map: &HashMap<String, ArticleIndexEntry>,
) -> Vec<Value> {
    let mut payloads = Vec::with_capacity(events.len());
    for event in events {
        let mut articles_data = Vec::new();
        if let Some(article_ids) = event.get("article_ids").and_then(Value::as_array) {
            for article_id in article_ids.iter().filter_map(Value::as_str) {
                let Some(entry) = article_map.get(article_id) else {
                    continue;
                };
                let full = enriched_full.get(article_id);
                let partial = enriched.get(article_id);
                let text = full
                    .map(|data| data.clean_text.clone())
                    .filter(|text| !text.is_empty())
                    .or_else(|| partial.map(|data| data.clean_text.clone()))
                    .unwrap_or_default();
                let title = full
                    .map(|data| data.new_title.clone())
                    .filter(|title| !title.is_empty())
                    .or_else(|| {
                        partial
                            .map(|data| data.new_title.clone())
                            .filter(|title| !title.is_empty())
                    })
                    .unwrap_or_else(|| entry.title.clone());
                articles_data.push(serde_json::json!({
                    "article_id": article_id,
                    "title": title,
                    "url": entry.url,
                    "source": entry.source,
                    "text": text,
                }));
            }
        }
        payloads.push(serde_json::json!({
            "event_id": event.get("event_id").and_then(Value::as_str).unwrap_or(""),
            "title": event.get("title").and_then(Value::as_str).unwrap_or(""),
            "significance": event
                .get("significance")
                .and_then(Value::as_str)
                .unwrap_or("medium"),
            "articles": articles_data,
        }));
    }
    payloads
}

/// Serialize events as individual JSON files for LLM input.
pub fn events_to_resource_files(events: &[Value]) -> Vec<(String, Vec<u8>)> {
    events
        .iter()
        .map(|event| {
            let event_id = event
                .get("event_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()[..8].to_string());
            let rendered = serde_json::to_string_pretty(event).unwrap_or_default();
            (format!("event_{event_id}.json"), rendered.into_bytes())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn corpus_entry(source_id: &str, title: &str) -> SourceCorpusEntry {
        SourceCorpusEntry {
            source_id: source_id.to_string(),
            article_id: source_id.trim_start_matches("article:").to_string(),
            title: title.to_string(),
            url: format!("https://example.com/{source_id}"),
            source: "example.com".to_string(),
            published_at: Utc::now(),
            clean_text: String::new(),
        }
    }

    fn index_entry(source_id: &str, title: &str) -> ArticleIndexEntry {
        ArticleIndexEntry {
            source_id: source_id.to_string(),
            title: title.to_string(),
            url: format!("https://example.com/{source_id}"),
            source: "example.com".to_string(),
            published_at: None,
        }
    }

    #[test]
    fn test_safe_file_id() {
        assert_eq!(safe_file_id("article:ab/cd"), "article_ab_cd");
    }

    #[test]
    fn test_classify_files_round_trip() {
        let temp = tempdir().unwrap();
        let entries = vec![
            corpus_entry("article:a", "Keep me"),
            corpus_entry("article:b", "Enrich me"),
            corpus_entry("article:c", "Trash me"),
            corpus_entry("article:d", "No verdict"),
        ];

        let files = articles_to_individual_files(&entries);
        assert_eq!(files.len(), 4);
        assert_eq!(files[0].0, "article_a_in.txt");

        std::fs::write(temp.path().join("article_a_out.txt"), "ok").unwrap();
        std::fs::write(temp.path().join("article_b_out.txt"), " ENRICH \n").unwrap();
        std::fs::write(temp.path().join("article_c_out.txt"), "trash").unwrap();

        let (kept, enrich) = parse_classify_out_files(temp.path(), &entries);
        assert_eq!(kept, vec!["article:a", "article:b", "article:d"]);
        assert_eq!(enrich, vec!["article:b"]);
    }

    #[test]
    fn test_parse_enrich_result() {
        let payload = serde_json::json!({
            "enriched": [
                {"article_id": "article:a", "new_title": "Better", "clean_text": "Body"},
                {"article_id": "article:b"},
            ]
        });
        let parsed = parse_enrich_result(&payload);
        assert_eq!(parsed["article:a"].new_title, "Better");
        assert_eq!(parsed["article:b"], EnrichedArticle::default());
        assert!(parse_enrich_result(&serde_json::json!({})).is_empty());
    }

    #[test]
    fn test_merge_enriched_updates_titles() {
        let entries = vec![index_entry("article:a", "Old"), index_entry("article:b", "Kept")];
        let mut enriched = HashMap::new();
        enriched.insert(
            "article:a".to_string(),
            EnrichedArticle {
                new_title: "New".to_string(),
                clean_text: String::new(),
            },
        );
        let merged = merge_enriched_into_index(&entries, &enriched);
        assert_eq!(merged[0].title, "New");
        assert_eq!(merged[1].title, "Kept");
    }

    #[test]
    fn test_select_significant_events() {
        let events = vec![
            serde_json::json!({"event_id": "e1", "significance": "high", "article_ids": ["a"]}),
            serde_json::json!({"event_id": "e2", "significance": "low", "article_ids": ["a", "b"]}),
            serde_json::json!({"event_id": "e3", "significance": "low", "article_ids": ["a"]}),
        ];
        let significant = select_significant_events(&events);
        let ids: Vec<&str> = significant
            .iter()
            .map(|event| event["event_id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["e1", "e2"]);
    }

    #[test]
    fn test_articles_needing_full_text_dedupes() {
        let mut article_map = HashMap::new();
        article_map.insert("article:a".to_string(), index_entry("article:a", "A"));
        article_map.insert("article:b".to_string(), index_entry("article:b", "B"));

        let events = vec![
            serde_json::json!({"article_ids": ["article:a", "article:b"]}),
            serde_json::json!({"article_ids": ["article:a", "article:missing"]}),
        ];
        let needed = articles_needing_full_text(&events, &article_map);
        let ids: Vec<&str> = needed.iter().map(|entry| entry.source_id.as_str()).collect();
        assert_eq!(ids, vec!["article:a", "article:b"]);
    }

    #[test]
    fn test_build_event_payloads_prefers_full_enrichment() {
        let mut article_map = HashMap::new();
        article_map.insert("article:a".to_string(), index_entry("article:a", "Original"));

        let mut enriched = HashMap::new();
        enriched.insert(
            "article:a".to_string(),
            EnrichedArticle {
                new_title: "Partial title".to_string(),
                clean_text: "partial text".to_string(),
            },
        );
        let mut enriched_full = HashMap::new();
        enriched_full.insert(
            "article:a".to_string(),
            EnrichedArticle {
                new_title: "Full title".to_string(),
                clean_text: "full text".to_string(),
            },
        );

        let events = vec![serde_json::json!({
            "event_id": "e1",
            "title": "Event",
            "significance": "high",
            "article_ids": ["article:a"],
        })];
        let payloads = build_event_payloads(&events, &enriched, &enriched_full, &article_map);
        assert_eq!(payloads[0]["articles"][0]["title"], "Full title");
        assert_eq!(payloads[0]["articles"][0]["text"], "full text");

        // Without the full pass, the partial enrichment applies.
        let payloads =
            build_event_payloads(&events, &enriched, &HashMap::new(), &article_map);
        assert_eq!(payloads[0]["articles"][0]["title"], "Partial title");
    }

    #[test]
    fn test_events_to_resource_files() {
        let events = vec![serde_json::json!({"event_id": "e1", "title": "Event"})];
        let files = events_to_resource_files(&events);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "event_e1.json");
        let parsed: Value = serde_json::from_slice(&files[0].1).unwrap();
        assert_eq!(parsed["title"], "Event");
    }
}
