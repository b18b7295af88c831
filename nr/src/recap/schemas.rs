//! Output schema hints embedded in task manifests per pipeline step

pub const RECAP_CLASSIFY_OUTPUT_SCHEMA: &str = r#"{
  "status": "done"
}

Actual per-article verdicts go into output_results_dir as {id}_out.txt files,
each containing exactly one word: ok, enrich, or trash."#;

pub const RECAP_ENRICH_OUTPUT_SCHEMA: &str = r#"{
  "enriched": [
    {
      "article_id": "<source_id>",
      "new_title": "<informative headline rewritten from source>",
      "clean_text": "<cleaned and de-duplicated article body>"
    }
  ]
}"#;

pub const RECAP_GROUP_OUTPUT_SCHEMA: &str = r#"{
  "events": [
    {
      "event_id": "<generated unique id, e.g. evt_001>",
      "title": "<descriptive event headline>",
      "significance": "high" | "medium" | "low",
      "article_ids": ["<source_id>", "..."],
      "topic_tags": ["<tag1>", "..."]
    }
  ]
}"#;

pub const RECAP_SYNTHESIZE_OUTPUT_SCHEMA: &str = r#"{
  "status": "completed",
  "processed": <number of events processed>
}

Additionally, write one JSON file per event to output_results_dir:

event_{event_id}.json:
{
  "event_id": "<id>",
  "synthesis": "<informative factual narrative combining all sources>",
  "summary": "<2-3 sentence overview>",
  "key_facts": ["<fact1>", "..."],
  "sources_used": ["<article_id>", "..."]
}"#;

pub const RECAP_COMPOSE_OUTPUT_SCHEMA: &str = r#"{
  "theme_blocks": [
    {
      "theme": "<thematic group name, e.g. 'Ukraine conflict'>",
      "recaps": [
        {
          "headline": "<concise informative headline>",
          "body": "<informative event description, factual not literary>",
          "sources": [
            {
              "title": "<original article title>",
              "url": "<original article URL>"
            }
          ]
        }
      ]
    }
  ],
  "meta": {
    "total_events": <N>,
    "total_themes": <N>,
    "date": "<YYYY-MM-DD>"
  }
}"#;

/// Schema hint string for one pipeline step task type.
pub fn schema_for_task_type(task_type: &str) -> Option<&'static str> {
    match task_type {
        "recap_classify" => Some(RECAP_CLASSIFY_OUTPUT_SCHEMA),
        "recap_enrich" => Some(RECAP_ENRICH_OUTPUT_SCHEMA),
        "recap_group" => Some(RECAP_GROUP_OUTPUT_SCHEMA),
        "recap_enrich_full" => Some(RECAP_ENRICH_OUTPUT_SCHEMA),
        "recap_synthesize" => Some(RECAP_SYNTHESIZE_OUTPUT_SCHEMA),
        "recap_compose" => Some(RECAP_COMPOSE_OUTPUT_SCHEMA),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enrich_variants_share_schema() {
        assert_eq!(
            schema_for_task_type("recap_enrich"),
            schema_for_task_type("recap_enrich_full")
        );
    }

    #[test]
    fn test_unknown_task_type_has_no_schema() {
        assert!(schema_for_task_type("highlights").is_none());
    }
}
