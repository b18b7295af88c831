//! Prompt templates for the recap pipeline steps
//!
//! Two placeholders are substituted at enqueue time: `{preferences}` and
//! `{max_headline_chars}`. Everything else ships verbatim to the agent.

pub const RECAP_CLASSIFY_PROMPT: &str = "\
You are triaging today's news articles one by one.

Read the task manifest for your input and output locations. The input
resources directory contains one {id}_in.txt file per article holding its
headline. The files _discard.txt and _priority.txt in the input directory
list the user's discard and priority topics.

For every {id}_in.txt file, write a matching {id}_out.txt file into the
output results directory containing exactly one word:
- trash: the headline matches a discard topic or is clearly junk
- enrich: the headline matches a priority topic or looks significant but
  thin, so the full article should be fetched
- ok: keep the article as is

User preferences:
{preferences}

When all verdict files are written, write the result file as JSON:
{\"status\": \"done\"}";

pub const RECAP_ENRICH_PROMPT: &str = "\
You are cleaning and enriching news articles.

Read the task manifest for your input and output locations. The articles
index lists the articles in scope. The input resources directory contains
one JSON file per article with freshly fetched full text.

For each article with a resource file, produce an informative rewritten
headline and a cleaned, de-duplicated body. Keep facts, drop boilerplate,
navigation debris, and repeated paragraphs.

User preferences:
{preferences}

Write the result file as JSON:
{\"enriched\": [{\"article_id\": \"<source_id>\", \"new_title\": \"...\", \"clean_text\": \"...\"}]}";

pub const RECAP_GROUP_PROMPT: &str = "\
You are grouping today's news articles into real-world events.

Read the task manifest for your input locations. The articles index lists
every article with its headline. Group articles that report the same
underlying event; an event may have a single article.

Assess each event's significance (high, medium, low) from its scope and
likely impact, and tag it with a few topic tags.

User preferences:
{preferences}

Write the result file as JSON:
{\"events\": [{\"event_id\": \"evt_001\", \"title\": \"...\", \"significance\": \"high\",
\"article_ids\": [\"<source_id>\"], \"topic_tags\": [\"...\"]}]}";

pub const RECAP_ENRICH_FULL_PROMPT: &str = "\
You are enriching the articles behind today's significant events.

Read the task manifest for your input and output locations. The input
resources directory contains one JSON file per article with its full
fetched text.

For each article, produce an informative rewritten headline and a cleaned
body that preserves every concrete fact.

User preferences:
{preferences}

Write the result file as JSON:
{\"enriched\": [{\"article_id\": \"<source_id>\", \"new_title\": \"...\", \"clean_text\": \"...\"}]}";

pub const RECAP_SYNTHESIZE_PROMPT: &str = "\
You are synthesizing per-event narratives from grouped news articles.

Read the task manifest for your input and output locations. The input
resources directory contains one event_{id}.json file per event with its
articles and their texts.

For every event, write event_{id}.json into the output results directory:
{\"event_id\": \"<id>\", \"synthesis\": \"<informative factual narrative combining all sources>\",
\"summary\": \"<2-3 sentence overview>\", \"key_facts\": [\"...\"],
\"sources_used\": [\"<source_id>\"]}

Stay factual; never invent details that are not in the sources.

User preferences:
{preferences}

When done, write the result file as JSON:
{\"status\": \"completed\", \"processed\": <number of events>}";

pub const RECAP_COMPOSE_PROMPT: &str = "\
You are composing the final daily news digest.

Read the task manifest for your input locations. The input resources
directory contains the synthesized event files. Group events into themes,
order themes by importance, and write one recap per event.

Headlines must be informative and at most {max_headline_chars} characters.
Bodies are factual event descriptions, not literary prose.

User preferences:
{preferences}

Write the result file as JSON:
{\"theme_blocks\": [{\"theme\": \"...\", \"recaps\": [{\"headline\": \"...\", \"body\": \"...\",
\"sources\": [{\"title\": \"...\", \"url\": \"...\"}]}]}],
\"meta\": {\"total_events\": 0, \"total_themes\": 0, \"date\": \"YYYY-MM-DD\"}}";

/// Prompt template for one pipeline step task type.
pub fn prompt_for_task_type(task_type: &str) -> Option<&'static str> {
    match task_type {
        "recap_classify" => Some(RECAP_CLASSIFY_PROMPT),
        "recap_enrich" => Some(RECAP_ENRICH_PROMPT),
        "recap_group" => Some(RECAP_GROUP_PROMPT),
        "recap_enrich_full" => Some(RECAP_ENRICH_FULL_PROMPT),
        "recap_synthesize" => Some(RECAP_SYNTHESIZE_PROMPT),
        "recap_compose" => Some(RECAP_COMPOSE_PROMPT),
        _ => None,
    }
}

/// Substitute the two supported placeholders.
pub fn render_prompt(template: &str, preferences: &str, max_headline_chars: usize) -> String {
    template
        .replace("{preferences}", preferences)
        .replace("{max_headline_chars}", &max_headline_chars.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_step_types_have_prompts() {
        for task_type in [
            "recap_classify",
            "recap_enrich",
            "recap_group",
            "recap_enrich_full",
            "recap_synthesize",
            "recap_compose",
        ] {
            assert!(prompt_for_task_type(task_type).is_some(), "{task_type}");
        }
        assert!(prompt_for_task_type("highlights").is_none());
    }

    #[test]
    fn test_render_prompt_substitutes_placeholders() {
        let rendered = render_prompt(RECAP_COMPOSE_PROMPT, "no preferences", 120);
        assert!(rendered.contains("no preferences"));
        assert!(rendered.contains("at most 120 characters"));
        assert!(!rendered.contains("{preferences}"));
    }
}
