//! Routing resolution for per-task LLM execution
//!
//! Routing is resolved once at enqueue time and frozen into the task
//! input metadata. The worker re-parses the frozen record strictly; a
//! malformed or missing payload falls back to deterministic defaults and
//! is surfaced through a `routing_fallback_applied` event.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const SUPPORTED_AGENTS: [&str; 3] = ["claude", "codex", "gemini"];
pub const SUPPORTED_PROFILES: [&str; 2] = ["fast", "quality"];
pub const ROUTING_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("Unsupported LLM agent: {0:?}. Use codex, claude, or gemini.")]
    UnsupportedAgent(String),

    #[error("Unsupported model profile: {0:?}. Use fast or quality.")]
    UnsupportedProfile(String),

    #[error("Empty command template for agent={0:?}")]
    EmptyCommandTemplate(String),

    #[error("Empty model id for agent={agent:?}, profile={profile:?}")]
    EmptyModel { agent: String, profile: String },
}

/// Resolved immutable routing payload stored in task metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrozenRouting {
    pub schema_version: i64,
    pub agent: String,
    pub profile: String,
    pub model: String,
    pub command_template: String,
    pub resolved_at: String,
    pub resolved_by: String,
}

impl FrozenRouting {
    /// Serialize for embedding under `task_input.metadata.routing`.
    pub fn to_metadata(&self) -> Value {
        serde_json::json!({
            "schema_version": self.schema_version,
            "agent": self.agent,
            "profile": self.profile,
            "model": self.model,
            "command_template": self.command_template,
            "resolved_at": self.resolved_at,
            "resolved_by": self.resolved_by,
        })
    }
}

/// Settings snapshot used for enqueue-time routing and worker fallback.
#[derive(Debug, Clone)]
pub struct RoutingDefaults {
    pub default_agent: String,
    pub task_type_profile_map: HashMap<String, String>,
    pub command_templates: HashMap<String, String>,
    pub models: HashMap<String, HashMap<String, String>>,
}

impl RoutingDefaults {
    /// Validate a defaults snapshot: every supported agent needs a
    /// non-empty template and a non-empty model per profile.
    pub fn validated(self) -> Result<Self, RoutingError> {
        let default_agent = normalize(&self.default_agent);
        validate_agent(&default_agent)?;
        for agent in SUPPORTED_AGENTS {
            let template = self
                .command_templates
                .get(agent)
                .map(|value| value.trim())
                .unwrap_or("");
            if template.is_empty() {
                return Err(RoutingError::EmptyCommandTemplate(agent.to_string()));
            }
            for profile in SUPPORTED_PROFILES {
                let model = self
                    .models
                    .get(agent)
                    .and_then(|profiles| profiles.get(profile))
                    .map(|value| value.trim())
                    .unwrap_or("");
                if model.is_empty() {
                    return Err(RoutingError::EmptyModel {
                        agent: agent.to_string(),
                        profile: profile.to_string(),
                    });
                }
            }
        }
        Ok(Self {
            default_agent,
            task_type_profile_map: self
                .task_type_profile_map
                .into_iter()
                .map(|(task_type, profile)| (normalize(&task_type), normalize(&profile)))
                .collect(),
            command_templates: self.command_templates,
            models: self.models,
        })
    }
}

/// Resolve and freeze routing at enqueue time.
pub fn resolve_routing_for_enqueue(
    defaults: &RoutingDefaults,
    task_type: &str,
    agent_override: Option<&str>,
    profile_override: Option<&str>,
    model_override: Option<&str>,
) -> Result<FrozenRouting, RoutingError> {
    let agent = match agent_override {
        Some(value) => normalize(value),
        None => defaults.default_agent.clone(),
    };
    validate_agent(&agent)?;

    let profile = match profile_override {
        Some(value) => normalize(value),
        None => defaults
            .task_type_profile_map
            .get(&normalize(task_type))
            .cloned()
            .unwrap_or_else(|| "fast".to_string()),
    };
    validate_profile(&profile)?;

    let model = match model_override {
        Some(value) => value.trim().to_string(),
        None => defaults
            .models
            .get(&agent)
            .and_then(|profiles| profiles.get(&profile))
            .map(|value| value.trim().to_string())
            .unwrap_or_default(),
    };
    if model.is_empty() {
        return Err(RoutingError::EmptyModel {
            agent: agent.clone(),
            profile: profile.clone(),
        });
    }

    let command_template = defaults
        .command_templates
        .get(&agent)
        .map(|value| value.trim().to_string())
        .unwrap_or_default();
    if command_template.is_empty() {
        return Err(RoutingError::EmptyCommandTemplate(agent));
    }

    Ok(FrozenRouting {
        schema_version: ROUTING_SCHEMA_VERSION,
        agent,
        profile,
        model,
        command_template,
        resolved_at: Utc::now().to_rfc3339(),
        resolved_by: "enqueue".to_string(),
    })
}

/// Frozen routing from task metadata, or a deterministic fallback with
/// the reason the fallback applied.
pub fn resolve_routing_for_execution(
    metadata: &Value,
    task_type: &str,
    defaults: &RoutingDefaults,
) -> Result<(FrozenRouting, Option<String>), RoutingError> {
    let reason = match metadata.get("routing") {
        Some(raw) if raw.is_object() => match parse_frozen_routing(raw) {
            Some(parsed) => return Ok((parsed, None)),
            None => "task_input.metadata.routing is invalid; applied deterministic fallback",
        },
        _ => "task_input.metadata.routing is missing; applied deterministic fallback",
    };

    let fallback = resolve_routing_for_enqueue(defaults, task_type, None, None, None)?;
    Ok((
        FrozenRouting {
            resolved_at: Utc::now().to_rfc3339(),
            resolved_by: "worker_fallback".to_string(),
            ..fallback
        },
        Some(reason.to_string()),
    ))
}

fn parse_frozen_routing(raw: &Value) -> Option<FrozenRouting> {
    if raw.get("schema_version")?.as_i64()? != ROUTING_SCHEMA_VERSION {
        return None;
    }
    let agent = normalize(non_empty_str(raw.get("agent")?)?);
    if !SUPPORTED_AGENTS.contains(&agent.as_str()) {
        return None;
    }
    let profile = normalize(non_empty_str(raw.get("profile")?)?);
    if !SUPPORTED_PROFILES.contains(&profile.as_str()) {
        return None;
    }
    let model = non_empty_str(raw.get("model")?)?.trim().to_string();
    let command_template = non_empty_str(raw.get("command_template")?)?.trim().to_string();
    let resolved_at = non_empty_str(raw.get("resolved_at")?)?.trim().to_string();
    let resolved_by = non_empty_str(raw.get("resolved_by")?)?.trim().to_string();

    Some(FrozenRouting {
        schema_version: ROUTING_SCHEMA_VERSION,
        agent,
        profile,
        model,
        command_template,
        resolved_at,
        resolved_by,
    })
}

fn non_empty_str(value: &Value) -> Option<&str> {
    let text = value.as_str()?;
    if text.trim().is_empty() {
        return None;
    }
    Some(text)
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

fn validate_agent(agent: &str) -> Result<(), RoutingError> {
    if SUPPORTED_AGENTS.contains(&agent) {
        Ok(())
    } else {
        Err(RoutingError::UnsupportedAgent(agent.to_string()))
    }
}

fn validate_profile(profile: &str) -> Result<(), RoutingError> {
    if SUPPORTED_PROFILES.contains(&profile) {
        Ok(())
    } else {
        Err(RoutingError::UnsupportedProfile(profile.to_string()))
    }
}

#[cfg(test)]
pub(crate) fn test_defaults() -> RoutingDefaults {
    let mut command_templates = HashMap::new();
    command_templates.insert(
        "codex".to_string(),
        "codex exec --model {model} {prompt}".to_string(),
    );
    command_templates.insert(
        "claude".to_string(),
        "claude -p --model {model} {prompt}".to_string(),
    );
    command_templates.insert(
        "gemini".to_string(),
        "gemini --model {model} --prompt {prompt}".to_string(),
    );

    let mut models = HashMap::new();
    for (agent, fast, quality) in [
        ("codex", "gpt-5-codex-mini", "gpt-5-codex"),
        ("claude", "sonnet", "opus"),
        ("gemini", "gemini-2.5-flash", "gemini-2.5-pro"),
    ] {
        let mut profiles = HashMap::new();
        profiles.insert("fast".to_string(), fast.to_string());
        profiles.insert("quality".to_string(), quality.to_string());
        models.insert(agent.to_string(), profiles);
    }

    let mut task_type_profile_map = HashMap::new();
    task_type_profile_map.insert("highlights".to_string(), "fast".to_string());
    task_type_profile_map.insert("story".to_string(), "quality".to_string());

    RoutingDefaults {
        default_agent: "codex".to_string(),
        task_type_profile_map,
        command_templates,
        models,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_resolution_uses_profile_map() {
        let defaults = test_defaults().validated().unwrap();
        let routing =
            resolve_routing_for_enqueue(&defaults, "story", None, None, None).unwrap();
        assert_eq!(routing.agent, "codex");
        assert_eq!(routing.profile, "quality");
        assert_eq!(routing.model, "gpt-5-codex");
        assert_eq!(routing.resolved_by, "enqueue");
        assert_eq!(routing.schema_version, ROUTING_SCHEMA_VERSION);
    }

    #[test]
    fn test_enqueue_resolution_honors_overrides() {
        let defaults = test_defaults().validated().unwrap();
        let routing = resolve_routing_for_enqueue(
            &defaults,
            "highlights",
            Some(" Claude "),
            Some("QUALITY"),
            Some("custom-model"),
        )
        .unwrap();
        assert_eq!(routing.agent, "claude");
        assert_eq!(routing.profile, "quality");
        assert_eq!(routing.model, "custom-model");
    }

    #[test]
    fn test_unknown_task_type_defaults_to_fast() {
        let defaults = test_defaults().validated().unwrap();
        let routing =
            resolve_routing_for_enqueue(&defaults, "mystery", None, None, None).unwrap();
        assert_eq!(routing.profile, "fast");
    }

    #[test]
    fn test_unsupported_agent_rejected() {
        let defaults = test_defaults().validated().unwrap();
        let error =
            resolve_routing_for_enqueue(&defaults, "highlights", Some("grok"), None, None)
                .unwrap_err();
        assert!(matches!(error, RoutingError::UnsupportedAgent(_)));
    }

    #[test]
    fn test_execution_uses_frozen_metadata() {
        let defaults = test_defaults().validated().unwrap();
        let frozen =
            resolve_routing_for_enqueue(&defaults, "highlights", Some("gemini"), None, None)
                .unwrap();
        let metadata = serde_json::json!({"routing": frozen.to_metadata()});

        let (resolved, reason) =
            resolve_routing_for_execution(&metadata, "highlights", &defaults).unwrap();
        assert_eq!(resolved, frozen);
        assert!(reason.is_none());
    }

    #[test]
    fn test_execution_falls_back_on_missing_routing() {
        let defaults = test_defaults().validated().unwrap();
        let metadata = serde_json::json!({});
        let (resolved, reason) =
            resolve_routing_for_execution(&metadata, "highlights", &defaults).unwrap();
        assert_eq!(resolved.resolved_by, "worker_fallback");
        assert!(reason.unwrap().contains("missing"));
    }

    #[test]
    fn test_execution_falls_back_on_invalid_routing() {
        let defaults = test_defaults().validated().unwrap();
        let metadata = serde_json::json!({
            "routing": {
                "schema_version": 99,
                "agent": "codex",
                "profile": "fast",
                "model": "m",
                "command_template": "c {prompt}",
                "resolved_at": "now",
                "resolved_by": "enqueue",
            }
        });
        let (resolved, reason) =
            resolve_routing_for_execution(&metadata, "highlights", &defaults).unwrap();
        assert_eq!(resolved.resolved_by, "worker_fallback");
        assert!(reason.unwrap().contains("invalid"));
    }

    #[test]
    fn test_validated_rejects_blank_template() {
        let mut defaults = test_defaults();
        defaults
            .command_templates
            .insert("gemini".to_string(), "   ".to_string());
        assert!(matches!(
            defaults.validated().unwrap_err(),
            RoutingError::EmptyCommandTemplate(_)
        ));
    }
}
