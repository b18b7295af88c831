//! Agent smoke checks
//!
//! Probes each selected agent binary and optionally pushes one tiny task
//! through the real queue and worker. Any probe or run failure makes the
//! overall report fail, which the CLI maps to a non-zero exit code.

use std::path::Path;
use std::time::Duration;

use eyre::Result;
use newsstore::{LlmTaskCreate, LlmTaskStatus, Store, UserContext};
use tracing::info;

use super::backend::CliAgentBackend;
use super::contracts::{ArticleIndexEntry, TaskInput};
use super::routing::{resolve_routing_for_enqueue, RoutingDefaults};
use super::workdir::{MaterializeOptions, TaskWorkdirManager};
use super::worker::{OrchestratorWorker, WorkerConfig};

const PROBE_TIMEOUT: Duration = Duration::from_secs(20);

/// Outcome for one probed agent.
#[derive(Debug, Clone)]
pub struct AgentSmokeResult {
    pub agent: String,
    pub probe_ok: bool,
    pub run_ok: Option<bool>,
    pub detail: String,
}

impl AgentSmokeResult {
    pub fn passed(&self) -> bool {
        self.probe_ok && self.run_ok.unwrap_or(true)
    }
}

/// Aggregate smoke report.
#[derive(Debug, Clone, Default)]
pub struct SmokeReport {
    pub results: Vec<AgentSmokeResult>,
}

impl SmokeReport {
    pub fn passed(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(AgentSmokeResult::passed)
    }
}

/// Probe the agent binaries and, when `run_tasks` is set, execute one
/// end-to-end task per agent through the queue.
pub async fn run_smoke(
    db_path: &Path,
    user: &UserContext,
    workdir_root: &Path,
    defaults: &RoutingDefaults,
    agents: &[String],
    run_tasks: bool,
) -> Result<SmokeReport> {
    let mut report = SmokeReport::default();
    for agent in agents {
        let routing =
            match resolve_routing_for_enqueue(defaults, "highlights", Some(agent), None, None) {
                Ok(routing) => routing,
                Err(error) => {
                    report.results.push(AgentSmokeResult {
                        agent: agent.clone(),
                        probe_ok: false,
                        run_ok: None,
                        detail: error.to_string(),
                    });
                    continue;
                }
            };

        let (probe_ok, probe_detail) = probe_agent(&routing.command_template).await;
        info!(agent, probe_ok, "agent probe finished");
        if !probe_ok || !run_tasks {
            report.results.push(AgentSmokeResult {
                agent: agent.clone(),
                probe_ok,
                run_ok: None,
                detail: probe_detail,
            });
            continue;
        }

        let run_detail = run_single_task(db_path, user, workdir_root, defaults, agent).await;
        match run_detail {
            Ok((run_ok, detail)) => report.results.push(AgentSmokeResult {
                agent: agent.clone(),
                probe_ok,
                run_ok: Some(run_ok),
                detail,
            }),
            Err(error) => report.results.push(AgentSmokeResult {
                agent: agent.clone(),
                probe_ok,
                run_ok: Some(false),
                detail: error.to_string(),
            }),
        }
    }
    Ok(report)
}

/// Spawn `<command-head> --version` as a liveness probe.
async fn probe_agent(command_template: &str) -> (bool, String) {
    let Some(argv) = shlex::split(command_template.trim()) else {
        return (false, "unparsable command template".to_string());
    };
    let Some(head) = argv.first() else {
        return (false, "empty command template".to_string());
    };

    let spawned = tokio::process::Command::new(head)
        .arg("--version")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(error) => return (false, format!("probe spawn failed: {error}")),
    };
    match tokio::time::timeout(PROBE_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) if status.success() => (true, "probe ok".to_string()),
        Ok(Ok(status)) => (false, format!("probe exit: {status}")),
        Ok(Err(error)) => (false, format!("probe wait failed: {error}")),
        Err(_) => {
            let _ = child.kill().await;
            (false, "probe timed out".to_string())
        }
    }
}

async fn run_single_task(
    db_path: &Path,
    user: &UserContext,
    workdir_root: &Path,
    defaults: &RoutingDefaults,
    agent: &str,
) -> Result<(bool, String)> {
    let mut store = Store::open(db_path, user.clone())?;
    let workdir = TaskWorkdirManager::new(workdir_root);
    let routing = resolve_routing_for_enqueue(defaults, "highlights", Some(agent), None, None)?;

    let entry = ArticleIndexEntry {
        source_id: "article:smoke".to_string(),
        title: "Smoke check source".to_string(),
        url: "https://example.invalid/smoke".to_string(),
        source: "smoke".to_string(),
        published_at: None,
    };
    let task_id = format!("smoke-{agent}-{}", uuid::Uuid::new_v4());
    let materialized = workdir.materialize(
        &task_id,
        "highlights",
        &TaskInput {
            task_type: "highlights".to_string(),
            prompt: "Read the task manifest. Write the result file as JSON with one block: \
                     {\"blocks\": [{\"text\": \"smoke ok\", \"source_ids\": [\"article:smoke\"]}]}"
                .to_string(),
            metadata: serde_json::json!({"routing": routing.to_metadata()}),
        },
        std::slice::from_ref(&entry),
        &MaterializeOptions::default(),
    )?;

    let mut create = LlmTaskCreate::new(
        "highlights",
        materialized.manifest_path.display().to_string(),
    );
    create.task_id = Some(task_id.clone());
    create.max_attempts = 1;
    create.timeout_seconds = 300;
    create.output_path = Some(materialized.manifest.output_result_path.clone());
    store.enqueue_task(&create)?;

    let worker_store = Store::open(db_path, user.clone())?;
    let mut worker = OrchestratorWorker::new(
        worker_store,
        CliAgentBackend,
        defaults.clone(),
        WorkerConfig {
            worker_id: format!("smoke-{agent}"),
            poll_interval_seconds: 0.0,
            ..WorkerConfig::default()
        },
    );
    worker.run_once().await?;

    let details = store
        .get_task_details(&task_id)?
        .ok_or_else(|| eyre::eyre!("smoke task vanished: {task_id}"))?;
    let run_ok = details.task.status == LlmTaskStatus::Succeeded;
    let detail = match (&details.task.failure_class, &details.task.error_summary) {
        _ if run_ok => "run ok".to_string(),
        (Some(class), Some(summary)) => format!("{class}: {summary}"),
        (_, Some(summary)) => summary.clone(),
        _ => format!("task status {}", details.task.status),
    };
    Ok((run_ok, detail))
}
