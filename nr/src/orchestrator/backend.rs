//! Subprocess backend for CLI agents
//!
//! Renders the frozen command template, injects the execution environment,
//! streams stdout/stderr to the workdir log files, and enforces the task
//! timeout as a hard wall clock. A timeout kills the child and maps to the
//! synthetic exit code 124.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use super::contracts::{read_manifest, read_task_input};

/// Synthetic exit code reported for wall-clock timeouts.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_]+)\}").expect("static regex"));

const SUPPORTED_PLACEHOLDERS: [&str; 4] = ["model", "prompt", "prompt_file", "task_manifest"];

/// Backend execution error with retryability hint.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct BackendRunError {
    pub message: String,
    pub transient: bool,
}

impl BackendRunError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

/// One backend execution request resolved by worker routing.
#[derive(Debug, Clone)]
pub struct BackendRunRequest {
    pub manifest_path: PathBuf,
    pub timeout_seconds: i64,
    pub agent: String,
    pub profile: String,
    pub model: String,
    pub command_template: String,
    pub repair_mode: bool,
}

/// Outcome of one backend execution.
#[derive(Debug, Clone)]
pub struct BackendRunResult {
    pub exit_code: i64,
    pub timed_out: bool,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

/// Backend seam; the worker and recap coordinator depend only on this.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn run(&self, request: &BackendRunRequest) -> Result<BackendRunResult, BackendRunError>;
}

/// Executes the per-task CLI command template as a subprocess.
pub struct CliAgentBackend;

#[async_trait]
impl AgentBackend for CliAgentBackend {
    async fn run(&self, request: &BackendRunRequest) -> Result<BackendRunResult, BackendRunError> {
        let manifest = read_manifest(&request.manifest_path).map_err(|error| {
            BackendRunError::terminal(format!("failed to read manifest: {error}"))
        })?;
        let task_input = read_task_input(Path::new(&manifest.task_input_path)).map_err(|error| {
            BackendRunError::terminal(format!("failed to read task input: {error}"))
        })?;

        let stdout_path = PathBuf::from(&manifest.output_stdout_path);
        let stderr_path = PathBuf::from(&manifest.output_stderr_path);
        for path in [&stdout_path, &stderr_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|error| {
                    BackendRunError::transient(format!("failed to create log dir: {error}"))
                })?;
            }
        }

        let prompt_file = Path::new(&manifest.workdir).join("input").join("task_prompt.txt");
        if let Some(parent) = prompt_file.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                BackendRunError::transient(format!("failed to create input dir: {error}"))
            })?;
        }
        std::fs::write(&prompt_file, &task_input.prompt).map_err(|error| {
            BackendRunError::transient(format!("failed to write prompt file: {error}"))
        })?;

        let argv = build_run_args(
            &request.command_template,
            &request.model,
            &task_input.prompt,
            &prompt_file,
            &request.manifest_path,
        )?;

        let stdout_file = std::fs::File::create(&stdout_path).map_err(|error| {
            BackendRunError::transient(format!("failed to open stdout log: {error}"))
        })?;
        let stderr_file = std::fs::File::create(&stderr_path).map_err(|error| {
            BackendRunError::transient(format!("failed to open stderr log: {error}"))
        })?;

        debug!(command = %argv[0], args = argv.len() - 1, "spawning agent backend");
        let mut command = tokio::process::Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .env("REPAIR_MODE", if request.repair_mode { "1" } else { "0" })
            .env("AGENT", &request.agent)
            .env("MODEL", &request.model)
            .env("MODEL_PROFILE", &request.profile)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file));

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendRunError::terminal(format!(
                    "CLI backend command not found: {}",
                    argv[0]
                )));
            }
            Err(error) => {
                return Err(BackendRunError::transient(format!(
                    "CLI backend failed to start: {error}"
                )));
            }
        };

        let timeout = Duration::from_secs(request.timeout_seconds.max(0) as u64);
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => Ok(BackendRunResult {
                exit_code: status.code().map(i64::from).unwrap_or(-1),
                timed_out: false,
                stdout_path,
                stderr_path,
            }),
            Ok(Err(error)) => Err(BackendRunError::transient(format!(
                "CLI backend wait failed: {error}"
            ))),
            Err(_elapsed) => {
                warn!(
                    command = %argv[0],
                    timeout_seconds = request.timeout_seconds,
                    "agent backend timed out; killing subprocess"
                );
                if let Err(error) = child.kill().await {
                    warn!(%error, "failed to kill timed out backend");
                }
                Ok(BackendRunResult {
                    exit_code: TIMEOUT_EXIT_CODE,
                    timed_out: true,
                    stdout_path,
                    stderr_path,
                })
            }
        }
    }
}

/// Render the command template into argv with shell quoting applied to
/// every placeholder value.
fn build_run_args(
    command_template: &str,
    model: &str,
    prompt: &str,
    prompt_file: &Path,
    manifest_path: &Path,
) -> Result<Vec<String>, BackendRunError> {
    let stripped = command_template.trim();
    if stripped.is_empty() {
        return Err(BackendRunError::terminal(
            "CLI backend command template is empty.",
        ));
    }

    for capture in PLACEHOLDER_RE.captures_iter(stripped) {
        let name = &capture[1];
        if !SUPPORTED_PLACEHOLDERS.contains(&name) {
            return Err(BackendRunError::terminal(format!(
                "Unsupported command template placeholder: {name:?}"
            )));
        }
    }
    if !stripped.contains("{prompt}") {
        return Err(BackendRunError::terminal(
            "CLI backend command template must include {prompt}.",
        ));
    }

    let quote = |value: &str| -> Result<String, BackendRunError> {
        shlex::try_quote(value)
            .map(|quoted| quoted.into_owned())
            .map_err(|error| {
                BackendRunError::terminal(format!("failed to quote command argument: {error}"))
            })
    };
    let rendered = stripped
        .replace("{model}", &quote(model)?)
        .replace("{prompt}", &quote(prompt)?)
        .replace("{prompt_file}", &quote(&prompt_file.display().to_string())?)
        .replace(
            "{task_manifest}",
            &quote(&manifest_path.display().to_string())?,
        );

    let argv = shlex::split(&rendered).unwrap_or_default();
    if argv.is_empty() {
        return Err(BackendRunError::terminal(
            "CLI backend command template rendered empty command.",
        ));
    }
    Ok(argv)
}
