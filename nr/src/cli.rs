//! CLI command definitions and execution

use std::path::PathBuf;

use chrono::{Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use eyre::{eyre, Context, Result};
use newsstore::{LlmTaskCreate, LlmTaskStatus, Store, UserContext};
use tracing::warn;

use crate::config::Config;
use crate::ingestion::dedup::{build_embedder, DedupStage};
use crate::ingestion::rss::{HttpFeedTransport, RssSource};
use crate::ingestion::IngestionOrchestrator;
use crate::orchestrator::backend::CliAgentBackend;
use crate::orchestrator::contracts::TaskInput;
use crate::orchestrator::routing::resolve_routing_for_enqueue;
use crate::orchestrator::smoke::run_smoke;
use crate::orchestrator::workdir::{MaterializeOptions, TaskWorkdirManager};
use crate::orchestrator::worker::OrchestratorWorker;
use crate::recap::resources::HttpResourceLoader;
use crate::recap::steps::to_article_index;
use crate::recap::{RecapPipelineRunner, UserPreferences};

/// newsrecap - RSS ingestion, semantic dedup, and LLM task orchestration
#[derive(Parser)]
#[command(
    name = "nr",
    about = "News recap daemon: ingest feeds, dedup articles, run LLM recap tasks",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Ingestion pipeline commands
    Ingest {
        #[command(subcommand)]
        command: IngestCommand,
    },

    /// Inspect dedup clusters for a run
    Clusters {
        /// Run id; defaults to the latest run
        #[arg(long)]
        run_id: Option<String>,

        /// Only show clusters with at least this many members
        #[arg(long, default_value = "2")]
        min_size: usize,

        /// Maximum clusters to print
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Apply per-user article retention
    Prune {
        /// Retention window in days
        #[arg(long)]
        days: Option<i64>,

        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Garbage-collect articles no user references anymore
    Gc {
        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Task queue worker commands
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },

    /// Task queue inspection commands
    Tasks {
        #[command(subcommand)]
        command: TasksCommand,
    },

    /// Enqueue a demo task over recent articles
    EnqueueDemo {
        /// Prompt passed to the agent
        #[arg(long, default_value = "Summarize today's most important articles.")]
        prompt: String,

        /// Task type used for routing
        #[arg(long, default_value = "highlights")]
        task_type: String,

        /// Agent override (claude, codex, gemini)
        #[arg(long)]
        agent: Option<String>,
    },

    /// Show queue and ingestion statistics
    Stats {
        /// Window in hours
        #[arg(long, default_value = "24")]
        hours: i64,
    },

    /// Probe agents and optionally run one task per agent
    Smoke {
        /// Agents to check
        #[arg(long, value_delimiter = ',', default_values_t = ["codex".to_string()])]
        agents: Vec<String>,

        /// Also run one end-to-end task per agent
        #[arg(long)]
        run: bool,
    },

    /// Recap pipeline commands
    Recap {
        #[command(subcommand)]
        command: RecapCommand,
    },
}

#[derive(Subcommand)]
pub enum IngestCommand {
    /// Run the daily ingestion pipeline once
    Run,

    /// Aggregated counters over a recent window
    Stats {
        #[arg(long, default_value = "24")]
        hours: i64,
    },

    /// List recent ingestion runs
    Runs {
        #[arg(long, default_value = "5")]
        limit: i64,
    },
}

#[derive(Subcommand)]
pub enum WorkerCommand {
    /// Consume queued tasks until idle (or forever with --max-tasks 0)
    Run {
        /// Stop after this many tasks; 0 means run until idle
        #[arg(long, default_value = "0")]
        max_tasks: u64,
    },

    /// Requeue running tasks with stale heartbeats
    RecoverStale,
}

#[derive(Subcommand)]
pub enum TasksCommand {
    /// List recent tasks
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value = "50")]
        limit: i64,
    },

    /// Show one task with its event stream and citations
    Show { task_id: String },

    /// Manually requeue a failed/timeout/canceled task
    Retry { task_id: String },

    /// Cancel a queued or running task
    Cancel { task_id: String },
}

#[derive(Subcommand)]
pub enum RecapCommand {
    /// Run the six-step recap pipeline for a business date
    Run {
        /// Business date (YYYY-MM-DD); defaults to today
        #[arg(long)]
        date: Option<String>,

        /// Agent override (claude, codex, gemini)
        #[arg(long)]
        agent: Option<String>,

        /// Maximum articles pulled from the user corpus
        #[arg(long)]
        limit: Option<i64>,
    },
}

/// Dispatch one parsed CLI invocation.
pub async fn execute(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    match cli.command {
        Command::Ingest { command } => match command {
            IngestCommand::Run => ingest_run(&config).await,
            IngestCommand::Stats { hours } => ingest_stats(&config, hours),
            IngestCommand::Runs { limit } => ingest_runs(&config, limit),
        },
        Command::Clusters {
            run_id,
            min_size,
            limit,
        } => clusters(&config, run_id, min_size, limit),
        Command::Prune { days, dry_run } => prune(&config, days, dry_run),
        Command::Gc { dry_run } => gc(&config, dry_run),
        Command::Worker { command } => match command {
            WorkerCommand::Run { max_tasks } => worker_run(&config, max_tasks).await,
            WorkerCommand::RecoverStale => worker_recover_stale(&config),
        },
        Command::Tasks { command } => match command {
            TasksCommand::List { status, limit } => tasks_list(&config, status, limit),
            TasksCommand::Show { task_id } => tasks_show(&config, &task_id),
            TasksCommand::Retry { task_id } => tasks_retry(&config, &task_id),
            TasksCommand::Cancel { task_id } => tasks_cancel(&config, &task_id),
        },
        Command::EnqueueDemo {
            prompt,
            task_type,
            agent,
        } => enqueue_demo(&config, &prompt, &task_type, agent.as_deref()),
        Command::Stats { hours } => stats(&config, hours),
        Command::Smoke { agents, run } => smoke(&config, &agents, run).await,
        Command::Recap { command } => match command {
            RecapCommand::Run { date, agent, limit } => {
                recap_run(&config, date.as_deref(), agent.as_deref(), limit).await
            }
        },
    }
}

fn user_context(config: &Config) -> UserContext {
    UserContext::new(config.user.user_id.clone(), config.user.user_name.clone())
}

fn open_store(config: &Config) -> Result<Store> {
    Ok(Store::open(&config.storage.db_path, user_context(config))?)
}

async fn ingest_run(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let source_store = open_store(config)?;
    let transport = HttpFeedTransport::new(std::time::Duration::from_secs_f64(
        config.rss.request_timeout_seconds,
    ))?;
    let source = RssSource::new(config.rss_source_config(), source_store, Box::new(transport));
    let embedder = build_embedder(&config.dedup.model_name, config.dedup.allow_model_fallback)?;
    let dedup = DedupStage::new(config.dedup_stage_config(), embedder);

    let mut orchestrator =
        IngestionOrchestrator::new(store, source, dedup, config.ingestion_config());
    let summary = orchestrator.run_daily().await?;
    println!(
        "run {} finished: status={} ingested={} updated={} skipped={} clusters={} duplicates={} gaps={}",
        summary.run_id,
        summary.status,
        summary.counters.ingested,
        summary.counters.updated,
        summary.counters.skipped,
        summary.counters.dedup_clusters,
        summary.counters.dedup_duplicates,
        summary.counters.gaps_opened,
    );
    Ok(())
}

fn ingest_stats(config: &Config, hours: i64) -> Result<()> {
    let mut store = open_store(config)?;
    let until = Utc::now();
    let since = until - Duration::hours(hours.max(1));
    let summary = store.summarize_runs(since, until, None)?;
    println!("ingestion window: last {hours}h");
    println!(
        "  runs: {} (succeeded={}, partial={}, failed={}, other={})",
        summary.runs,
        summary.succeeded_runs,
        summary.partial_runs,
        summary.failed_runs,
        summary.other_runs,
    );
    println!(
        "  articles: ingested={} updated={} skipped={}",
        summary.ingested, summary.updated, summary.skipped,
    );
    println!(
        "  dedup: clusters={} duplicates={} gaps_opened={}",
        summary.dedup_clusters, summary.dedup_duplicates, summary.gaps_opened,
    );
    Ok(())
}

fn ingest_runs(config: &Config, limit: i64) -> Result<()> {
    let mut store = open_store(config)?;
    for run in store.list_recent_runs(limit, None)? {
        println!(
            "{} {} {} ingested={} updated={} skipped={} gaps={}",
            run.started_at.to_rfc3339(),
            run.run_id,
            run.status,
            run.counters.ingested,
            run.counters.updated,
            run.counters.skipped,
            run.counters.gaps_opened,
        );
    }
    Ok(())
}

fn clusters(
    config: &Config,
    run_id: Option<String>,
    min_size: usize,
    limit: usize,
) -> Result<()> {
    let mut store = open_store(config)?;
    let run_id = match run_id {
        Some(run_id) => run_id,
        None => store
            .latest_run_id(None)?
            .ok_or_else(|| eyre!("no ingestion runs found"))?,
    };
    let listed = store.list_clusters_for_run(&run_id, min_size, limit, 5)?;
    println!(
        "run {}: {} clusters, {} clustered articles",
        listed.run_id, listed.total_clusters, listed.total_articles,
    );
    for cluster in &listed.clusters {
        println!(
            "  {} size={} rep={} {}",
            cluster.cluster_id, cluster.size, cluster.representative_article_id,
            cluster.representative_title,
        );
        for member in &cluster.members {
            println!(
                "    {} sim={:.3}{}",
                member.article_id,
                member.similarity_to_representative,
                if member.is_representative { " *" } else { "" },
            );
        }
    }
    Ok(())
}

fn prune(config: &Config, days: Option<i64>, dry_run: bool) -> Result<()> {
    let mut store = open_store(config)?;
    let days = days.unwrap_or(config.ingestion.article_retention_days);
    let cutoff = Utc::now() - Duration::days(days.max(1));
    let result = store.prune_articles(cutoff, dry_run)?;
    println!(
        "prune{}: cutoff={} user_links={} private_resources={}",
        if result.dry_run { " (dry run)" } else { "" },
        result.cutoff.to_rfc3339(),
        result.articles_deleted,
        result.private_resources_deleted,
    );
    Ok(())
}

fn gc(config: &Config, dry_run: bool) -> Result<()> {
    let mut store = open_store(config)?;
    let result = store.gc_unreferenced_articles(dry_run)?;
    println!(
        "gc{}: articles={} raw_payloads={} public_resources={}",
        if result.dry_run { " (dry run)" } else { "" },
        result.articles_deleted,
        result.raw_payloads_deleted,
        result.public_resources_deleted,
    );
    Ok(())
}

async fn worker_run(config: &Config, max_tasks: u64) -> Result<()> {
    let store = open_store(config)?;
    let mut worker = OrchestratorWorker::new(
        store,
        CliAgentBackend,
        config.routing_defaults()?,
        config.worker_config(),
    );
    let recovered = worker.recover_stale()?;
    if recovered > 0 {
        println!("recovered {recovered} stale running tasks");
    }
    let max_tasks = if max_tasks == 0 { None } else { Some(max_tasks) };
    let summary = worker.run_loop(max_tasks).await?;
    println!(
        "worker done: processed={} succeeded={} failed={} retried={} timeouts={} idle_polls={}",
        summary.processed,
        summary.succeeded,
        summary.failed,
        summary.retried,
        summary.timeouts,
        summary.idle_polls,
    );
    Ok(())
}

fn worker_recover_stale(config: &Config) -> Result<()> {
    let mut store = open_store(config)?;
    let recovered =
        store.recover_stale_running_tasks(config.worker_config().stale_task_after)?;
    println!("recovered {recovered} stale running tasks");
    Ok(())
}

fn tasks_list(config: &Config, status: Option<String>, limit: i64) -> Result<()> {
    let mut store = open_store(config)?;
    let status = match status.as_deref() {
        Some(raw) => Some(
            LlmTaskStatus::parse(raw).ok_or_else(|| eyre!("unknown task status: {raw}"))?,
        ),
        None => None,
    };
    for task in store.list_tasks(status, limit)? {
        println!(
            "{} {} {} attempt={}/{} priority={}{}",
            task.created_at.to_rfc3339(),
            task.task_id,
            task.status,
            task.attempt,
            task.max_attempts,
            task.priority,
            task.failure_class
                .map(|class| format!(" failure={class}"))
                .unwrap_or_default(),
        );
    }
    Ok(())
}

fn tasks_show(config: &Config, task_id: &str) -> Result<()> {
    let mut store = open_store(config)?;
    let details = store
        .get_task_details(task_id)?
        .ok_or_else(|| eyre!("task not found: {task_id}"))?;
    let task = &details.task;
    println!("task {} ({})", task.task_id, task.task_type);
    println!("  status: {} attempt {}/{}", task.status, task.attempt, task.max_attempts);
    println!("  manifest: {}", task.input_manifest_path);
    if let Some(output_path) = &task.output_path {
        println!("  output: {output_path}");
    }
    if let Some(error_summary) = &task.error_summary {
        println!("  error: {error_summary}");
    }
    println!("  events:");
    for event in &details.events {
        println!(
            "    {} {} {} -> {}",
            event.created_at.to_rfc3339(),
            event.event_type,
            event
                .status_from
                .map(|status| status.to_string())
                .unwrap_or_else(|| "-".to_string()),
            event
                .status_to
                .map(|status| status.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    let citations = store.list_output_citations(task_id)?;
    if !citations.is_empty() {
        println!("  citations:");
        for citation in citations {
            println!("    {} {} {}", citation.source_id, citation.title, citation.url);
        }
    }
    Ok(())
}

fn tasks_retry(config: &Config, task_id: &str) -> Result<()> {
    let mut store = open_store(config)?;
    store.retry_task(task_id)?;
    println!("task {task_id} requeued");
    Ok(())
}

fn tasks_cancel(config: &Config, task_id: &str) -> Result<()> {
    let mut store = open_store(config)?;
    store.cancel_task(task_id)?;
    println!("task {task_id} canceled");
    Ok(())
}

fn enqueue_demo(
    config: &Config,
    prompt: &str,
    task_type: &str,
    agent: Option<&str>,
) -> Result<()> {
    let mut store = open_store(config)?;
    let entries = store.list_user_corpus_entries(10, None, None)?;
    if entries.is_empty() {
        return Err(eyre!("no articles available; run ingestion first"));
    }

    let defaults = config.routing_defaults()?;
    let routing = resolve_routing_for_enqueue(&defaults, task_type, agent, None, None)?;
    let workdir = TaskWorkdirManager::new(&config.storage.workdir_root);
    let task_id = uuid::Uuid::new_v4().to_string();
    let materialized = workdir.materialize(
        &task_id,
        task_type,
        &TaskInput {
            task_type: task_type.to_string(),
            prompt: prompt.to_string(),
            metadata: serde_json::json!({"routing": routing.to_metadata()}),
        },
        &to_article_index(&entries),
        &MaterializeOptions::default(),
    )?;

    let mut create = LlmTaskCreate::new(
        task_type,
        materialized.manifest_path.display().to_string(),
    );
    create.task_id = Some(task_id);
    create.output_path = Some(materialized.manifest.output_result_path.clone());
    let task = store.enqueue_task(&create)?;
    println!("enqueued task {} ({} articles)", task.task_id, entries.len());
    Ok(())
}

fn stats(config: &Config, hours: i64) -> Result<()> {
    let mut store = open_store(config)?;
    println!("task queue:");
    for (status, count) in store.task_status_counts()? {
        println!("  {status}: {count}");
    }
    let since = Utc::now() - Duration::hours(hours.max(1));
    println!("attempt failures (last {hours}h):");
    for (failure_class, count) in store.attempt_failure_counts(since)? {
        println!("  {failure_class}: {count}");
    }
    ingest_stats(config, hours)
}

async fn smoke(config: &Config, agents: &[String], run: bool) -> Result<()> {
    let report = run_smoke(
        &config.storage.db_path,
        &user_context(config),
        &config.storage.workdir_root,
        &config.routing_defaults()?,
        agents,
        run,
    )
    .await?;
    for result in &report.results {
        println!(
            "{}: probe={} run={} {}",
            result.agent,
            if result.probe_ok { "ok" } else { "fail" },
            result
                .run_ok
                .map(|ok| if ok { "ok" } else { "fail" })
                .unwrap_or("-"),
            result.detail,
        );
    }
    if !report.passed() {
        return Err(eyre!("smoke check failed"));
    }
    Ok(())
}

async fn recap_run(
    config: &Config,
    date: Option<&str>,
    agent: Option<&str>,
    limit: Option<i64>,
) -> Result<()> {
    let business_date = match date {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .context("business date must be YYYY-MM-DD")?,
        None => Utc::now().date_naive(),
    };

    let mut corpus_store = open_store(config)?;
    let limit = limit.unwrap_or(config.recap.corpus_limit);
    let articles = corpus_store.list_user_corpus_entries(limit, None, None)?;
    if articles.is_empty() {
        return Err(eyre!("no articles available; run ingestion first"));
    }

    // The coordinator only enqueues and polls; a worker drains the same
    // durable queue concurrently.
    let worker_store = open_store(config)?;
    let mut worker = OrchestratorWorker::new(
        worker_store,
        CliAgentBackend,
        config.routing_defaults()?,
        config.worker_config(),
    );
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let idle_sleep = std::time::Duration::from_secs_f64(
        config.orchestrator.poll_interval_seconds.max(0.5),
    );
    let worker_handle = tokio::spawn(async move {
        loop {
            if *stop_rx.borrow() {
                break;
            }
            match worker.run_once().await {
                Ok(summary) if summary.processed == 0 => tokio::time::sleep(idle_sleep).await,
                Ok(_) => {}
                Err(error) => {
                    warn!(%error, "worker error during recap run");
                    tokio::time::sleep(idle_sleep).await;
                }
            }
        }
    });

    let loader = HttpResourceLoader::new(
        std::time::Duration::from_secs_f64(config.rss.request_timeout_seconds),
        config.recap.resource_max_chars,
    );
    let mut runner = RecapPipelineRunner::new(
        open_store(config)?,
        TaskWorkdirManager::new(&config.storage.workdir_root),
        config.routing_defaults()?,
        Some(Box::new(loader)),
        config.recap_config(),
    );
    let result = runner
        .run(business_date, &UserPreferences::default(), &articles, agent)
        .await;

    let _ = stop_tx.send(true);
    let _ = worker_handle.await;

    let result = result?;
    println!("pipeline {} {}", result.pipeline_id, result.status);
    for step in &result.steps {
        println!(
            "  {} {}{}",
            step.step_name,
            step.status,
            step.task_id
                .as_deref()
                .map(|task_id| format!(" task={task_id}"))
                .unwrap_or_default(),
        );
    }
    if let Some(error) = &result.error {
        return Err(eyre!("pipeline failed: {error}"));
    }
    if let Some(digest) = &result.digest {
        println!("{}", serde_json::to_string_pretty(digest)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_ingest_run() {
        let cli = Cli::parse_from(["nr", "ingest", "run"]);
        assert!(matches!(
            cli.command,
            Command::Ingest {
                command: IngestCommand::Run
            }
        ));
    }

    #[test]
    fn test_cli_parse_worker_run_with_max_tasks() {
        let cli = Cli::parse_from(["nr", "worker", "run", "--max-tasks", "3"]);
        match cli.command {
            Command::Worker {
                command: WorkerCommand::Run { max_tasks },
            } => assert_eq!(max_tasks, 3),
            _ => panic!("expected worker run"),
        }
    }

    #[test]
    fn test_cli_parse_tasks_show() {
        let cli = Cli::parse_from(["nr", "tasks", "show", "task-1"]);
        match cli.command {
            Command::Tasks {
                command: TasksCommand::Show { task_id },
            } => assert_eq!(task_id, "task-1"),
            _ => panic!("expected tasks show"),
        }
    }

    #[test]
    fn test_cli_parse_smoke_agents() {
        let cli = Cli::parse_from(["nr", "smoke", "--agents", "codex,claude", "--run"]);
        match cli.command {
            Command::Smoke { agents, run } => {
                assert_eq!(agents, vec!["codex", "claude"]);
                assert!(run);
            }
            _ => panic!("expected smoke"),
        }
    }

    #[test]
    fn test_cli_parse_recap_run_with_date() {
        let cli = Cli::parse_from(["nr", "recap", "run", "--date", "2026-03-01"]);
        match cli.command {
            Command::Recap {
                command: RecapCommand::Run { date, .. },
            } => assert_eq!(date.as_deref(), Some("2026-03-01")),
            _ => panic!("expected recap run"),
        }
    }

    #[test]
    fn test_cli_with_config_flag() {
        let cli = Cli::parse_from(["nr", "-c", "/tmp/config.yml", "gc"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/config.yml")));
    }
}
