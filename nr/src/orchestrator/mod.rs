//! LLM task orchestration
//!
//! File-based task contracts, workdir materialization, routing, the CLI
//! subprocess backend, deterministic failure classification, output
//! validation, usage/pricing telemetry helpers, the queue worker, and the
//! agent smoke check.

pub mod backend;
pub mod classifier;
pub mod contracts;
pub mod fallback;
pub mod pricing;
pub mod routing;
pub mod smoke;
pub mod usage;
pub mod validator;
pub mod workdir;
pub mod worker;

pub use backend::{
    AgentBackend, BackendRunError, BackendRunRequest, BackendRunResult, CliAgentBackend,
};
pub use classifier::{classify_backend_failure, BackendFailureClassification};
pub use contracts::{
    read_articles_index, read_manifest, read_task_input, write_articles_index, write_manifest,
    write_task_input, AgentOutput, AgentOutputBlock, ArticleIndexEntry, ContractError, TaskInput,
    TaskManifest,
};
pub use fallback::recover_output_contract_from_stdout;
pub use routing::{
    resolve_routing_for_enqueue, resolve_routing_for_execution, FrozenRouting, RoutingDefaults,
    RoutingError,
};
pub use smoke::{run_smoke, AgentSmokeResult, SmokeReport};
pub use usage::{extract_usage, UsageExtraction};
pub use validator::{is_recap_task_type, validate_output_contract, ValidationResult};
pub use workdir::{MaterializeOptions, MaterializedTask, TaskWorkdirManager};
pub use worker::{decide_repair, OrchestratorWorker, WorkerConfig, WorkerRunSummary};
