//! Remedy application binary - composition root.
//!
//! Runs one submission document through the execution engine:
//! 1. Load configuration from TOML and apply CLI overrides
//! 2. Build the action registry over the provider client
//! 3. Open the audit sink (JSON lines or in-memory)
//! 4. Submit every action and print each result as a JSON line, refused
//!    ones included
//! 5. Shut the engine down once every result is in

mod cli;

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast::{self, error::RecvError};

use remedy_action::{
    ActionRegistry, ActionStatus, ActionSubmission, ApprovalDecision, ApprovalRequest, AuditSink,
    Decision, ExecutionEngine, InMemoryProvider, JsonlAuditSink, MemoryAuditSink,
};
use remedy_core::config::RemedyConfig;
use remedy_core::logging::init_tracing;

use cli::CliArgs;

/// Read the submission document from `path`, or stdin when absent.
fn read_submission(path: Option<&Path>) -> Result<ActionSubmission, Box<dyn std::error::Error>> {
    let raw = match path {
        Some(p) => std::fs::read_to_string(p)?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    Ok(serde_json::from_str(&raw)?)
}

/// Approve every request on `requests` until the channel closes.
async fn auto_approver(engine: Arc<ExecutionEngine>, mut requests: broadcast::Receiver<ApprovalRequest>) {
    loop {
        match requests.recv().await {
            Ok(request) => {
                let decision = ApprovalDecision {
                    action_id: request.action_id,
                    decision: Decision::Approved,
                    decider: "cli-operator".to_string(),
                };
                match engine.resolve_approval(decision) {
                    Ok(_) => tracing::info!(
                        action_id = %request.action_id,
                        action_type = %request.action_type,
                        "Auto-approved"
                    ),
                    Err(e) => tracing::warn!(action_id = %request.action_id, error = %e, "Auto-approval failed"),
                }
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Auto-approver fell behind; missed requests will expire");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config. Logging is not up yet, so load errors are reported below.
    let config_file = args.resolve_config_path();
    let loaded = if config_file.exists() {
        Some(RemedyConfig::load(&config_file))
    } else {
        None
    };
    let mut config = match &loaded {
        Some(Ok(config)) => config.clone(),
        _ => RemedyConfig::default(),
    };

    // Tracing.
    let level = args.resolve_log_level(&config.general.log_level);
    init_tracing(&level, args.json_logs || config.general.json_logs)?;
    tracing::info!("Starting remedy v{}", env!("CARGO_PKG_VERSION"));

    match loaded {
        Some(Ok(_)) => tracing::info!(path = %config_file.display(), "Configuration loaded"),
        Some(Err(e)) => tracing::warn!(
            path = %config_file.display(),
            error = %e,
            "Failed to load config, using defaults"
        ),
        None => tracing::info!(path = %config_file.display(), "No config file, using defaults"),
    }
    config.engine.dry_run_mode = args.resolve_dry_run(config.engine.dry_run_mode);

    // Registry over the provider.
    let provider = Arc::new(InMemoryProvider::new());
    let mut registry = ActionRegistry::new();
    registry.register_defaults(provider)?;

    // Audit sink.
    let audit: Arc<dyn AuditSink> = match args.resolve_audit_path(config.audit.path.as_deref()) {
        Some(path) => {
            let sink = JsonlAuditSink::open(&path)?;
            tracing::info!(path = %path.display(), "Audit log opened");
            Arc::new(sink)
        }
        None => {
            tracing::warn!("No audit log configured; audit records are kept in memory only");
            Arc::new(MemoryAuditSink::new())
        }
    };

    let submission = read_submission(args.submission.as_deref())?;
    let engine = Arc::new(ExecutionEngine::start(config.engine.clone(), registry, audit)?);

    if args.auto_approve {
        // Subscribe before anything is submitted.
        let requests = engine.approval_requests();
        tokio::spawn(auto_approver(Arc::clone(&engine), requests));
    }

    let incident_id = submission.incident_id.clone();
    let (actions, context) = submission.into_actions();
    tracing::info!(incident_id = %incident_id, actions = actions.len(), "Submission received");

    // Submit everything before waiting on anything.
    let submitted: Vec<_> = actions
        .into_iter()
        .map(|action| {
            let handle = engine.submit(action.clone(), &context);
            (action, handle)
        })
        .collect();
    for (action, handle) in submitted {
        let outcome = match handle {
            Ok(handle) => handle.wait().await,
            Err(e) => Err(e),
        };
        let result = outcome.unwrap_or_else(|e| engine.admission_result(&action, &e));
        println!("{}", serde_json::to_string(&result)?);
    }

    let health = engine.health();
    tracing::info!(
        completed = health
            .terminal_counts
            .get(&ActionStatus::Completed)
            .copied()
            .unwrap_or(0),
        failures = health.failure_count(),
        "Submission processed"
    );

    engine.shutdown().await;
    Ok(())
}
