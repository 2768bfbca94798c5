//! End-to-end tests of the execution engine against the in-memory provider.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use remedy_action::{
    ActionError, ActionHandle, ActionRegistry, ActionStatus, ActionSubmission, ApprovalDecision,
    AuditEvent, AuditOutcome, AuditRecord, Decision, ExecutionEngine, InMemoryProvider,
    JsonlAuditSink, MemoryAuditSink, Priority, ProviderError, RemediationAction, SecurityContext,
    Urgency,
};
use remedy_core::EngineConfig;

struct Harness {
    engine: ExecutionEngine,
    provider: Arc<InMemoryProvider>,
    audit: Arc<MemoryAuditSink>,
}

fn config() -> EngineConfig {
    EngineConfig {
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 50,
        ..EngineConfig::default()
    }
}

fn harness(config: EngineConfig) -> Harness {
    harness_with(config, InMemoryProvider::new())
}

fn harness_with(config: EngineConfig, provider: InMemoryProvider) -> Harness {
    let provider = Arc::new(provider);
    let audit = Arc::new(MemoryAuditSink::new());
    let mut registry = ActionRegistry::new();
    registry.register_defaults(provider.clone()).unwrap();
    let engine = ExecutionEngine::start(config, registry, audit.clone()).unwrap();
    Harness {
        engine,
        provider,
        audit,
    }
}

fn responder() -> SecurityContext {
    SecurityContext::new(
        "incident-analyzer",
        ["network:write", "compute:write", "identity:write", "secrets:rotate"],
    )
}

fn block(ip: &str) -> RemediationAction {
    RemediationAction::new("block_ip_address", ip, Priority::Medium).with_param("ip", ip)
}

fn stop(instance: &str) -> RemediationAction {
    RemediationAction::new("stop_instance", instance, Priority::High)
        .with_param("reason", "crypto-mining process detected")
}

fn disable(user: &str, priority: Priority) -> RemediationAction {
    RemediationAction::new("disable_user_account", user, priority).with_param("username", user)
}

fn rotate(service: &str) -> RemediationAction {
    RemediationAction::new("rotate_credentials", service, Priority::Critical)
        .with_param("credential_id", "AKIAEXAMPLE")
        .with_description("Rotate leaked access key")
}

fn calls_on(provider: &InMemoryProvider, target: &str) -> usize {
    provider
        .calls()
        .iter()
        .filter(|c| c.request.target == target)
        .count()
}

async fn wait_all(handles: Vec<ActionHandle>) -> Vec<remedy_action::ExecutionResult> {
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.wait().await.unwrap());
    }
    results
}

// =============================================================================
// Happy path and admission
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_block_ip_completes_without_rollback() {
    let h = harness(config());
    let handle = h.engine.submit(block("203.0.113.5"), &responder()).unwrap();
    let result = handle.wait().await.unwrap();

    assert_eq!(result.status, ActionStatus::Completed);
    assert!(!result.rollback_performed);
    assert!(result.error.is_none());
    assert_eq!(result.attempts, 1);
    assert_eq!(h.provider.calls_for("firewall.block"), 1);
    assert_eq!(
        h.provider.resource_state("203.0.113.5").unwrap()["blocked"],
        true
    );
}

#[tokio::test(start_paused = true)]
async fn test_audit_trail_covers_every_step() {
    let h = harness(config());
    let action = block("203.0.113.5");
    let id = action.id;
    h.engine.submit(action, &responder()).unwrap().wait().await.unwrap();

    let records = h.audit.for_action(id);
    let events: Vec<AuditEvent> = records.iter().map(|r| r.event.clone()).collect();
    assert_eq!(
        events,
        vec![
            AuditEvent::Authorization,
            AuditEvent::Transition { from: None, to: ActionStatus::Submitted },
            AuditEvent::Transition {
                from: Some(ActionStatus::Submitted),
                to: ActionStatus::Validated
            },
            AuditEvent::Transition {
                from: Some(ActionStatus::Validated),
                to: ActionStatus::Queued
            },
            AuditEvent::Transition {
                from: Some(ActionStatus::Queued),
                to: ActionStatus::Executing
            },
            AuditEvent::Transition {
                from: Some(ActionStatus::Executing),
                to: ActionStatus::Completed
            },
        ]
    );
    assert!(records.iter().all(|r| r.actor == "incident-analyzer"));
}

#[tokio::test(start_paused = true)]
async fn test_missing_parameter_rejected_before_execution() {
    let h = harness(config());
    let action = RemediationAction::new("block_ip_address", "203.0.113.5", Priority::Medium);
    let err = h.engine.submit(action, &responder()).unwrap_err();

    assert!(matches!(err, ActionError::MissingParameter(ref p) if p == "ip"));
    assert_eq!(h.provider.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_insufficient_permission_is_audited() {
    let h = harness(config());
    let action = stop("i-1");
    let id = action.id;
    let ctx = SecurityContext::new("readonly-bot", ["network:write"]);
    let err = h.engine.submit(action, &ctx).unwrap_err();

    assert!(matches!(err, ActionError::InsufficientPermission(ref p) if p == "compute:write"));
    let records = h.audit.for_action(id);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, AuditOutcome::Denied);
    assert_eq!(h.provider.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_action_type() {
    let h = harness(config());
    let action = RemediationAction::new("reboot_datacenter", "dc-1", Priority::Low);
    let err = h.engine.submit(action, &responder()).unwrap_err();
    assert_eq!(err.kind(), "UnknownActionTypeError");
}

#[tokio::test(start_paused = true)]
async fn test_audit_outage_fails_closed() {
    let h = harness(config());
    h.audit.set_unavailable(true);
    let err = h.engine.submit(stop("i-1"), &responder()).unwrap_err();
    assert_eq!(err.kind(), "AuditError");
    assert_eq!(h.provider.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_missing_target_fails_prerequisite() {
    let h = harness_with(config(), InMemoryProvider::new().with_inventory(["i-1"]));
    let result = h
        .engine
        .submit(stop("i-404"), &responder())
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(result.status, ActionStatus::Failed);
    assert_eq!(result.error.unwrap().kind, "ExecutionError");
    assert_eq!(h.provider.calls_for("instance.stop"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_refused_submission_reported_as_result() {
    let h = harness(config());
    let action = stop("i-1");
    let ctx = SecurityContext::new("readonly-bot", ["network:write"]);
    let err = h.engine.submit(action.clone(), &ctx).unwrap_err();

    let result = h.engine.admission_result(&action, &err);
    assert_eq!(result.action_id, action.id);
    assert_eq!(result.status, ActionStatus::Rejected);
    assert!(!result.rollback_performed);
    assert_eq!(result.attempts, 0);
    assert_eq!(result.error.as_ref().unwrap().kind, "InsufficientPermissionError");

    let wire = serde_json::to_value(&result).unwrap();
    assert_eq!(wire["status"], "rejected");
    assert_eq!(wire["rollback_performed"], false);
    assert!(wire["started_at"].is_string());
    assert!(wire["ended_at"].is_string());

    // An engine fault is a failure, not a rejection.
    h.audit.set_unavailable(true);
    let other = stop("i-2");
    let err = h.engine.submit(other.clone(), &responder()).unwrap_err();
    assert_eq!(h.engine.admission_result(&other, &err).status, ActionStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_submit_batch_document() {
    let h = harness(config());
    let submission: ActionSubmission = serde_json::from_value(json!({
        "incident_id": "INC-2024-0042",
        "actions": [
            {
                "action_type": "block_ip_address",
                "description": "Block C2 address",
                "target_resource": "198.51.100.7",
                "priority": "HIGH",
                "params": {"ip": "198.51.100.7"}
            },
            {
                "action_type": "stop_instance",
                "target_resource": "i-0abc",
                "priority": "CRITICAL",
                "params": {"reason": "beaconing to C2"}
            }
        ],
        "security_context": {
            "principal": "incident-analyzer",
            "permissions": ["network:write", "compute:write"]
        }
    }))
    .unwrap();

    let handles: Vec<ActionHandle> = h
        .engine
        .submit_batch(submission)
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    let results = wait_all(handles).await;
    assert!(results.iter().all(|r| r.status == ActionStatus::Completed));

    let incidents: Vec<Option<String>> = h
        .audit
        .records()
        .into_iter()
        .filter(|r| r.event == AuditEvent::Authorization)
        .map(|r| r.incident_id)
        .collect();
    assert_eq!(incidents, vec![Some("INC-2024-0042".to_string()); 2]);
}

// =============================================================================
// Idempotency
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_duplicate_submission_executes_once() {
    let h = harness(config());
    let first = h.engine.submit(block("203.0.113.5"), &responder()).unwrap();
    let second = h.engine.submit(block("203.0.113.5"), &responder()).unwrap();
    assert_eq!(first.action_id(), second.action_id());

    let a = first.wait().await.unwrap();
    let b = second.wait().await.unwrap();
    assert_eq!(a, b);

    let third = h
        .engine
        .submit(block("203.0.113.5"), &responder())
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(a, third);
    assert_eq!(h.provider.calls_for("firewall.block"), 1);

    let cache_hits = h
        .audit
        .records()
        .into_iter()
        .filter(|r| matches!(r.event, AuditEvent::CacheHit { .. }))
        .count();
    assert_eq!(cache_hits, 2);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_after_ttl_runs_again() {
    let h = harness(EngineConfig {
        idempotency_ttl_seconds: 60,
        ..config()
    });
    let first = h
        .engine
        .submit(stop("i-1"), &responder())
        .unwrap()
        .wait()
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(61)).await;
    let second = h
        .engine
        .submit(stop("i-1"), &responder())
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_ne!(first.action_id, second.action_id);
    assert_eq!(h.provider.calls_for("instance.stop"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_results_are_cached_too() {
    let h = harness(config());
    h.provider
        .fail_next("instance.stop", ProviderError::Permanent("403".into()));
    let first = h
        .engine
        .submit(stop("i-1"), &responder())
        .unwrap()
        .wait()
        .await
        .unwrap();
    let second = h
        .engine
        .submit(stop("i-1"), &responder())
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(first.status, ActionStatus::RolledBack);
    assert_eq!(first, second);
    assert_eq!(h.provider.calls_for("instance.stop"), 1);
}

// =============================================================================
// Approval gating
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_approval_expiry_never_executes() {
    let h = harness(EngineConfig {
        approval_timeout_seconds: 5,
        ..config()
    });
    let action = rotate("svc/payments");
    let id = action.id;
    let handle = h.engine.submit(action, &responder()).unwrap();
    assert_eq!(h.engine.status(id), Some(ActionStatus::AwaitingApproval));

    let start = Instant::now();
    let result = handle.wait().await.unwrap();
    assert!(start.elapsed() >= Duration::from_secs(5));
    assert_eq!(result.status, ActionStatus::Expired);
    assert_eq!(result.error.unwrap().kind, "ApprovalExpiredError");
    assert_eq!(h.provider.call_count(), 0);

    let late = h.engine.resolve_approval(ApprovalDecision {
        action_id: id,
        decision: Decision::Approved,
        decider: "secops-lead".to_string(),
    });
    assert!(matches!(late, Err(ActionError::NoPendingApproval(_))));
}

#[tokio::test(start_paused = true)]
async fn test_approval_granted_executes() {
    let h = harness(config());
    let mut announcements = h.engine.approval_requests();
    let handle = h.engine.submit(rotate("svc/payments"), &responder()).unwrap();

    let request = announcements.recv().await.unwrap();
    assert_eq!(request.action_type, "rotate_credentials");
    assert_eq!(h.engine.pending_approvals().len(), 1);
    assert_eq!(h.engine.health().awaiting_approval, 1);

    h.engine
        .resolve_approval(ApprovalDecision {
            action_id: request.action_id,
            decision: Decision::Approved,
            decider: "secops-lead".to_string(),
        })
        .unwrap();

    let result = handle.wait().await.unwrap();
    assert_eq!(result.status, ActionStatus::Completed);
    assert_eq!(h.provider.calls_for("credentials.rotate"), 1);
    // Irreversible: no state capture.
    assert_eq!(h.provider.calls_for("describe"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_approval_rejected() {
    let h = harness(config());
    let action = rotate("svc/payments");
    let id = action.id;
    let handle = h.engine.submit(action, &responder()).unwrap();
    tokio::task::yield_now().await;

    h.engine
        .resolve_approval(ApprovalDecision {
            action_id: id,
            decision: Decision::Rejected,
            decider: "secops-lead".to_string(),
        })
        .unwrap();

    let result = handle.wait().await.unwrap();
    assert_eq!(result.status, ActionStatus::Rejected);
    let error = result.error.unwrap();
    assert_eq!(error.kind, "ApprovalRejectedError");
    assert!(error.message.contains("secops-lead"));
    assert_eq!(h.provider.call_count(), 0);
}

// =============================================================================
// Safety: rollback, retries, timeouts
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_rolls_back_once() {
    let provider = InMemoryProvider::new();
    provider.add_resource("i-1", json!({"power_state": "running"}));
    provider.fail_next("instance.stop", ProviderError::Permanent("400 bad request".into()));
    let h = harness_with(config(), provider);

    let action = stop("i-1");
    let id = action.id;
    let result = h.engine.submit(action, &responder()).unwrap().wait().await.unwrap();

    assert_eq!(result.status, ActionStatus::RolledBack);
    assert!(result.rollback_performed);
    assert_eq!(result.error.unwrap().kind, "ExecutionError");
    assert_eq!(h.provider.calls_for("restore"), 1);
    assert_eq!(
        h.provider.resource_state("i-1").unwrap(),
        json!({"power_state": "running"})
    );

    let rollbacks: Vec<AuditRecord> = h
        .audit
        .for_action(id)
        .into_iter()
        .filter(|r| r.event == AuditEvent::RollbackAttempt)
        .collect();
    assert_eq!(rollbacks.len(), 1);
    assert_eq!(rollbacks[0].outcome, AuditOutcome::Success);
}

#[tokio::test(start_paused = true)]
async fn test_rollback_failure_escalates() {
    let provider = InMemoryProvider::new();
    provider.fail_next("instance.stop", ProviderError::Permanent("400".into()));
    provider.fail_next("restore", ProviderError::Permanent("500 on restore".into()));
    let h = harness_with(config(), provider);

    let action = stop("i-1");
    let id = action.id;
    let result = h.engine.submit(action, &responder()).unwrap().wait().await.unwrap();

    assert_eq!(result.status, ActionStatus::RolledBackFailed);
    assert!(!result.rollback_performed);
    assert_eq!(result.error.unwrap().kind, "RollbackError");
    assert_eq!(h.provider.calls_for("restore"), 1);

    let last = h.audit.for_action(id).pop().unwrap();
    assert_eq!(last.urgency, Urgency::Critical);
}

#[tokio::test(start_paused = true)]
async fn test_transient_error_retried() {
    let provider = InMemoryProvider::new();
    provider.fail_next("instance.stop", ProviderError::Transient("503".into()));
    let h = harness_with(config(), provider);

    let result = h
        .engine
        .submit(stop("i-1"), &responder())
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(result.status, ActionStatus::Completed);
    assert_eq!(result.attempts, 2);
    assert_eq!(h.provider.calls_for("instance.stop"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_exhaust_into_rollback() {
    let provider = InMemoryProvider::new();
    for _ in 0..3 {
        provider.fail_next("instance.stop", ProviderError::Transient("503".into()));
    }
    let h = harness_with(
        EngineConfig {
            max_transient_retries: 2,
            ..config()
        },
        provider,
    );

    let result = h
        .engine
        .submit(stop("i-1"), &responder())
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(result.status, ActionStatus::RolledBack);
    assert_eq!(result.attempts, 3);
    let error = result.error.unwrap();
    assert_eq!(error.kind, "ExecutionError");
    assert!(error.message.contains("gave up after 3 attempts"));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fails_without_rollback() {
    let provider = InMemoryProvider::new();
    provider.set_latency("instance.stop", Duration::from_secs(30));
    let h = harness_with(
        EngineConfig {
            action_timeout_seconds: 2,
            ..config()
        },
        provider,
    );

    let result = h
        .engine
        .submit(stop("i-1"), &responder())
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(result.status, ActionStatus::Failed);
    assert!(!result.rollback_performed);
    assert_eq!(result.error.unwrap().kind, "TimeoutError");
    assert_eq!(h.provider.calls_for("restore"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_covers_state_capture() {
    let provider = InMemoryProvider::new();
    provider.set_latency("describe", Duration::from_secs(3600));
    let h = harness_with(
        EngineConfig {
            action_timeout_seconds: 5,
            ..config()
        },
        provider,
    );

    let start = Instant::now();
    let result = h
        .engine
        .submit(stop("i-1"), &responder())
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(start.elapsed() >= Duration::from_secs(5));
    assert!(start.elapsed() < Duration::from_secs(60));
    assert_eq!(result.status, ActionStatus::Failed);
    assert!(!result.rollback_performed);
    assert_eq!(result.error.unwrap().kind, "TimeoutError");
    assert_eq!(h.provider.calls_for("instance.stop"), 0);
    assert_eq!(h.engine.health().in_flight, 0);

    // The target is free again.
    let retry = stop("i-1").with_param("reason", "second attempt");
    assert!(h.engine.submit(retry, &responder()).is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_hung_rollback_is_bounded() {
    let provider = InMemoryProvider::new();
    provider.fail_next("instance.stop", ProviderError::Permanent("400".into()));
    provider.set_latency("restore", Duration::from_secs(3600));
    let h = harness_with(
        EngineConfig {
            action_timeout_seconds: 5,
            ..config()
        },
        provider,
    );

    let action = stop("i-1");
    let id = action.id;
    let start = Instant::now();
    let result = h.engine.submit(action, &responder()).unwrap().wait().await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(60));
    assert_eq!(result.status, ActionStatus::RolledBackFailed);
    let error = result.error.unwrap();
    assert_eq!(error.kind, "RollbackError");
    assert!(error.message.contains("rollback timed out after 5 seconds"));

    let rollbacks: Vec<AuditRecord> = h
        .audit
        .for_action(id)
        .into_iter()
        .filter(|r| r.event == AuditEvent::RollbackAttempt)
        .collect();
    assert_eq!(rollbacks.len(), 1);
    assert_eq!(rollbacks[0].outcome, AuditOutcome::Failure);
    assert_eq!(rollbacks[0].urgency, Urgency::Critical);
}

// =============================================================================
// Dry run
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_dry_run_mode_makes_no_provider_calls() {
    let h = harness(EngineConfig {
        dry_run_mode: true,
        ..config()
    });
    let handles = vec![
        h.engine.submit(block("203.0.113.5"), &responder()).unwrap(),
        h.engine.submit(stop("i-1"), &responder()).unwrap(),
        h.engine.submit(disable("jdoe", Priority::High), &responder()).unwrap(),
    ];
    let results = wait_all(handles).await;

    for result in &results {
        assert_eq!(result.status, ActionStatus::Completed);
        assert!(result.dry_run);
        assert_eq!(result.output.as_ref().unwrap()["simulated"], true);
    }
    assert_eq!(h.provider.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_per_action_dry_run() {
    let h = harness(config());
    let result = h
        .engine
        .submit(stop("i-1").with_dry_run(true), &responder())
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(result.dry_run);
    assert_eq!(result.status, ActionStatus::Completed);
    assert_eq!(h.provider.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_errors_are_labelled() {
    let h = harness(EngineConfig {
        dry_run_mode: true,
        approval_timeout_seconds: 1,
        ..config()
    });
    let result = h
        .engine
        .submit(rotate("svc/payments"), &responder())
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(result.status, ActionStatus::Expired);
    let error = result.error.unwrap();
    assert_eq!(error.kind, "DryRunApprovalExpiredError");
    assert!(error.message.starts_with("[dry-run]"));
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_failure_takes_rollback_path() {
    let h = harness(EngineConfig {
        dry_run_mode: true,
        ..config()
    });
    let action = stop("web-01");
    let id = action.id;
    let result = h.engine.submit(action, &responder()).unwrap().wait().await.unwrap();

    assert_eq!(result.status, ActionStatus::RolledBack);
    assert!(result.rollback_performed);
    assert!(result.dry_run);
    let error = result.error.unwrap();
    assert_eq!(error.kind, "DryRunExecutionError");
    assert!(error.message.starts_with("[dry-run]"));
    assert!(error.message.contains("malformed instance id: web-01"));
    assert_eq!(h.provider.call_count(), 0);

    let rollback = h
        .audit
        .for_action(id)
        .into_iter()
        .find(|r| r.event == AuditEvent::RollbackAttempt)
        .unwrap();
    assert_eq!(rollback.outcome, AuditOutcome::Success);
}

// =============================================================================
// Scheduling: concurrency, rate limit, priority, batching
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrency_never_exceeds_pool_size() {
    let provider = InMemoryProvider::new();
    provider.set_latency("instance.stop", Duration::from_secs(1));
    let h = harness_with(
        EngineConfig {
            max_concurrent_actions: 3,
            max_api_calls_per_minute: 10_000,
            ..config()
        },
        provider,
    );

    let handles: Vec<ActionHandle> = (0..30)
        .map(|i| h.engine.submit(stop(&format!("i-{i}")), &responder()).unwrap())
        .collect();
    let results = wait_all(handles).await;

    assert!(results.iter().all(|r| r.status == ActionStatus::Completed));
    assert!(h.provider.peak_concurrency() <= 3);
    assert!(h.provider.peak_concurrency() >= 2);

    let health = h.engine.health();
    assert_eq!(health.in_flight, 0);
    assert_eq!(health.queue_depth, 0);
    assert_eq!(health.terminal_counts.get(&ActionStatus::Completed), Some(&30));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_window_respected() {
    let h = harness(EngineConfig {
        max_api_calls_per_minute: 5,
        ..config()
    });
    let start = Instant::now();
    let handles: Vec<ActionHandle> = (0..4)
        .map(|i| h.engine.submit(stop(&format!("i-{i}")), &responder()).unwrap())
        .collect();
    let results = wait_all(handles).await;

    assert!(results.iter().all(|r| r.status == ActionStatus::Completed));
    // exists + describe + stop for each of four actions.
    assert_eq!(h.provider.call_count(), 12);
    assert!(h.provider.max_calls_in_window(Duration::from_secs(60)) <= 5);
    assert!(start.elapsed() >= Duration::from_secs(120));
}

#[tokio::test(start_paused = true)]
async fn test_priority_order_with_single_worker() {
    let h = harness(EngineConfig {
        max_concurrent_actions: 1,
        ..config()
    });
    let handles = vec![
        h.engine.submit(disable("low", Priority::Low), &responder()).unwrap(),
        h.engine.submit(disable("medium", Priority::Medium), &responder()).unwrap(),
        h.engine.submit(disable("critical", Priority::Critical), &responder()).unwrap(),
        h.engine.submit(disable("high", Priority::High), &responder()).unwrap(),
    ];
    wait_all(handles).await;

    let order: Vec<String> = h
        .provider
        .calls()
        .into_iter()
        .filter(|c| c.request.operation == "user.disable")
        .map(|c| c.request.target)
        .collect();
    assert_eq!(order, vec!["critical", "high", "medium", "low"]);
}

#[tokio::test(start_paused = true)]
async fn test_batchable_actions_share_one_call() {
    let h = harness(config());
    let handles = vec![
        h.engine.submit(block("203.0.113.5"), &responder()).unwrap(),
        h.engine.submit(block("203.0.113.6"), &responder()).unwrap(),
        h.engine.submit(block("203.0.113.7"), &responder()).unwrap(),
    ];
    let results = wait_all(handles).await;

    assert!(results.iter().all(|r| r.status == ActionStatus::Completed));
    assert_eq!(h.provider.calls_for("firewall.block_many"), 1);
    assert_eq!(h.provider.calls_for("firewall.block"), 0);
    // Each member still gets its own snapshot.
    assert_eq!(h.provider.calls_for("describe"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failed_batch_rolls_back_each_member() {
    let provider = InMemoryProvider::new();
    provider.fail_next("firewall.block_many", ProviderError::Permanent("quota".into()));
    let h = harness_with(config(), provider);
    let handles = vec![
        h.engine.submit(block("203.0.113.5"), &responder()).unwrap(),
        h.engine.submit(block("203.0.113.6"), &responder()).unwrap(),
    ];
    let results = wait_all(handles).await;

    assert!(results.iter().all(|r| r.status == ActionStatus::RolledBack));
    assert_eq!(h.provider.calls_for("restore"), 2);
}

// =============================================================================
// Conflicts, cancellation, shutdown
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_conflicting_action_fails_fast() {
    let provider = InMemoryProvider::new();
    provider.set_latency("instance.stop", Duration::from_secs(5));
    let h = harness_with(config(), provider);

    let running = h.engine.submit(stop("i-1"), &responder()).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let other = stop("i-1").with_param("reason", "different reason");
    let err = h.engine.submit(other, &responder()).unwrap_err();
    assert!(matches!(err, ActionError::ResourceConflict(ref t) if t == "i-1"));

    assert_eq!(running.wait().await.unwrap().status, ActionStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_back_to_back_submissions_on_one_target() {
    let h = harness(EngineConfig {
        max_concurrent_actions: 2,
        ..config()
    });

    let first = h.engine.submit(stop("i-1"), &responder()).unwrap();
    let second = stop("i-1").with_param("reason", "other");
    let err = h.engine.submit(second, &responder()).unwrap_err();
    assert!(matches!(err, ActionError::ResourceConflict(ref t) if t == "i-1"));

    assert_eq!(first.wait().await.unwrap().status, ActionStatus::Completed);
    assert_eq!(h.provider.calls_for("instance.stop"), 1);

    // Released with the terminal result.
    let third = stop("i-1").with_param("reason", "follow-up");
    let result = h.engine.submit(third, &responder()).unwrap().wait().await.unwrap();
    assert_eq!(result.status, ActionStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_target_awaiting_approval_is_reserved() {
    let h = harness(config());
    let pending = h.engine.submit(rotate("svc/payments"), &responder()).unwrap();
    tokio::task::yield_now().await;

    let other = rotate("svc/payments").with_param("credential_id", "AKIAOTHER");
    let err = h.engine.submit(other.clone(), &responder()).unwrap_err();
    assert_eq!(err.kind(), "ResourceConflictError");

    assert!(h.engine.cancel(pending.action_id()).unwrap());
    pending.wait().await.unwrap();
    let resubmitted = h.engine.submit(other, &responder()).unwrap();
    assert_eq!(
        h.engine.status(resubmitted.action_id()),
        Some(ActionStatus::AwaitingApproval)
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_queued_action() {
    let provider = InMemoryProvider::new();
    provider.set_latency("instance.stop", Duration::from_secs(5));
    let h = harness_with(
        EngineConfig {
            max_concurrent_actions: 1,
            ..config()
        },
        provider,
    );

    let running_action = stop("i-1");
    let running_id = running_action.id;
    let running = h.engine.submit(running_action, &responder()).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let queued_action = stop("i-2");
    let queued_id = queued_action.id;
    let queued = h.engine.submit(queued_action, &responder()).unwrap();
    assert_eq!(h.engine.status(queued_id), Some(ActionStatus::Queued));

    assert!(h.engine.cancel(queued_id).unwrap());
    // Past state capture: too late.
    assert!(!h.engine.cancel(running_id).unwrap());

    let cancelled = queued.wait().await.unwrap();
    assert_eq!(cancelled.status, ActionStatus::Failed);
    assert_eq!(cancelled.error.unwrap().kind, "CancelledError");
    assert_eq!(running.wait().await.unwrap().status, ActionStatus::Completed);
    assert_eq!(calls_on(&h.provider, "i-2"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_awaiting_approval() {
    let h = harness(config());
    let action = rotate("svc/payments");
    let id = action.id;
    let handle = h.engine.submit(action, &responder()).unwrap();
    tokio::task::yield_now().await;

    assert!(h.engine.cancel(id).unwrap());
    let result = handle.wait().await.unwrap();
    assert_eq!(result.status, ActionStatus::Failed);
    assert_eq!(result.error.unwrap().kind, "CancelledError");
    assert_eq!(h.provider.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_unknown_action() {
    let h = harness(config());
    let err = h.engine.cancel(uuid::Uuid::new_v4()).unwrap_err();
    assert_eq!(err.kind(), "NotFoundError");
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_queue_and_finishes_in_flight() {
    let provider = InMemoryProvider::new();
    provider.set_latency("instance.stop", Duration::from_secs(5));
    let h = harness_with(
        EngineConfig {
            max_concurrent_actions: 1,
            ..config()
        },
        provider,
    );

    let running = h.engine.submit(stop("i-1"), &responder()).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let queued = h.engine.submit(stop("i-2"), &responder()).unwrap();
    let pending = h.engine.submit(rotate("svc/payments"), &responder()).unwrap();

    h.engine.shutdown().await;

    assert_eq!(running.wait().await.unwrap().status, ActionStatus::Completed);
    let drained = queued.wait().await.unwrap();
    assert_eq!(drained.status, ActionStatus::Failed);
    assert_eq!(drained.error.unwrap().kind, "ShuttingDownError");
    let withdrawn = pending.wait().await.unwrap();
    assert_eq!(withdrawn.status, ActionStatus::Failed);
    assert_eq!(withdrawn.error.unwrap().kind, "ShuttingDownError");
    assert_eq!(h.provider.calls_for("credentials.rotate"), 0);

    let err = h.engine.submit(stop("i-3"), &responder()).unwrap_err();
    assert!(matches!(err, ActionError::ShuttingDown));
    assert!(h.engine.health().shutting_down);
}

// =============================================================================
// Durable audit
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_jsonl_audit_trail() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    let provider = Arc::new(InMemoryProvider::new());
    let mut registry = ActionRegistry::new();
    registry.register_defaults(provider).unwrap();
    let sink = Arc::new(JsonlAuditSink::open(&path).unwrap());
    let engine = ExecutionEngine::start(config(), registry, sink).unwrap();

    let result = engine
        .submit(stop("i-1"), &responder())
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(result.status, ActionStatus::Completed);

    let content = std::fs::read_to_string(&path).unwrap();
    let records: Vec<AuditRecord> = content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 6);
    assert!(records.iter().all(|r| r.action_id == Some(result.action_id)));
}
