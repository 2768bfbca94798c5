//! Execution engine.
//!
//! Admits actions through authorization, idempotency, validation and conflict
//! checks, parks risk-gated ones on the approval gate, and hands the rest to
//! a fixed worker pool through a priority queue.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use remedy_core::config::EngineConfig;

use crate::approval::ApprovalGate;
use crate::audit::{AuditEvent, AuditOutcome, AuditRecord, AuditSink};
use crate::auth::AuthorizationGate;
use crate::error::ActionError;
use crate::health::HealthSnapshot;
use crate::idempotency::{fingerprint, Claim, IdempotencyCache, ResultReceiver};
use crate::lock::ResourceLocks;
use crate::queue::ActionQueue;
use crate::rate_limit::RateLimiter;
use crate::registry::ActionRegistry;
use crate::store::ActionStore;
use crate::types::{
    ActionDefinition, ActionStatus, ActionSubmission, ApprovalDecision, ApprovalRequest, Decision,
    ErrorInfo, ExecutionResult, RemediationAction, SecurityContext,
};
use crate::worker;

/// Waits for the terminal result of one submitted action.
#[derive(Debug, Clone)]
pub struct ActionHandle {
    action_id: Uuid,
    receiver: ResultReceiver,
}

impl ActionHandle {
    fn new(action_id: Uuid, receiver: ResultReceiver) -> Self {
        Self {
            action_id,
            receiver,
        }
    }

    fn ready(result: ExecutionResult) -> Self {
        let action_id = result.action_id;
        let (_sender, receiver) = watch::channel(Some(result));
        Self::new(action_id, receiver)
    }

    /// Id of the action whose result this handle yields. For a duplicate
    /// submission this is the id of the original action.
    pub fn action_id(&self) -> Uuid {
        self.action_id
    }

    /// The result, if it has been written.
    pub fn try_result(&self) -> Option<ExecutionResult> {
        self.receiver.borrow().clone()
    }

    pub async fn wait(mut self) -> Result<ExecutionResult, ActionError> {
        let result = self
            .receiver
            .wait_for(|r| r.is_some())
            .await
            .map_err(|_| ActionError::ShuttingDown)?;
        result.clone().ok_or(ActionError::ShuttingDown)
    }
}

/// How an action ended, before it is stamped into an `ExecutionResult`.
pub(crate) struct Outcome {
    status: ActionStatus,
    started_at: DateTime<Utc>,
    error: Option<ErrorInfo>,
    rollback_performed: bool,
    attempts: u32,
    output: Option<Value>,
}

impl Outcome {
    pub(crate) fn completed(started_at: DateTime<Utc>, attempts: u32, output: Value) -> Self {
        Self {
            status: ActionStatus::Completed,
            started_at,
            error: None,
            rollback_performed: false,
            attempts,
            output: Some(output),
        }
    }

    pub(crate) fn failed(status: ActionStatus, started_at: DateTime<Utc>, error: &ActionError) -> Self {
        Self {
            status,
            started_at,
            error: Some(ErrorInfo {
                kind: error.kind().to_string(),
                message: error.to_string(),
            }),
            rollback_performed: false,
            attempts: 0,
            output: None,
        }
    }

    pub(crate) fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub(crate) fn with_rollback(mut self) -> Self {
        self.rollback_performed = true;
        self
    }
}

fn label_dry_run(error: ErrorInfo, dry_run: bool) -> ErrorInfo {
    if dry_run {
        ErrorInfo {
            kind: format!("DryRun{}", error.kind),
            message: format!("[dry-run] {}", error.message),
        }
    } else {
        error
    }
}

/// State shared by the engine front end, the workers and approval waiters.
pub(crate) struct EngineShared {
    pub(crate) config: EngineConfig,
    pub(crate) registry: ActionRegistry,
    pub(crate) audit: Arc<dyn AuditSink>,
    pub(crate) auth: AuthorizationGate,
    pub(crate) cache: IdempotencyCache,
    pub(crate) queue: Mutex<ActionQueue>,
    pub(crate) queue_ready: Notify,
    pub(crate) limiter: RateLimiter,
    pub(crate) locks: ResourceLocks,
    pub(crate) approvals: ApprovalGate,
    pub(crate) store: ActionStore,
    pub(crate) slots: Arc<Semaphore>,
    pub(crate) shutdown: watch::Sender<bool>,
}

impl EngineShared {
    pub(crate) fn is_dry_run(&self, action: &RemediationAction) -> bool {
        self.config.dry_run_mode || action.dry_run
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(crate) fn queue_lock(&self) -> MutexGuard<'_, ActionQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand a `Queued` action to the worker pool.
    pub(crate) fn enqueue(&self, action: RemediationAction) {
        let refused = {
            let mut queue = self.queue_lock();
            if self.is_shutting_down() {
                Some(action)
            } else {
                queue.push(action);
                None
            }
        };
        match refused {
            Some(action) => {
                self.finish(
                    &action,
                    Outcome::failed(ActionStatus::Failed, Utc::now(), &ActionError::ShuttingDown),
                );
            }
            None => self.queue_ready.notify_one(),
        }
    }

    /// Resolves once the queue is non-empty.
    pub(crate) async fn wait_for_work(&self) {
        loop {
            let notified = self.queue_ready.notified();
            if !self.queue_lock().is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Write the terminal result of `action`, publish it and cache it.
    pub(crate) fn finish(&self, action: &RemediationAction, outcome: Outcome) -> ExecutionResult {
        let dry_run = self.is_dry_run(action);
        let error = outcome.error.map(|e| label_dry_run(e, dry_run));
        let fingerprint = self.store.fingerprint(action.id);
        // Free the target before the result is published so a caller woken
        // by it can resubmit against the same resource.
        self.locks.release(&action.target_resource, action.id);
        let result = self.store.finish(ExecutionResult {
            action_id: action.id,
            status: outcome.status,
            started_at: outcome.started_at,
            ended_at: Utc::now(),
            error,
            rollback_performed: outcome.rollback_performed,
            dry_run,
            attempts: outcome.attempts,
            output: outcome.output,
        });
        if let Some(fp) = fingerprint {
            self.cache.complete(&fp, result.clone());
        }
        self.cache.purge_expired();

        match result.status {
            ActionStatus::Completed => info!(
                action_id = %action.id,
                action_type = %action.action_type,
                target = %action.target_resource,
                attempts = result.attempts,
                dry_run,
                "Action completed"
            ),
            ActionStatus::RolledBackFailed => error!(
                action_id = %action.id,
                action_type = %action.action_type,
                target = %action.target_resource,
                error = ?result.error,
                "Rollback failed, manual intervention required"
            ),
            status => warn!(
                action_id = %action.id,
                action_type = %action.action_type,
                target = %action.target_resource,
                status = %status,
                error = ?result.error,
                "Action did not complete"
            ),
        }
        result
    }

    fn audit_cache_hit(
        &self,
        action: &RemediationAction,
        context: &SecurityContext,
        original_action_id: Uuid,
    ) -> Result<(), ActionError> {
        self.audit.append(
            AuditRecord::new(
                &context.principal,
                AuditEvent::CacheHit { original_action_id },
                AuditOutcome::Success,
            )
            .for_action(action),
        )?;
        info!(
            action_id = %action.id,
            original_action_id = %original_action_id,
            "Duplicate submission answered from idempotency cache"
        );
        Ok(())
    }
}

/// Front end of the remediation engine.
///
/// Must be started inside a Tokio runtime; workers are spawned on it.
pub struct ExecutionEngine {
    shared: Arc<EngineShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutionEngine {
    /// Validate `config` and start the worker pool.
    pub fn start(
        config: EngineConfig,
        registry: ActionRegistry,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, ActionError> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        let worker_count = config.max_concurrent_actions;

        let shared = Arc::new(EngineShared {
            registry,
            auth: AuthorizationGate::new(Arc::clone(&audit)),
            cache: IdempotencyCache::new(Duration::from_secs(config.idempotency_ttl_seconds)),
            queue: Mutex::new(ActionQueue::new()),
            queue_ready: Notify::new(),
            limiter: RateLimiter::per_minute(config.max_api_calls_per_minute),
            locks: ResourceLocks::new(),
            approvals: ApprovalGate::new(Duration::from_secs(config.approval_timeout_seconds)),
            store: ActionStore::new(
                Arc::clone(&audit),
                Duration::from_secs(config.health_window_seconds),
            ),
            slots: Arc::new(Semaphore::new(worker_count)),
            shutdown,
            audit,
            config,
        });

        let workers = (0..worker_count)
            .map(|id| tokio::spawn(worker::run(Arc::clone(&shared), id)))
            .collect();

        info!(
            workers = worker_count,
            calls_per_minute = shared.config.max_api_calls_per_minute,
            dry_run = shared.config.dry_run_mode,
            action_types = ?shared.registry.action_types(),
            "Execution engine started"
        );

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Submit one action on behalf of `context`.
    ///
    /// Errors are admission failures; the handle yields the terminal result
    /// of an admitted action. A duplicate of a recent or running action gets
    /// a handle on the original's result.
    pub fn submit(
        &self,
        action: RemediationAction,
        context: &SecurityContext,
    ) -> Result<ActionHandle, ActionError> {
        let shared = &self.shared;
        if shared.is_shutting_down() {
            return Err(ActionError::ShuttingDown);
        }

        let definition = shared.registry.lookup(&action.action_type)?;
        shared.auth.authorize(&action, &definition, context)?;

        let (results, receiver) = watch::channel(None);
        let fingerprint = if shared.is_dry_run(&action) {
            None
        } else {
            let fp = fingerprint(&action);
            match shared.cache.claim(&fp, action.id, receiver.clone()) {
                Claim::Acquired => Some(fp),
                Claim::Hit(result) => {
                    shared.audit_cache_hit(&action, context, result.action_id)?;
                    return Ok(ActionHandle::ready(result));
                }
                Claim::InFlight {
                    action_id,
                    receiver,
                } => {
                    shared.audit_cache_hit(&action, context, action_id)?;
                    return Ok(ActionHandle::new(action_id, receiver));
                }
            }
        };

        let action_id = action.id;
        match self.admit(action, &definition, context, fingerprint.clone(), results) {
            Ok(()) => Ok(ActionHandle::new(action_id, receiver)),
            Err(e) => {
                if let Some(fp) = &fingerprint {
                    shared.cache.release(fp, action_id);
                }
                warn!(action_id = %action_id, error = %e, "Submission rejected");
                Err(e)
            }
        }
    }

    /// Outbound result for an action that `submit` refused.
    ///
    /// Nothing was stored, executed or cached for it.
    pub fn admission_result(&self, action: &RemediationAction, error: &ActionError) -> ExecutionResult {
        let now = Utc::now();
        let dry_run = self.shared.is_dry_run(action);
        let status = if error.is_rejection() {
            ActionStatus::Rejected
        } else {
            ActionStatus::Failed
        };
        let error = ErrorInfo {
            kind: error.kind().to_string(),
            message: error.to_string(),
        };
        ExecutionResult {
            action_id: action.id,
            status,
            started_at: now,
            ended_at: now,
            error: Some(label_dry_run(error, dry_run)),
            rollback_performed: false,
            dry_run,
            attempts: 0,
            output: None,
        }
    }

    /// Submit every action of a vetted submission, in document order.
    pub fn submit_batch(&self, submission: ActionSubmission) -> Vec<Result<ActionHandle, ActionError>> {
        let incident_id = submission.incident_id.clone();
        let (actions, context) = submission.into_actions();
        info!(
            incident_id = %incident_id,
            actions = actions.len(),
            principal = %context.principal,
            "Submission received"
        );
        actions
            .into_iter()
            .map(|action| self.submit(action, &context))
            .collect()
    }

    fn admit(
        &self,
        action: RemediationAction,
        definition: &ActionDefinition,
        context: &SecurityContext,
        fingerprint: Option<String>,
        results: watch::Sender<Option<ExecutionResult>>,
    ) -> Result<(), ActionError> {
        let shared = &self.shared;
        shared.registry.validate(&action, context)?;
        // Held until the terminal result is written, see `EngineShared::finish`.
        shared.locks.reserve(&action.target_resource, action.id)?;

        let routed = shared
            .store
            .insert(action.clone(), &context.principal, fingerprint, results)
            .and_then(|_| {
                self.route(&action, definition).inspect_err(|_| {
                    shared.store.discard(action.id);
                })
            });
        if routed.is_err() {
            shared.locks.release(&action.target_resource, action.id);
        }
        routed
    }

    fn route(&self, action: &RemediationAction, definition: &ActionDefinition) -> Result<(), ActionError> {
        let shared = &self.shared;
        shared.store.transition(action.id, ActionStatus::Validated, "")?;

        if definition.requires_approval {
            shared.store.transition(
                action.id,
                ActionStatus::AwaitingApproval,
                &format!("risk tier {}", definition.risk_tier),
            )?;
            let (_request, decision) = shared.approvals.request(action);
            tokio::spawn(await_approval(Arc::clone(shared), action.clone(), decision));
        } else {
            shared.store.transition(action.id, ActionStatus::Queued, "")?;
            shared.enqueue(action.clone());
        }
        Ok(())
    }

    /// Apply an approver's decision to a pending request.
    pub fn resolve_approval(&self, decision: ApprovalDecision) -> Result<ApprovalRequest, ActionError> {
        self.shared.approvals.resolve(decision)
    }

    /// Announcements of new approval requests.
    pub fn approval_requests(&self) -> broadcast::Receiver<ApprovalRequest> {
        self.shared.approvals.subscribe()
    }

    pub fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.shared.approvals.pending()
    }

    /// Cancel an action that has not yet begun capturing state.
    ///
    /// Returns `Ok(false)` if the action is already past that point.
    pub fn cancel(&self, action_id: Uuid) -> Result<bool, ActionError> {
        let shared = &self.shared;
        let status = shared
            .store
            .status(action_id)
            .ok_or(ActionError::NotFound(action_id))?;

        let cancelled = match status {
            ActionStatus::AwaitingApproval => shared.approvals.withdraw(action_id),
            ActionStatus::Queued => {
                let removed = shared.queue_lock().remove(action_id);
                match removed {
                    Some(item) => {
                        shared.finish(
                            &item.action,
                            Outcome::failed(ActionStatus::Failed, Utc::now(), &ActionError::Cancelled),
                        );
                        true
                    }
                    // A worker already took it; it checks the flag before capture.
                    None => shared.store.request_cancel(action_id),
                }
            }
            ActionStatus::Submitted | ActionStatus::Validated | ActionStatus::Executing => {
                shared.store.request_cancel(action_id)
            }
            _ => false,
        };
        if cancelled {
            info!(action_id = %action_id, status = %status, "Cancellation accepted");
        }
        Ok(cancelled)
    }

    pub fn status(&self, action_id: Uuid) -> Option<ActionStatus> {
        self.shared.store.status(action_id)
    }

    pub fn health(&self) -> HealthSnapshot {
        let shared = &self.shared;
        HealthSnapshot {
            queue_depth: shared.queue_lock().len(),
            in_flight: shared.store.count_in(ActionStatus::Executing),
            max_concurrent: shared.config.max_concurrent_actions,
            awaiting_approval: shared.approvals.pending_count(),
            rate_limit_remaining: shared.limiter.remaining(),
            terminal_counts: shared
                .store
                .terminal_counts(Duration::from_secs(shared.config.health_window_seconds)),
            window_seconds: shared.config.health_window_seconds,
            dry_run_mode: shared.config.dry_run_mode,
            shutting_down: shared.is_shutting_down(),
        }
    }

    /// Stop accepting work, fail whatever is still queued or awaiting
    /// approval, and wait for executing actions to finish.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        if shared.shutdown.send_replace(true) {
            return;
        }
        info!("Execution engine shutting down");

        for request in shared.approvals.pending() {
            shared.approvals.withdraw(request.action_id);
        }
        let drained = shared.queue_lock().drain();
        for item in drained {
            shared.finish(
                &item.action,
                Outcome::failed(ActionStatus::Failed, Utc::now(), &ActionError::ShuttingDown),
            );
        }

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Worker ended abnormally");
            }
        }
        info!("Execution engine stopped");
    }
}

impl Drop for ExecutionEngine {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

/// Park an approval-gated action until it is approved, rejected, withdrawn
/// or its deadline passes. Holds no worker slot.
async fn await_approval(
    shared: Arc<EngineShared>,
    action: RemediationAction,
    mut decision: oneshot::Receiver<ApprovalDecision>,
) {
    let started_at = Utc::now();
    let verdict = match tokio::time::timeout(shared.approvals.timeout(), &mut decision).await {
        Ok(Ok(verdict)) => Some(verdict),
        Ok(Err(_)) => None,
        Err(_) => match shared.approvals.expire(action.id) {
            Some(_) => {
                shared.finish(
                    &action,
                    Outcome::failed(
                        ActionStatus::Expired,
                        started_at,
                        &ActionError::ApprovalExpired(action.id),
                    ),
                );
                return;
            }
            // Resolved right at the deadline.
            None => decision.try_recv().ok(),
        },
    };

    match verdict {
        Some(verdict) if verdict.decision == Decision::Approved => {
            let detail = format!("approved by {}", verdict.decider);
            match shared.store.transition(action.id, ActionStatus::Queued, &detail) {
                Ok(_) => shared.enqueue(action),
                Err(e) => {
                    shared.finish(&action, Outcome::failed(ActionStatus::Failed, started_at, &e));
                }
            }
        }
        Some(verdict) => {
            shared.finish(
                &action,
                Outcome::failed(
                    ActionStatus::Rejected,
                    started_at,
                    &ActionError::ApprovalRejected(verdict.decider),
                ),
            );
        }
        None => {
            let cause = if shared.is_shutting_down() {
                ActionError::ShuttingDown
            } else {
                ActionError::Cancelled
            };
            shared.finish(&action, Outcome::failed(ActionStatus::Failed, started_at, &cause));
        }
    }
}
