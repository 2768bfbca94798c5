//! Safety pipeline around the execute phase.
//!
//! Before execute: reservation check, existence check, cancellation check,
//! and state capture for reversible actions. After a failed execute: rollback
//! from the captured snapshot, attempted exactly once and bounded by the
//! action timeout.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{error, info};

use crate::audit::{AuditEvent, AuditOutcome, AuditRecord, Urgency};
use crate::engine::{EngineShared, Outcome};
use crate::error::{ActionError, ProviderError};
use crate::handler::RemediationHandler;
use crate::types::{ActionDefinition, ActionStatus, RemediationAction, StateSnapshot};
use crate::worker::Member;

/// An action that passed every pre-execution check. Its target stays
/// reserved until `EngineShared::finish`.
pub(crate) struct Prepared {
    pub(crate) action: RemediationAction,
    pub(crate) started_at: DateTime<Utc>,
    snapshot: Option<StateSnapshot>,
    permit: tokio::sync::OwnedSemaphorePermit,
}

impl Prepared {
    /// Give up the worker slot.
    pub(crate) fn release(self) -> (RemediationAction, DateTime<Utc>) {
        drop(self.permit);
        (self.action, self.started_at)
    }
}

/// Run the pre-execution checks. On failure the action is finished here
/// and `None` is returned.
///
/// The caller bounds this with the action deadline; if the future is
/// dropped part-way the caller finishes the action.
pub(crate) async fn prepare(
    shared: &EngineShared,
    definition: &ActionDefinition,
    handler: &dyn RemediationHandler,
    member: Member,
    started_at: DateTime<Utc>,
) -> Option<Prepared> {
    let Member { action, permit } = member;

    if shared.store.is_cancel_requested(action.id) {
        drop(permit);
        shared.finish(
            &action,
            Outcome::failed(ActionStatus::Failed, started_at, &ActionError::Cancelled),
        );
        return None;
    }
    if let Err(e) = shared
        .store
        .transition(action.id, ActionStatus::Executing, "")
    {
        drop(permit);
        shared.finish(&action, Outcome::failed(ActionStatus::Failed, started_at, &e));
        return None;
    }

    if let Err(e) = check_prerequisites(shared, handler, &action).await {
        drop(permit);
        shared.finish(&action, Outcome::failed(ActionStatus::Failed, started_at, &e));
        return None;
    }

    if !shared.store.begin_capture(action.id) {
        drop(permit);
        shared.finish(
            &action,
            Outcome::failed(ActionStatus::Failed, started_at, &ActionError::Cancelled),
        );
        return None;
    }

    let snapshot = if definition.reversible {
        match capture_state(shared, handler, &action).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                drop(permit);
                shared.finish(&action, Outcome::failed(ActionStatus::Failed, started_at, &e));
                return None;
            }
        }
    } else {
        None
    };

    Some(Prepared {
        action,
        started_at,
        snapshot,
        permit,
    })
}

/// Confirm the target is still reserved for this action and still exists.
async fn check_prerequisites(
    shared: &EngineShared,
    handler: &dyn RemediationHandler,
    action: &RemediationAction,
) -> Result<(), ActionError> {
    shared
        .locks
        .ensure_held(&action.target_resource, action.id)?;
    shared.limiter.acquire().await;
    if !shared.is_dry_run(action) && !handler.resource_exists(action).await? {
        return Err(ActionError::Execution(ProviderError::NotFound(
            action.target_resource.clone(),
        )));
    }
    Ok(())
}

async fn capture_state(
    shared: &EngineShared,
    handler: &dyn RemediationHandler,
    action: &RemediationAction,
) -> Result<StateSnapshot, ActionError> {
    shared.limiter.acquire().await;
    let payload = if shared.is_dry_run(action) {
        json!({ "simulated": true })
    } else {
        handler
            .capture_state(action)
            .await
            .map_err(|e| ActionError::StateCapture(e.to_string()))?
    };
    Ok(StateSnapshot {
        action_id: action.id,
        payload,
        captured_at: Utc::now(),
    })
}

/// Finish an action whose execute phase failed, rolling back when possible.
pub(crate) async fn fail_after_execute(
    shared: &EngineShared,
    definition: &ActionDefinition,
    handler: &dyn RemediationHandler,
    mut prepared: Prepared,
    cause: &ActionError,
    attempts: u32,
) {
    let snapshot = prepared.snapshot.take();
    let outcome = match snapshot {
        Some(snapshot) if definition.reversible => {
            match roll_back(shared, handler, &prepared.action, &snapshot).await {
                Ok(()) => Outcome::failed(ActionStatus::RolledBack, prepared.started_at, cause)
                    .with_rollback(),
                Err(rollback_err) => {
                    let err = match rollback_err {
                        ActionError::Rollback(msg) => {
                            ActionError::Rollback(format!("{} (after: {})", msg, cause))
                        }
                        other => other,
                    };
                    Outcome::failed(ActionStatus::RolledBackFailed, prepared.started_at, &err)
                }
            }
        }
        _ => Outcome::failed(ActionStatus::Failed, prepared.started_at, cause),
    };
    let (action, _) = prepared.release();
    shared.finish(&action, outcome.with_attempts(attempts));
}

/// One rollback attempt, audited whatever its outcome. Never retried.
async fn roll_back(
    shared: &EngineShared,
    handler: &dyn RemediationHandler,
    action: &RemediationAction,
    snapshot: &StateSnapshot,
) -> Result<(), ActionError> {
    let limit = shared.config.action_timeout_seconds;
    let call = async {
        shared.limiter.acquire().await;
        if shared.is_dry_run(action) {
            Ok(())
        } else {
            handler.rollback(action, snapshot).await
        }
    };
    let attempt = match tokio::time::timeout(Duration::from_secs(limit), call).await {
        Ok(attempt) => attempt,
        Err(_) => Err(ProviderError::Transient(format!(
            "rollback timed out after {limit} seconds"
        ))),
    };

    let principal = shared.store.principal(action.id).unwrap_or_default();
    let record = match &attempt {
        Ok(()) => AuditRecord::new(principal, AuditEvent::RollbackAttempt, AuditOutcome::Success)
            .with_urgency(Urgency::High)
            .with_detail("restored pre-execution state"),
        Err(e) => AuditRecord::new(principal, AuditEvent::RollbackAttempt, AuditOutcome::Failure)
            .with_urgency(Urgency::Critical)
            .with_detail(e.to_string()),
    };
    shared.audit.append(record.for_action(action))?;

    match attempt {
        Ok(()) => {
            info!(action_id = %action.id, target = %action.target_resource, "Rollback succeeded");
            Ok(())
        }
        Err(e) => {
            error!(
                action_id = %action.id,
                target = %action.target_resource,
                error = %e,
                "Rollback failed"
            );
            Err(ActionError::Rollback(e.to_string()))
        }
    }
}
