//! Action lifecycle management.
//!
//! Tracks every admitted action through the state machine. Each transition
//! is audited before it is applied; a failed append leaves the state as it
//! was. Terminal results are published on the action's result channel.
//!
//! Transitions of a live action append while the store is locked, so the
//! trail and the stored status never disagree. Sinks that do blocking I/O
//! keep it off the async workers themselves (see `JsonlAuditSink`).

pub mod state_machine;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditOutcome, AuditRecord, AuditSink, Urgency};
use crate::error::ActionError;
use crate::store::state_machine::validate_transition;
use crate::types::{ActionStatus, ErrorInfo, ExecutionResult, RemediationAction};

struct ActionRecord {
    action: RemediationAction,
    status: ActionStatus,
    principal: String,
    fingerprint: Option<String>,
    cancel_requested: bool,
    capture_started: bool,
    results: watch::Sender<Option<ExecutionResult>>,
}

#[derive(Default)]
struct StoreState {
    live: HashMap<Uuid, ActionRecord>,
    finished: HashMap<Uuid, (Instant, ExecutionResult)>,
    terminal_log: VecDeque<(Instant, ActionStatus)>,
}

/// In-memory action store with audited transitions.
pub struct ActionStore {
    audit: Arc<dyn AuditSink>,
    retention: Duration,
    state: Mutex<StoreState>,
}

impl ActionStore {
    /// `retention` bounds how long finished results and terminal counts are kept.
    pub fn new(audit: Arc<dyn AuditSink>, retention: Duration) -> Self {
        Self {
            audit,
            retention,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Admit a new action in `Submitted`.
    pub fn insert(
        &self,
        action: RemediationAction,
        principal: &str,
        fingerprint: Option<String>,
        results: watch::Sender<Option<ExecutionResult>>,
    ) -> Result<(), ActionError> {
        // Nothing else can see this action yet, so it is audited before the
        // store is locked.
        self.audit.append(
            AuditRecord::new(
                principal,
                AuditEvent::Transition {
                    from: None,
                    to: ActionStatus::Submitted,
                },
                AuditOutcome::Success,
            )
            .for_action(&action),
        )?;
        self.lock().live.insert(
            action.id,
            ActionRecord {
                action,
                status: ActionStatus::Submitted,
                principal: principal.to_string(),
                fingerprint,
                cancel_requested: false,
                capture_started: false,
                results,
            },
        );
        Ok(())
    }

    /// Move a live action to a non-terminal status. Returns the previous status.
    pub fn transition(&self, id: Uuid, to: ActionStatus, detail: &str) -> Result<ActionStatus, ActionError> {
        let mut state = self.lock();
        let record = state.live.get_mut(&id).ok_or(ActionError::NotFound(id))?;
        let from = record.status;
        validate_transition(from, to)?;
        self.audit.append(
            AuditRecord::new(
                &record.principal,
                AuditEvent::Transition {
                    from: Some(from),
                    to,
                },
                AuditOutcome::Success,
            )
            .for_action(&record.action)
            .with_detail(detail),
        )?;
        record.status = to;
        tracing::debug!(action_id = %id, from = %from, to = %to, "Action transition");
        Ok(from)
    }

    /// Write the terminal result of a live action and publish it.
    ///
    /// If the terminal transition cannot be audited the action is reported
    /// as failed with an `AuditError`.
    pub fn finish(&self, mut result: ExecutionResult) -> ExecutionResult {
        let id = result.action_id;
        let mut state = self.lock();
        let Some(record) = state.live.remove(&id) else {
            tracing::warn!(action_id = %id, "Finish for unknown or already finished action");
            return result;
        };

        let from = record.status;
        let written = validate_transition(from, result.status).and_then(|_| {
            let mut entry = AuditRecord::new(
                &record.principal,
                AuditEvent::Transition {
                    from: Some(from),
                    to: result.status,
                },
                terminal_outcome(result.status),
            )
            .for_action(&record.action)
            .with_urgency(terminal_urgency(result.status));
            if let Some(error) = &result.error {
                entry = entry.with_detail(format!("{}: {}", error.kind, error.message));
            }
            self.audit.append(entry).map_err(ActionError::from)
        });

        if let Err(e) = written {
            tracing::error!(action_id = %id, error = %e, "Terminal transition not recorded");
            if result.status == ActionStatus::Completed {
                result.status = ActionStatus::Failed;
            }
            result.error = Some(ErrorInfo {
                kind: e.kind().to_string(),
                message: e.to_string(),
            });
        }

        let now = Instant::now();
        record.results.send_replace(Some(result.clone()));
        state.finished.insert(id, (now, result.clone()));
        state.terminal_log.push_back((now, result.status));
        self.prune(&mut state, now);
        result
    }

    /// Forget an action whose admission failed part-way.
    pub fn discard(&self, id: Uuid) {
        self.lock().live.remove(&id);
    }

    pub fn status(&self, id: Uuid) -> Option<ActionStatus> {
        let state = self.lock();
        state
            .live
            .get(&id)
            .map(|r| r.status)
            .or_else(|| state.finished.get(&id).map(|(_, r)| r.status))
    }

    /// Terminal result of a finished action still within retention.
    pub fn result(&self, id: Uuid) -> Option<ExecutionResult> {
        self.lock().finished.get(&id).map(|(_, r)| r.clone())
    }

    pub fn action(&self, id: Uuid) -> Option<RemediationAction> {
        self.lock().live.get(&id).map(|r| r.action.clone())
    }

    pub fn principal(&self, id: Uuid) -> Option<String> {
        self.lock().live.get(&id).map(|r| r.principal.clone())
    }

    pub fn fingerprint(&self, id: Uuid) -> Option<String> {
        self.lock().live.get(&id).and_then(|r| r.fingerprint.clone())
    }

    /// Ask a live action to stop. Refused once state capture has begun.
    pub fn request_cancel(&self, id: Uuid) -> bool {
        let mut state = self.lock();
        match state.live.get_mut(&id) {
            Some(record) if !record.capture_started => {
                record.cancel_requested = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_cancel_requested(&self, id: Uuid) -> bool {
        self.lock()
            .live
            .get(&id)
            .is_some_and(|r| r.cancel_requested)
    }

    /// Mark the start of state capture, past which cancellation is refused.
    /// Returns `false` if a cancel arrived first.
    pub fn begin_capture(&self, id: Uuid) -> bool {
        let mut state = self.lock();
        match state.live.get_mut(&id) {
            Some(record) if !record.cancel_requested => {
                record.capture_started = true;
                true
            }
            _ => false,
        }
    }

    /// Live actions currently in `status`.
    pub fn count_in(&self, status: ActionStatus) -> usize {
        self.lock()
            .live
            .values()
            .filter(|r| r.status == status)
            .count()
    }

    /// Terminal outcomes within the last `window`, by status.
    pub fn terminal_counts(&self, window: Duration) -> BTreeMap<ActionStatus, u64> {
        let now = Instant::now();
        let mut state = self.lock();
        self.prune(&mut state, now);
        let mut counts = BTreeMap::new();
        for (at, status) in &state.terminal_log {
            if now.duration_since(*at) < window {
                *counts.entry(*status).or_insert(0) += 1;
            }
        }
        counts
    }

    fn prune(&self, state: &mut StoreState, now: Instant) {
        let retention = self.retention;
        while let Some((at, _)) = state.terminal_log.front() {
            if now.duration_since(*at) >= retention {
                state.terminal_log.pop_front();
            } else {
                break;
            }
        }
        state
            .finished
            .retain(|_, (at, _)| now.duration_since(*at) < retention);
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn terminal_outcome(status: ActionStatus) -> AuditOutcome {
    match status {
        ActionStatus::Completed => AuditOutcome::Success,
        _ => AuditOutcome::Failure,
    }
}

fn terminal_urgency(status: ActionStatus) -> Urgency {
    match status {
        ActionStatus::RolledBackFailed => Urgency::Critical,
        ActionStatus::Failed | ActionStatus::RolledBack | ActionStatus::Expired => Urgency::High,
        _ => Urgency::Normal,
    }
}
