//! Human approval flow for risk-gated actions.
//!
//! Each gated action gets one `ApprovalRequest`, announced on a broadcast
//! channel. An external decision resolves it through `resolve`; whoever waits
//! on the returned receiver learns the verdict. Waiting never holds a worker.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

use crate::error::ActionError;
use crate::types::{ApprovalDecision, ApprovalRequest, ApprovalState, Decision, RemediationAction};

const ANNOUNCE_CAPACITY: usize = 64;

struct PendingApproval {
    request: ApprovalRequest,
    responder: oneshot::Sender<ApprovalDecision>,
}

pub struct ApprovalGate {
    timeout: Duration,
    pending: Mutex<HashMap<Uuid, PendingApproval>>,
    announcements: broadcast::Sender<ApprovalRequest>,
}

impl ApprovalGate {
    pub fn new(timeout: Duration) -> Self {
        let (announcements, _) = broadcast::channel(ANNOUNCE_CAPACITY);
        Self {
            timeout,
            pending: Mutex::new(HashMap::new()),
            announcements,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open a request for `action` and announce it to approvers.
    pub fn request(
        &self,
        action: &RemediationAction,
    ) -> (ApprovalRequest, oneshot::Receiver<ApprovalDecision>) {
        let requested_at = Utc::now();
        let deadline = requested_at
            + chrono::Duration::from_std(self.timeout).unwrap_or_else(|_| chrono::Duration::weeks(52));
        let request = ApprovalRequest {
            action_id: action.id,
            action_type: action.action_type.clone(),
            target_resource: action.target_resource.clone(),
            description: action.description.clone(),
            requested_at,
            deadline,
            decision: ApprovalState::Pending,
            decider: None,
        };
        let (responder, receiver) = oneshot::channel();
        self.lock().insert(
            action.id,
            PendingApproval {
                request: request.clone(),
                responder,
            },
        );
        // No subscribers is fine; pending requests stay listed.
        let _ = self.announcements.send(request.clone());
        tracing::info!(
            action_id = %action.id,
            action_type = %action.action_type,
            deadline = %deadline,
            "Approval requested"
        );
        (request, receiver)
    }

    /// Apply an external decision to its pending request.
    pub fn resolve(&self, decision: ApprovalDecision) -> Result<ApprovalRequest, ActionError> {
        let pending = self
            .lock()
            .remove(&decision.action_id)
            .ok_or(ActionError::NoPendingApproval(decision.action_id))?;
        let mut request = pending.request;
        request.decision = match decision.decision {
            Decision::Approved => ApprovalState::Approved,
            Decision::Rejected => ApprovalState::Rejected,
        };
        request.decider = Some(decision.decider.clone());
        let action_id = decision.action_id;
        pending
            .responder
            .send(decision)
            .map_err(|_| ActionError::NoPendingApproval(action_id))?;
        tracing::info!(action_id = %action_id, decision = ?request.decision, "Approval resolved");
        Ok(request)
    }

    /// Close a request that ran out of time. `None` if it was already resolved.
    pub fn expire(&self, action_id: Uuid) -> Option<ApprovalRequest> {
        self.lock().remove(&action_id).map(|p| {
            let mut request = p.request;
            request.decision = ApprovalState::Expired;
            request
        })
    }

    /// Withdraw a request without a decision. The waiter sees a closed channel.
    pub fn withdraw(&self, action_id: Uuid) -> bool {
        self.lock().remove(&action_id).is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalRequest> {
        self.announcements.subscribe()
    }

    /// Open requests, oldest first.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let mut requests: Vec<ApprovalRequest> =
            self.lock().values().map(|p| p.request.clone()).collect();
        requests.sort_by_key(|r| r.requested_at);
        requests
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, PendingApproval>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
