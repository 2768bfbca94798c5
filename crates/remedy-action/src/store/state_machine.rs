//! Action state machine with validated transitions.
//!
//! Submitted -> Validated -> (AwaitingApproval ->) Queued -> Executing ->
//! Completed/Failed/RolledBack/RolledBackFailed

use crate::error::ActionError;
use crate::types::ActionStatus;

/// Validate that a status transition is allowed.
///
/// Valid transitions:
/// - Submitted -> Validated
/// - Validated -> AwaitingApproval
/// - Validated -> Queued
/// - AwaitingApproval -> Queued (approved)
/// - AwaitingApproval -> Rejected
/// - AwaitingApproval -> Expired
/// - AwaitingApproval -> Failed (cancelled)
/// - Queued -> Executing
/// - Queued -> Failed (cancelled or shut down)
/// - Executing -> Completed
/// - Executing -> Failed
/// - Executing -> RolledBack
/// - Executing -> RolledBackFailed
pub fn validate_transition(from: ActionStatus, to: ActionStatus) -> Result<(), ActionError> {
    use ActionStatus::*;

    let valid = matches!(
        (from, to),
        (Submitted, Validated)
            | (Validated, AwaitingApproval)
            | (Validated, Queued)
            | (AwaitingApproval, Queued)
            | (AwaitingApproval, Rejected)
            | (AwaitingApproval, Expired)
            | (AwaitingApproval, Failed)
            | (Queued, Executing)
            | (Queued, Failed)
            | (Executing, Completed)
            | (Executing, Failed)
            | (Executing, RolledBack)
            | (Executing, RolledBackFailed)
    );

    if valid {
        Ok(())
    } else {
        Err(ActionError::InvalidTransition(from, to))
    }
}
