//! Error types for the remediation engine.

use crate::types::ActionStatus;
use remedy_core::error::RemedyError;
use uuid::Uuid;

/// Errors returned by provider clients and action handlers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Network failure or provider 5xx. Worth retrying.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// Provider 4xx or a rejected request. Retrying will not help.
    #[error("permanent provider error: {0}")]
    Permanent(String),
    #[error("resource not found: {0}")]
    NotFound(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// Errors from audit sinks. Every one of them fails the enclosing operation.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Audit sink unavailable: {0}")]
    Unavailable(String),
    #[error("Audit I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from action submission, validation, and execution.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Missing or empty parameter: {0}")]
    MissingParameter(String),
    #[error("Invalid parameter {param}: {reason}")]
    InvalidParameter { param: String, reason: String },
    #[error("Insufficient permission: {0}")]
    InsufficientPermission(String),
    #[error("Resource conflict: {0} is locked by another in-flight action")]
    ResourceConflict(String),
    #[error("Unknown action type: {0}")]
    UnknownActionType(String),
    #[error("Action type already registered: {0}")]
    DuplicateType(String),
    #[error("Approval expired for action {0}")]
    ApprovalExpired(Uuid),
    #[error("Approval rejected by {0}")]
    ApprovalRejected(String),
    #[error("No pending approval for action {0}")]
    NoPendingApproval(Uuid),
    #[error("Execution failed: {0}")]
    Execution(#[from] ProviderError),
    #[error("Action execution timed out after {0} seconds")]
    Timeout(u64),
    #[error("State capture failed: {0}")]
    StateCapture(String),
    #[error("Rollback failed: {0}")]
    Rollback(String),
    #[error("Audit write failed: {0}")]
    Audit(#[from] AuditError),
    #[error("Action cancelled before execution")]
    Cancelled,
    #[error("Action not found: {0}")]
    NotFound(Uuid),
    #[error("Invalid state transition: {0} -> {1}")]
    InvalidTransition(ActionStatus, ActionStatus),
    #[error("Invalid engine configuration: {0}")]
    Config(#[from] RemedyError),
    #[error("Engine is shutting down")]
    ShuttingDown,
}

impl ActionError {
    /// Stable error-kind name reported in outbound results.
    pub fn kind(&self) -> &'static str {
        match self {
            ActionError::MissingParameter(_) => "MissingParameterError",
            ActionError::InvalidParameter { .. } => "ValidationError",
            ActionError::InsufficientPermission(_) => "InsufficientPermissionError",
            ActionError::ResourceConflict(_) => "ResourceConflictError",
            ActionError::UnknownActionType(_) => "UnknownActionTypeError",
            ActionError::DuplicateType(_) => "DuplicateTypeError",
            ActionError::ApprovalExpired(_) => "ApprovalExpiredError",
            ActionError::ApprovalRejected(_) => "ApprovalRejectedError",
            ActionError::NoPendingApproval(_) => "NoPendingApprovalError",
            ActionError::Execution(ProviderError::Transient(_)) => "TransientExecutionError",
            ActionError::Execution(_) => "ExecutionError",
            ActionError::Timeout(_) => "TimeoutError",
            ActionError::StateCapture(_) => "StateCaptureError",
            ActionError::Rollback(_) => "RollbackError",
            ActionError::Audit(_) => "AuditError",
            ActionError::Cancelled => "CancelledError",
            ActionError::NotFound(_) => "NotFoundError",
            ActionError::InvalidTransition(..) => "InvalidTransitionError",
            ActionError::Config(_) => "ConfigError",
            ActionError::ShuttingDown => "ShuttingDownError",
        }
    }

    /// Admission failures caused by the request itself rather than by the
    /// engine. These are reported with status `rejected`.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ActionError::MissingParameter(_)
                | ActionError::InvalidParameter { .. }
                | ActionError::InsufficientPermission(_)
                | ActionError::ResourceConflict(_)
                | ActionError::UnknownActionType(_)
        )
    }
}
