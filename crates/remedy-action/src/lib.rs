//! Remediation action engine.
//!
//! Authorizes, deduplicates, validates and executes remediation actions
//! against cloud infrastructure, with approval gating for risky actions,
//! state capture and rollback, rate limiting, and an append-only audit trail.

pub mod approval;
pub mod audit;
pub mod auth;
pub mod engine;
pub mod error;
pub mod handler;
pub mod health;
pub mod idempotency;
pub mod lock;
pub mod provider;
pub mod queue;
pub mod rate_limit;
pub mod registry;
mod safety;
pub mod store;
pub mod types;
mod worker;

pub use approval::ApprovalGate;
pub use audit::{AuditEvent, AuditOutcome, AuditRecord, AuditSink, JsonlAuditSink, MemoryAuditSink, Urgency};
pub use auth::AuthorizationGate;
pub use engine::{ActionHandle, ExecutionEngine};
pub use error::{ActionError, AuditError, ProviderError};
pub use handler::{ActionOutput, RemediationHandler};
pub use health::HealthSnapshot;
pub use idempotency::{fingerprint, IdempotencyCache};
pub use provider::{InMemoryProvider, ProviderClient, ProviderRequest};
pub use rate_limit::RateLimiter;
pub use registry::{ActionRegistry, HandlerFactory};
pub use types::{
    ActionCategory, ActionDefinition, ActionParams, ActionRequest, ActionStatus, ActionSubmission,
    ApprovalDecision, ApprovalRequest, ApprovalState, AuthorizationLevel, Decision, ErrorInfo,
    ExecutionResult, Priority, RemediationAction, RiskTier, SecurityContext, StateSnapshot,
};
