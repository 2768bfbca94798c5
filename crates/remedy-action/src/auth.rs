//! Authorization gate.
//!
//! Decides from the caller's permission set alone. Every decision, allow or
//! deny, is audited before it takes effect.

use std::sync::Arc;

use crate::audit::{AuditEvent, AuditOutcome, AuditRecord, AuditSink};
use crate::error::ActionError;
use crate::types::{ActionDefinition, RemediationAction, SecurityContext};

pub struct AuthorizationGate {
    audit: Arc<dyn AuditSink>,
}

impl AuthorizationGate {
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self { audit }
    }

    /// Permit `action` if `context` holds every permission `definition` requires.
    pub fn authorize(
        &self,
        action: &RemediationAction,
        definition: &ActionDefinition,
        context: &SecurityContext,
    ) -> Result<(), ActionError> {
        let missing = missing_permissions(definition, context);
        let record = if missing.is_empty() {
            AuditRecord::new(&context.principal, AuditEvent::Authorization, AuditOutcome::Allowed)
                .for_action(action)
        } else {
            AuditRecord::new(&context.principal, AuditEvent::Authorization, AuditOutcome::Denied)
                .for_action(action)
                .with_detail(format!("missing: {}", missing.join(", ")))
        };
        self.audit.append(record)?;

        match missing.into_iter().next() {
            None => Ok(()),
            Some(permission) => {
                tracing::warn!(
                    principal = %context.principal,
                    action_type = %action.action_type,
                    permission = %permission,
                    "Authorization denied"
                );
                Err(ActionError::InsufficientPermission(permission))
            }
        }
    }
}

/// Required permissions the caller lacks, in sorted order.
pub fn missing_permissions(definition: &ActionDefinition, context: &SecurityContext) -> Vec<String> {
    definition
        .required_permissions
        .difference(&context.permissions)
        .cloned()
        .collect()
}
