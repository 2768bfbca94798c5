//! Credential rotation handler.
//!
//! Rotation cannot be undone: the old secret is gone once the provider
//! accepts the call. The definition therefore requires human approval.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::error::ProviderError;
use crate::handler::{simulated_output, target_exists, ActionOutput, RemediationHandler};
use crate::provider::{ProviderClient, ProviderRequest};
use crate::types::{
    ActionCategory, ActionDefinition, RemediationAction, RiskTier, StateSnapshot,
};

pub const ACTION_TYPE: &str = "rotate_credentials";
const OPERATION: &str = "credentials.rotate";

/// Handler for `rotate_credentials` (CRITICAL risk, irreversible, approval required).
pub struct RotateCredentialsHandler {
    provider: Arc<dyn ProviderClient>,
}

impl RotateCredentialsHandler {
    pub fn new(provider: Arc<dyn ProviderClient>) -> Self {
        Self { provider }
    }

    pub fn definition() -> ActionDefinition {
        ActionDefinition::new(ACTION_TYPE, ActionCategory::Identity, RiskTier::Critical)
            .with_params(["credential_id"])
            .with_permissions(["identity:write", "secrets:rotate"])
            .requiring_approval()
    }

    /// Credential ids are single tokens.
    fn credential_id(action: &RemediationAction) -> Result<&str, ProviderError> {
        match action.param_str("credential_id") {
            Some(id) if !id.is_empty() && !id.chars().any(char::is_whitespace) => Ok(id),
            other => Err(ProviderError::Permanent(format!(
                "malformed credential id: {:?}",
                other.unwrap_or_default()
            ))),
        }
    }
}

#[async_trait]
impl RemediationHandler for RotateCredentialsHandler {
    fn describe(&self, action: &RemediationAction) -> String {
        format!(
            "Rotate credential {} for {}",
            action.param_str("credential_id").unwrap_or("<unknown>"),
            action.target_resource
        )
    }

    async fn resource_exists(&self, action: &RemediationAction) -> Result<bool, ProviderError> {
        target_exists(self.provider.as_ref(), &action.target_resource).await
    }

    async fn capture_state(&self, _action: &RemediationAction) -> Result<Value, ProviderError> {
        // Secrets are never snapshotted.
        Ok(Value::Null)
    }

    async fn execute(&self, action: &RemediationAction) -> Result<ActionOutput, ProviderError> {
        let credential_id = Self::credential_id(action)?;
        let data = self
            .provider
            .call(ProviderRequest::new(
                OPERATION,
                action.target_resource.clone(),
                json!({
                    "credential_id": credential_id,
                    "rotated_at": Utc::now().to_rfc3339(),
                }),
            ))
            .await?;
        Ok(ActionOutput {
            message: self.describe(action),
            data,
        })
    }

    async fn rollback(
        &self,
        _action: &RemediationAction,
        _snapshot: &StateSnapshot,
    ) -> Result<(), ProviderError> {
        Err(ProviderError::Permanent(
            "credential rotation cannot be undone".to_string(),
        ))
    }

    async fn simulate(&self, action: &RemediationAction) -> Result<ActionOutput, ProviderError> {
        Self::credential_id(action)?;
        Ok(simulated_output(
            OPERATION,
            &action.target_resource,
            self.describe(action),
        ))
    }
}
