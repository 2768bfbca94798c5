//! Compute instance stop handler.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{ActionError, ProviderError};
use crate::handler::{
    describe_target, required_str, restore_target, simulated_output, target_exists, ActionOutput,
    RemediationHandler,
};
use crate::provider::{ProviderClient, ProviderRequest};
use crate::types::{
    ActionCategory, ActionDefinition, RemediationAction, RiskTier, StateSnapshot,
};

pub const ACTION_TYPE: &str = "stop_instance";
const OPERATION: &str = "instance.stop";

/// Handler for `stop_instance` (HIGH risk, reversible).
pub struct StopInstanceHandler {
    provider: Arc<dyn ProviderClient>,
}

impl StopInstanceHandler {
    pub fn new(provider: Arc<dyn ProviderClient>) -> Self {
        Self { provider }
    }

    pub fn definition() -> ActionDefinition {
        ActionDefinition::new(ACTION_TYPE, ActionCategory::Compute, RiskTier::High)
            .with_params(["reason"])
            .with_permissions(["compute:write"])
            .reversible()
    }

    /// Instance ids look like `i-` followed by letters and digits. The
    /// provider rejects anything else without touching the instance.
    fn check_instance_id(target: &str) -> Result<(), ProviderError> {
        match target.strip_prefix("i-") {
            Some(rest) if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric()) => {
                Ok(())
            }
            _ => Err(ProviderError::Permanent(format!(
                "malformed instance id: {target}"
            ))),
        }
    }
}

#[async_trait]
impl RemediationHandler for StopInstanceHandler {
    fn describe(&self, action: &RemediationAction) -> String {
        format!(
            "Stop instance {} ({})",
            action.target_resource,
            action.param_str("reason").unwrap_or("no reason given")
        )
    }

    fn validate(&self, action: &RemediationAction) -> Result<(), ActionError> {
        required_str(action, "reason")?;
        Ok(())
    }

    async fn resource_exists(&self, action: &RemediationAction) -> Result<bool, ProviderError> {
        target_exists(self.provider.as_ref(), &action.target_resource).await
    }

    async fn capture_state(&self, action: &RemediationAction) -> Result<Value, ProviderError> {
        describe_target(self.provider.as_ref(), &action.target_resource).await
    }

    async fn execute(&self, action: &RemediationAction) -> Result<ActionOutput, ProviderError> {
        Self::check_instance_id(&action.target_resource)?;
        let data = self
            .provider
            .call(ProviderRequest::new(
                OPERATION,
                action.target_resource.clone(),
                json!({ "power_state": "stopped" }),
            ))
            .await?;
        Ok(ActionOutput {
            message: format!("Instance {} stopped", action.target_resource),
            data,
        })
    }

    async fn rollback(
        &self,
        action: &RemediationAction,
        snapshot: &StateSnapshot,
    ) -> Result<(), ProviderError> {
        restore_target(self.provider.as_ref(), &action.target_resource, snapshot).await
    }

    async fn simulate(&self, action: &RemediationAction) -> Result<ActionOutput, ProviderError> {
        Self::check_instance_id(&action.target_resource)?;
        Ok(simulated_output(
            OPERATION,
            &action.target_resource,
            self.describe(action),
        ))
    }
}
