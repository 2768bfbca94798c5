//! Identity provider account disable handler.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::ProviderError;
use crate::handler::{
    describe_target, restore_target, simulated_output, target_exists, ActionOutput,
    RemediationHandler,
};
use crate::provider::{ProviderClient, ProviderRequest};
use crate::types::{
    ActionCategory, ActionDefinition, RemediationAction, RiskTier, StateSnapshot,
};

pub const ACTION_TYPE: &str = "disable_user_account";
const OPERATION: &str = "user.disable";

/// Handler for `disable_user_account` (HIGH risk, reversible).
pub struct DisableUserAccountHandler {
    provider: Arc<dyn ProviderClient>,
}

impl DisableUserAccountHandler {
    pub fn new(provider: Arc<dyn ProviderClient>) -> Self {
        Self { provider }
    }

    pub fn definition() -> ActionDefinition {
        ActionDefinition::new(ACTION_TYPE, ActionCategory::Identity, RiskTier::High)
            .with_params(["username"])
            .with_permissions(["identity:write"])
            .reversible()
    }

    fn check_account(target: &str) -> Result<(), ProviderError> {
        if target.is_empty() || target.chars().any(char::is_whitespace) {
            return Err(ProviderError::Permanent(format!(
                "malformed account name: {target:?}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RemediationHandler for DisableUserAccountHandler {
    fn describe(&self, action: &RemediationAction) -> String {
        format!(
            "Disable account {}",
            action.param_str("username").unwrap_or(&action.target_resource)
        )
    }

    async fn resource_exists(&self, action: &RemediationAction) -> Result<bool, ProviderError> {
        target_exists(self.provider.as_ref(), &action.target_resource).await
    }

    async fn capture_state(&self, action: &RemediationAction) -> Result<Value, ProviderError> {
        describe_target(self.provider.as_ref(), &action.target_resource).await
    }

    async fn execute(&self, action: &RemediationAction) -> Result<ActionOutput, ProviderError> {
        Self::check_account(&action.target_resource)?;
        let data = self
            .provider
            .call(ProviderRequest::new(
                OPERATION,
                action.target_resource.clone(),
                json!({ "enabled": false, "sessions_revoked": true }),
            ))
            .await?;
        Ok(ActionOutput {
            message: self.describe(action),
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
        Self::check_account(&action.target_resource)?;
        Ok(simulated_output(
            OPERATION,
            &action.target_resource,
            self.describe(action),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::InMemoryProvider;
    use crate::types::Priority;

    #[tokio::test]
    async fn test_disable_sets_enabled_false() {
        let provider = Arc::new(InMemoryProvider::new());
        provider.add_resource("user/jdoe", json!({"enabled": true}));
        let handler = DisableUserAccountHandler::new(provider.clone());
        let action = RemediationAction::new(ACTION_TYPE, "user/jdoe", Priority::High)
            .with_param("username", "jdoe");

        let output = handler.execute(&action).await.unwrap();
        assert_eq!(output.message, "Disable account jdoe");
        assert_eq!(provider.resource_state("user/jdoe").unwrap()["enabled"], false);
    }

    #[tokio::test]
    async fn test_simulate_rejects_blank_account() {
        let provider = Arc::new(InMemoryProvider::new());
        let handler = DisableUserAccountHandler::new(provider.clone());
        let action = RemediationAction::new(ACTION_TYPE, "j doe", Priority::High)
            .with_param("username", "j doe");

        assert!(matches!(
            handler.simulate(&action).await,
            Err(ProviderError::Permanent(_))
        ));
        let ok = RemediationAction::new(ACTION_TYPE, "user/jdoe", Priority::High)
            .with_param("username", "jdoe");
        let output = handler.simulate(&ok).await.unwrap();
        assert_eq!(output.message, "[dry-run] Disable account jdoe");
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_permanent_error_surfaces() {
        let provider = Arc::new(InMemoryProvider::new());
        provider.fail_next("user.disable", ProviderError::Permanent("403 forbidden".into()));
        let handler = DisableUserAccountHandler::new(provider);
        let action = RemediationAction::new(ACTION_TYPE, "user/jdoe", Priority::High)
            .with_param("username", "jdoe");
        let err = handler.execute(&action).await.unwrap_err();
        assert_eq!(err, ProviderError::Permanent("403 forbidden".into()));
    }
}
