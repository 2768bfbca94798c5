//! Firewall IP block handler.
//!
//! Adds a deny rule for one address on the edge firewall. Reversible by
//! restoring the rule's previous state; blocks sharing a firewall coalesce
//! into a single provider call.

use std::net::IpAddr;
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

pub const ACTION_TYPE: &str = "block_ip_address";
const DEFAULT_FIREWALL: &str = "edge-firewall";
const OPERATION: &str = "firewall.block";

/// Handler for `block_ip_address` (MEDIUM risk, reversible, batchable).
pub struct BlockIpAddressHandler {
    provider: Arc<dyn ProviderClient>,
}

impl BlockIpAddressHandler {
    pub fn new(provider: Arc<dyn ProviderClient>) -> Self {
        Self { provider }
    }

    pub fn definition() -> ActionDefinition {
        ActionDefinition::new(ACTION_TYPE, ActionCategory::Network, RiskTier::Medium)
            .with_params(["ip"])
            .with_permissions(["network:write"])
            .reversible()
            .batchable()
    }

    fn firewall(action: &RemediationAction) -> &str {
        action.param_str("firewall").unwrap_or(DEFAULT_FIREWALL)
    }

    /// The rule is keyed by the target, which must be the address being
    /// blocked.
    fn check_rule_target(action: &RemediationAction) -> Result<IpAddr, ProviderError> {
        let target: IpAddr = action.target_resource.parse().map_err(|_| {
            ProviderError::Permanent(format!("malformed rule target: {}", action.target_resource))
        })?;
        let ip = action.param_str("ip").and_then(|ip| ip.trim().parse::<IpAddr>().ok());
        if ip != Some(target) {
            return Err(ProviderError::Permanent(format!(
                "rule target {} does not match ip {}",
                target,
                action.param_str("ip").unwrap_or("<none>")
            )));
        }
        Ok(target)
    }

    fn block_params(action: &RemediationAction) -> Value {
        json!({
            "blocked": true,
            "firewall": Self::firewall(action),
            "ip": action.param_str("ip"),
        })
    }
}

#[async_trait]
impl RemediationHandler for BlockIpAddressHandler {
    fn describe(&self, action: &RemediationAction) -> String {
        format!(
            "Block {} on {}",
            action.param_str("ip").unwrap_or("<no ip>"),
            Self::firewall(action)
        )
    }

    fn validate(&self, action: &RemediationAction) -> Result<(), ActionError> {
        let ip = required_str(action, "ip")?;
        ip.parse::<IpAddr>()
            .map_err(|e| ActionError::InvalidParameter {
                param: "ip".to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn resource_exists(&self, action: &RemediationAction) -> Result<bool, ProviderError> {
        target_exists(self.provider.as_ref(), Self::firewall(action)).await
    }

    async fn capture_state(&self, action: &RemediationAction) -> Result<Value, ProviderError> {
        describe_target(self.provider.as_ref(), &action.target_resource).await
    }

    async fn execute(&self, action: &RemediationAction) -> Result<ActionOutput, ProviderError> {
        Self::check_rule_target(action)?;
        let data = self
            .provider
            .call(ProviderRequest::new(
                OPERATION,
                action.target_resource.clone(),
                Self::block_params(action),
            ))
            .await?;
        tracing::info!(target = %action.target_resource, "IP address blocked");
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
        Self::check_rule_target(action)?;
        Ok(simulated_output(
            OPERATION,
            &action.target_resource,
            self.describe(action),
        ))
    }

    fn batch_key(&self, action: &RemediationAction) -> Option<String> {
        Some(Self::firewall(action).to_string())
    }

    async fn execute_batch(
        &self,
        actions: &[RemediationAction],
    ) -> Result<ActionOutput, ProviderError> {
        let Some(first) = actions.first() else {
            return Err(ProviderError::Permanent("empty batch".to_string()));
        };
        for action in actions {
            Self::check_rule_target(action)?;
        }
        let firewall = Self::firewall(first).to_string();
        let targets: Vec<&str> = actions.iter().map(|a| a.target_resource.as_str()).collect();
        let data = self
            .provider
            .call(ProviderRequest::new(
                "firewall.block_many",
                firewall.clone(),
                json!({ "blocked": targets }),
            ))
            .await?;
        tracing::info!(firewall = %firewall, count = actions.len(), "IP addresses blocked");
        Ok(ActionOutput {
            message: format!("Block {} addresses on {}", actions.len(), firewall),
            data,
        })
    }
}
