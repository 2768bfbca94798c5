//! Remediation handler trait and the built-in handlers.
//!
//! A handler turns one action type into provider calls: existence checks,
//! state capture, the mutating call itself, and its inverse. The engine owns
//! sequencing, locking, retries and rate limiting; handlers only talk to the
//! provider.

pub mod block_ip;
pub mod disable_user;
pub mod rotate_credentials;
pub mod stop_instance;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ActionError, ProviderError};
use crate::provider::{ProviderClient, ProviderRequest};
use crate::types::{RemediationAction, StateSnapshot};

pub use block_ip::BlockIpAddressHandler;
pub use disable_user::DisableUserAccountHandler;
pub use rotate_credentials::RotateCredentialsHandler;
pub use stop_instance::StopInstanceHandler;

/// What a successful execute (or simulate) produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutput {
    pub message: String,
    pub data: Value,
}

/// Async trait implemented by every remediation action type.
#[async_trait]
pub trait RemediationHandler: Send + Sync {
    /// Human-readable description of what the action will do.
    fn describe(&self, action: &RemediationAction) -> String;

    /// Type-specific parameter checks beyond presence.
    fn validate(&self, _action: &RemediationAction) -> Result<(), ActionError> {
        Ok(())
    }

    /// Whether the target still exists at the provider.
    async fn resource_exists(&self, action: &RemediationAction) -> Result<bool, ProviderError>;

    /// Record whatever `rollback` needs to restore the target.
    async fn capture_state(&self, action: &RemediationAction) -> Result<Value, ProviderError>;

    /// Perform the mutating provider call.
    async fn execute(&self, action: &RemediationAction) -> Result<ActionOutput, ProviderError>;

    /// Restore the target from `snapshot`.
    async fn rollback(
        &self,
        action: &RemediationAction,
        snapshot: &StateSnapshot,
    ) -> Result<(), ProviderError>;

    /// Dry-run replacement for `execute`. Must not reach the provider, and
    /// should fail wherever `execute` fails without calling it.
    async fn simulate(&self, action: &RemediationAction) -> Result<ActionOutput, ProviderError> {
        Ok(ActionOutput {
            message: format!("[dry-run] {}", self.describe(action)),
            data: json!({ "simulated": true, "target": action.target_resource }),
        })
    }

    /// Key under which queued actions of this type may share one provider call.
    fn batch_key(&self, _action: &RemediationAction) -> Option<String> {
        None
    }

    /// Execute several same-key actions in one provider call.
    async fn execute_batch(
        &self,
        _actions: &[RemediationAction],
    ) -> Result<ActionOutput, ProviderError> {
        Err(ProviderError::Permanent(
            "batch execution not supported".to_string(),
        ))
    }
}

// Provider round-trips shared by the built-in handlers.

pub(crate) async fn target_exists(
    provider: &dyn ProviderClient,
    target: &str,
) -> Result<bool, ProviderError> {
    let value = provider
        .call(ProviderRequest::new("exists", target, Value::Null))
        .await?;
    Ok(value.as_bool().unwrap_or(false))
}

pub(crate) async fn describe_target(
    provider: &dyn ProviderClient,
    target: &str,
) -> Result<Value, ProviderError> {
    provider
        .call(ProviderRequest::new("describe", target, Value::Null))
        .await
}

pub(crate) async fn restore_target(
    provider: &dyn ProviderClient,
    target: &str,
    snapshot: &StateSnapshot,
) -> Result<(), ProviderError> {
    provider
        .call(ProviderRequest::new(
            "restore",
            target,
            json!({ "state": snapshot.payload }),
        ))
        .await
        .map(|_| ())
}

/// Dry-run reply for a mutating call, shaped like the provider's reply to
/// the real one.
pub(crate) fn simulated_output(operation: &str, target: &str, message: String) -> ActionOutput {
    ActionOutput {
        message: format!("[dry-run] {message}"),
        data: json!({
            "operation": operation,
            "target": target,
            "applied": false,
            "simulated": true,
        }),
    }
}

/// Fetch a required string parameter, rejecting blanks.
pub(crate) fn required_str<'a>(
    action: &'a RemediationAction,
    key: &str,
) -> Result<&'a str, ActionError> {
    match action.param_str(key).map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value),
        Some(_) | None => Err(ActionError::MissingParameter(key.to_string())),
    }
}
