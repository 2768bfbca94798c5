//! Action registry.
//!
//! Maps an action type name to its immutable definition and a factory that
//! produces its handler. Populated at startup, then shared read-only.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::ActionError;
use crate::handler::{
    BlockIpAddressHandler, DisableUserAccountHandler, RemediationHandler,
    RotateCredentialsHandler, StopInstanceHandler,
};
use crate::provider::ProviderClient;
use crate::types::{ActionDefinition, RemediationAction, SecurityContext};

/// Produces a handler instance for one execution.
pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn RemediationHandler> + Send + Sync>;

struct RegisteredAction {
    definition: Arc<ActionDefinition>,
    factory: HandlerFactory,
}

/// Registry of action definitions and their handler factories.
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, RegisteredAction>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition with its handler factory.
    ///
    /// Fails if the type name is already taken.
    pub fn register(
        &mut self,
        definition: ActionDefinition,
        factory: HandlerFactory,
    ) -> Result<(), ActionError> {
        if self.actions.contains_key(&definition.action_type) {
            return Err(ActionError::DuplicateType(definition.action_type));
        }
        tracing::debug!(action_type = %definition.action_type, "Registered action type");
        self.actions.insert(
            definition.action_type.clone(),
            RegisteredAction {
                definition: Arc::new(definition),
                factory,
            },
        );
        Ok(())
    }

    /// Register a definition served by one shared handler instance.
    pub fn register_handler(
        &mut self,
        definition: ActionDefinition,
        handler: Arc<dyn RemediationHandler>,
    ) -> Result<(), ActionError> {
        self.register(definition, Arc::new(move || Arc::clone(&handler)))
    }

    /// Register the built-in handlers against `provider`.
    pub fn register_defaults(&mut self, provider: Arc<dyn ProviderClient>) -> Result<(), ActionError> {
        let p = Arc::clone(&provider);
        self.register(
            BlockIpAddressHandler::definition(),
            Arc::new(move || Arc::new(BlockIpAddressHandler::new(Arc::clone(&p))) as Arc<dyn RemediationHandler>),
        )?;
        let p = Arc::clone(&provider);
        self.register(
            StopInstanceHandler::definition(),
            Arc::new(move || Arc::new(StopInstanceHandler::new(Arc::clone(&p))) as Arc<dyn RemediationHandler>),
        )?;
        let p = Arc::clone(&provider);
        self.register(
            DisableUserAccountHandler::definition(),
            Arc::new(move || Arc::new(DisableUserAccountHandler::new(Arc::clone(&p))) as Arc<dyn RemediationHandler>),
        )?;
        let p = provider;
        self.register(
            RotateCredentialsHandler::definition(),
            Arc::new(move || Arc::new(RotateCredentialsHandler::new(Arc::clone(&p))) as Arc<dyn RemediationHandler>),
        )?;
        Ok(())
    }

    pub fn lookup(&self, action_type: &str) -> Result<Arc<ActionDefinition>, ActionError> {
        self.actions
            .get(action_type)
            .map(|r| Arc::clone(&r.definition))
            .ok_or_else(|| ActionError::UnknownActionType(action_type.to_string()))
    }

    /// Instantiate the handler for `action_type`.
    pub fn handler(&self, action_type: &str) -> Result<Arc<dyn RemediationHandler>, ActionError> {
        self.actions
            .get(action_type)
            .map(|r| (r.factory)())
            .ok_or_else(|| ActionError::UnknownActionType(action_type.to_string()))
    }

    /// Check required parameters and permissions, then the handler's own rules.
    pub fn validate(
        &self,
        action: &RemediationAction,
        context: &SecurityContext,
    ) -> Result<Arc<dyn RemediationHandler>, ActionError> {
        let definition = self.lookup(&action.action_type)?;
        for param in &definition.required_params {
            match action.params.get(param) {
                Some(value) if !is_blank(value) => {}
                _ => return Err(ActionError::MissingParameter(param.clone())),
            }
        }
        if let Some(missing) = definition
            .required_permissions
            .iter()
            .find(|p| !context.has_permission(p))
        {
            return Err(ActionError::InsufficientPermission(missing.clone()));
        }
        let handler = self.handler(&action.action_type)?;
        handler.validate(action)?;
        Ok(handler)
    }

    /// Registered type names, sorted.
    pub fn action_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
