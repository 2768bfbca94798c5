//! Core types and value objects for the remediation engine.
//!
//! Defines action definitions, concrete actions, results, approvals, and
//! the inbound submission document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Scheduling priority of a submitted action. Ordered `Low < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "LOW"),
            Priority::Medium => write!(f, "MEDIUM"),
            Priority::High => write!(f, "HIGH"),
            Priority::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(Priority::Low),
            "MEDIUM" => Ok(Priority::Medium),
            "HIGH" => Ok(Priority::High),
            "CRITICAL" => Ok(Priority::Critical),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// Risk classification of an action type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskTier::Low => write!(f, "LOW"),
            RiskTier::Medium => write!(f, "MEDIUM"),
            RiskTier::High => write!(f, "HIGH"),
            RiskTier::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Broad family an action type belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    Network,
    Compute,
    Identity,
    Storage,
    Notification,
}

/// Lifecycle states of a remediation action.
///
/// `submitted -> validated -> (awaiting_approval ->) queued -> executing ->
/// {completed | failed | rolled_back | rolled_back_failed}`, with `expired`
/// and `rejected` reachable from `awaiting_approval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Submitted,
    Validated,
    AwaitingApproval,
    Queued,
    Executing,
    Completed,
    Failed,
    RolledBack,
    RolledBackFailed,
    Expired,
    Rejected,
}

impl ActionStatus {
    /// Whether no further transition can leave this state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Completed
                | ActionStatus::Failed
                | ActionStatus::RolledBack
                | ActionStatus::RolledBackFailed
                | ActionStatus::Expired
                | ActionStatus::Rejected
        )
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionStatus::Submitted => "submitted",
            ActionStatus::Validated => "validated",
            ActionStatus::AwaitingApproval => "awaiting_approval",
            ActionStatus::Queued => "queued",
            ActionStatus::Executing => "executing",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
            ActionStatus::RolledBack => "rolled_back",
            ActionStatus::RolledBackFailed => "rolled_back_failed",
            ActionStatus::Expired => "expired",
            ActionStatus::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ActionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(ActionStatus::Submitted),
            "validated" => Ok(ActionStatus::Validated),
            "awaiting_approval" => Ok(ActionStatus::AwaitingApproval),
            "queued" => Ok(ActionStatus::Queued),
            "executing" => Ok(ActionStatus::Executing),
            "completed" => Ok(ActionStatus::Completed),
            "failed" => Ok(ActionStatus::Failed),
            "rolled_back" => Ok(ActionStatus::RolledBack),
            "rolled_back_failed" => Ok(ActionStatus::RolledBackFailed),
            "expired" => Ok(ActionStatus::Expired),
            "rejected" => Ok(ActionStatus::Rejected),
            _ => Err(format!("Unknown action status: {}", s)),
        }
    }
}

/// Coarse authorization level attached to a caller. Informational: the
/// authorization gate decides on the permission set alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationLevel {
    ReadOnly,
    #[default]
    Operator,
    Admin,
}

// =============================================================================
// Action definitions and requests
// =============================================================================

/// Static metadata for an action type. Immutable once registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub action_type: String,
    pub category: ActionCategory,
    pub risk_tier: RiskTier,
    pub required_params: Vec<String>,
    pub required_permissions: BTreeSet<String>,
    pub reversible: bool,
    pub requires_approval: bool,
    pub batchable: bool,
}

impl ActionDefinition {
    /// Create a definition with no parameters, no permissions, and every flag off.
    pub fn new(action_type: impl Into<String>, category: ActionCategory, risk_tier: RiskTier) -> Self {
        Self {
            action_type: action_type.into(),
            category,
            risk_tier,
            required_params: Vec::new(),
            required_permissions: BTreeSet::new(),
            reversible: false,
            requires_approval: false,
            batchable: false,
        }
    }

    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    pub fn reversible(mut self) -> Self {
        self.reversible = true;
        self
    }

    pub fn requiring_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn batchable(mut self) -> Self {
        self.batchable = true;
        self
    }
}

/// Action-specific parameters. Sorted so fingerprints are stable.
pub type ActionParams = BTreeMap<String, serde_json::Value>;

/// One concrete request to perform an action against a target resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationAction {
    pub id: Uuid,
    pub action_type: String,
    pub description: String,
    pub target_resource: String,
    pub params: ActionParams,
    pub priority: Priority,
    pub incident_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    /// Simulate this action even when the engine runs for real.
    pub dry_run: bool,
}

impl RemediationAction {
    pub fn new(
        action_type: impl Into<String>,
        target_resource: impl Into<String>,
        priority: Priority,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_type: action_type.into(),
            description: String::new(),
            target_resource: target_resource.into(),
            params: ActionParams::new(),
            priority,
            incident_id: None,
            submitted_at: Utc::now(),
            dry_run: false,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_incident(mut self, incident_id: impl Into<String>) -> Self {
        self.incident_id = Some(incident_id.into());
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// String view of a parameter, `None` if absent or not a string.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

/// Caller identity and granted permissions for one submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityContext {
    pub principal: String,
    #[serde(default)]
    pub authorization_level: AuthorizationLevel,
    pub permissions: BTreeSet<String>,
}

impl SecurityContext {
    pub fn new<I, S>(principal: impl Into<String>, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            principal: principal.into(),
            authorization_level: AuthorizationLevel::default(),
            permissions: permissions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}

// =============================================================================
// Results, snapshots, approvals
// =============================================================================

/// Structured error carried by a terminal result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

/// Outcome of attempting a remediation action. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub action_id: Uuid,
    pub status: ActionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub error: Option<ErrorInfo>,
    pub rollback_performed: bool,
    pub dry_run: bool,
    pub attempts: u32,
    pub output: Option<serde_json::Value>,
}

/// Pre-execution state of a target resource, owned by the rollback path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub action_id: Uuid,
    pub payload: serde_json::Value,
    pub captured_at: DateTime<Utc>,
}

/// Resolution state of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    Expired,
}

/// Gate blocking execution of a risk-gated action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub action_id: Uuid,
    pub action_type: String,
    pub target_resource: String,
    pub description: String,
    pub requested_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub decision: ApprovalState,
    pub decider: Option<String>,
}

/// An external approver's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

/// Inbound decision event on the approval channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub action_id: Uuid,
    pub decision: Decision,
    pub decider: String,
}

// =============================================================================
// Inbound submission document
// =============================================================================

/// One proposed action inside an inbound submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action_type: String,
    #[serde(default)]
    pub description: String,
    pub target_resource: String,
    pub priority: Priority,
    #[serde(default)]
    pub params: ActionParams,
    #[serde(default)]
    pub dry_run: bool,
}

/// A vetted batch of proposed actions for one incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSubmission {
    pub incident_id: String,
    pub actions: Vec<ActionRequest>,
    pub security_context: SecurityContext,
}

impl ActionSubmission {
    /// Expand the submission into concrete actions carrying the incident id.
    pub fn into_actions(self) -> (Vec<RemediationAction>, SecurityContext) {
        let incident_id = self.incident_id;
        let actions = self
            .actions
            .into_iter()
            .map(|req| RemediationAction {
                id: Uuid::new_v4(),
                action_type: req.action_type,
                description: req.description,
                target_resource: req.target_resource,
                params: req.params,
                priority: req.priority,
                incident_id: Some(incident_id.clone()),
                submitted_at: Utc::now(),
                dry_run: req.dry_run,
            })
            .collect();
        (actions, self.security_context)
    }
}

// =============================================================================
// Tests
// =============================================================================
