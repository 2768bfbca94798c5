use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{RemedyError, Result};

/// Top-level configuration for the remediation service.
///
/// Loaded from `~/.remedy/config.toml` by default. Each section corresponds
/// to a bounded context or cross-cutting concern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemedyConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

impl RemedyConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RemedyConfig = toml::from_str(&content)?;
        config.engine.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| RemedyError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// General service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
    /// Emit logs as JSON lines instead of human-readable text.
    pub json_logs: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Execution engine configuration.
///
/// The first six fields are the recognized options of the engine's
/// configuration surface; the rest tune retry, batching and health reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Replace every provider side effect with a simulation.
    pub dry_run_mode: bool,
    /// Size of the worker pool; upper bound on simultaneously executing actions.
    pub max_concurrent_actions: usize,
    /// Outbound provider calls allowed in any sliding 60 second window.
    pub max_api_calls_per_minute: u32,
    /// Hard deadline for the execute phase of one action.
    pub action_timeout_seconds: u64,
    /// How long an approval request stays open before it expires.
    pub approval_timeout_seconds: u64,
    /// How long a recorded result answers duplicate submissions.
    pub idempotency_ttl_seconds: u64,
    /// Retries granted to transient provider errors before they count as permanent.
    pub max_transient_retries: u32,
    /// First backoff delay; doubles on every retry.
    pub retry_base_delay_ms: u64,
    /// Ceiling for a single backoff delay.
    pub retry_max_delay_ms: u64,
    /// Queued batchable actions submitted within this window of each other may coalesce.
    pub batch_window_ms: u64,
    /// Upper bound on actions coalesced into one provider call.
    pub max_batch_size: usize,
    /// Rolling window for the terminal-status counts in health snapshots.
    pub health_window_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dry_run_mode: false,
            max_concurrent_actions: 4,
            max_api_calls_per_minute: 60,
            action_timeout_seconds: 300,
            approval_timeout_seconds: 300,
            idempotency_ttl_seconds: 60,
            max_transient_retries: 3,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 5_000,
            batch_window_ms: 250,
            max_batch_size: 16,
            health_window_seconds: 300,
        }
    }
}

impl EngineConfig {
    /// Reject values that would leave the engine unable to make progress.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_actions == 0 {
            return Err(RemedyError::InvalidConfig {
                field: "max_concurrent_actions",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_api_calls_per_minute == 0 {
            return Err(RemedyError::InvalidConfig {
                field: "max_api_calls_per_minute",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.action_timeout_seconds == 0 {
            return Err(RemedyError::InvalidConfig {
                field: "action_timeout_seconds",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.approval_timeout_seconds == 0 {
            return Err(RemedyError::InvalidConfig {
                field: "approval_timeout_seconds",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_batch_size == 0 {
            return Err(RemedyError::InvalidConfig {
                field: "max_batch_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Audit sink configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Append-only JSON-lines file receiving every audit record.
    /// When unset the binary keeps audit records in memory only.
    pub path: Option<String>,
}
