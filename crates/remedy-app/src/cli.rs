//! CLI argument definitions for the remedy binary.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::Parser;
use std::path::PathBuf;

/// Remedy: executes vetted remediation actions against cloud infrastructure.
#[derive(Parser, Debug)]
#[command(name = "remedy", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Submission document (JSON). Reads stdin when omitted.
    #[arg(short = 's', long = "submission")]
    pub submission: Option<PathBuf>,

    /// Simulate every action instead of calling the provider.
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Append audit records to this JSON-lines file.
    #[arg(short = 'a', long = "audit-log")]
    pub audit_log: Option<PathBuf>,

    /// Approve every approval request as it is raised.
    #[arg(long = "auto-approve")]
    pub auto_approve: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long = "json-logs")]
    pub json_logs: bool,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > REMEDY_CONFIG env var > platform default (~/.remedy/config.toml).
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("REMEDY_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the log level.
    ///
    /// Priority: --log-level flag > config file value.
    pub fn resolve_log_level(&self, config_level: &str) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| config_level.to_string())
    }

    /// Dry-run is on if either the flag or the config file asks for it.
    pub fn resolve_dry_run(&self, config_dry_run: bool) -> bool {
        self.dry_run || config_dry_run
    }

    /// Resolve the audit log path.
    ///
    /// Priority: --audit-log flag > config file value. `None` keeps audit
    /// records in memory.
    pub fn resolve_audit_path(&self, config_path: Option<&str>) -> Option<PathBuf> {
        self.audit_log
            .clone()
            .or_else(|| config_path.map(PathBuf::from))
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".remedy").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".remedy").join("config.toml");
    }
    PathBuf::from("config.toml")
}
