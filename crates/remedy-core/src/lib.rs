pub mod config;
pub mod error;
pub mod logging;

pub use config::{AuditConfig, EngineConfig, GeneralConfig, RemedyConfig};
pub use error::{RemedyError, Result};
