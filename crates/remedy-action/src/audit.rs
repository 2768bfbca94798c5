//! Append-only audit trail.
//!
//! Every authorization decision, state transition, rollback attempt and
//! idempotent cache hit produces one `AuditRecord`. Sinks are synchronous and
//! a failed append fails the operation that produced it.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::runtime::{Handle, RuntimeFlavor};
use uuid::Uuid;

use crate::error::AuditError;
use crate::types::{ActionStatus, RemediationAction};

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    Authorization,
    Transition {
        from: Option<ActionStatus>,
        to: ActionStatus,
    },
    RollbackAttempt,
    CacheHit {
        original_action_id: Uuid,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Allowed,
    Denied,
    Success,
    Failure,
}

/// How urgently a human should look at the record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    #[default]
    Normal,
    High,
    Critical,
}

/// One immutable audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action_id: Option<Uuid>,
    pub action_type: Option<String>,
    pub target_resource: Option<String>,
    pub incident_id: Option<String>,
    pub event: AuditEvent,
    pub outcome: AuditOutcome,
    #[serde(default)]
    pub urgency: Urgency,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl AuditRecord {
    pub fn new(actor: impl Into<String>, event: AuditEvent, outcome: AuditOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            actor: actor.into(),
            action_id: None,
            action_type: None,
            target_resource: None,
            incident_id: None,
            event,
            outcome,
            urgency: Urgency::Normal,
            detail: String::new(),
        }
    }

    /// Attach the identifying fields of `action`.
    pub fn for_action(mut self, action: &RemediationAction) -> Self {
        self.action_id = Some(action.id);
        self.action_type = Some(action.action_type.clone());
        self.target_resource = Some(action.target_resource.clone());
        self.incident_id = action.incident_id.clone();
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }
}

/// Destination for audit records.
pub trait AuditSink: Send + Sync {
    fn append(&self, record: AuditRecord) -> Result<(), AuditError>;
}

/// Keeps records in memory. Can be switched off to exercise fail-closed paths.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
    unavailable: AtomicBool,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent append fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records about one action, in append order.
    pub fn for_action(&self, action_id: Uuid) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.action_id == Some(action_id))
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, record: AuditRecord) -> Result<(), AuditError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AuditError::Unavailable("memory sink disabled".to_string()));
        }
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonlAuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditSink {
    /// Open `path` for appending, creating it and its parent directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::info!(path = %path.display(), "Audit log opened");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn append(&self, record: AuditRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let write = || -> Result<(), AuditError> {
            let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
            file.write_all(line.as_bytes())?;
            file.flush()?;
            Ok(())
        };
        // Appends are called from async tasks. On a multi-threaded runtime
        // hand this worker's other tasks off while the write blocks;
        // `block_in_place` is unavailable on a current-thread runtime.
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(write)
            }
            _ => write(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;

    #[test]
    fn test_record_for_action() {
        let action = RemediationAction::new("stop_instance", "i-1", Priority::High)
            .with_incident("INC-7");
        let record = AuditRecord::new(
            "analyzer",
            AuditEvent::Transition {
                from: Some(ActionStatus::Queued),
                to: ActionStatus::Executing,
            },
            AuditOutcome::Success,
        )
        .for_action(&action);
        assert_eq!(record.action_id, Some(action.id));
        assert_eq!(record.incident_id.as_deref(), Some("INC-7"));
        assert_eq!(record.urgency, Urgency::Normal);
    }

    #[test]
    fn test_event_wire_format() {
        let event = AuditEvent::Transition {
            from: None,
            to: ActionStatus::Submitted,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "transition");
        assert_eq!(value["to"], "submitted");
        assert!(value["from"].is_null());
    }

    #[test]
    fn test_memory_sink_fail_closed_switch() {
        let sink = MemoryAuditSink::new();
        let record = AuditRecord::new("a", AuditEvent::Authorization, AuditOutcome::Allowed);
        sink.append(record.clone()).unwrap();
        sink.set_unavailable(true);
        assert!(matches!(sink.append(record.clone()), Err(AuditError::Unavailable(_))));
        sink.set_unavailable(false);
        sink.append(record).unwrap();
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("trail.jsonl");
        let sink = JsonlAuditSink::open(&path).unwrap();

        sink.append(AuditRecord::new("a", AuditEvent::Authorization, AuditOutcome::Denied))
            .unwrap();
        sink.append(
            AuditRecord::new("a", AuditEvent::RollbackAttempt, AuditOutcome::Failure)
                .with_urgency(Urgency::Critical),
        )
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: AuditRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.event, AuditEvent::RollbackAttempt);
        assert_eq!(second.urgency, Urgency::Critical);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_jsonl_sink_from_concurrent_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trail.jsonl");
        let sink = std::sync::Arc::new(JsonlAuditSink::open(&path).unwrap());

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let sink = std::sync::Arc::clone(&sink);
                tokio::spawn(async move {
                    for _ in 0..25 {
                        sink.append(AuditRecord::new(
                            format!("worker-{i}"),
                            AuditEvent::Authorization,
                            AuditOutcome::Allowed,
                        ))
                        .unwrap();
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 200);
        for line in content.lines() {
            let record: AuditRecord = serde_json::from_str(line).unwrap();
            assert!(record.actor.starts_with("worker-"));
        }
    }

    #[test]
    fn test_jsonl_sink_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trail.jsonl");
        JsonlAuditSink::open(&path)
            .unwrap()
            .append(AuditRecord::new("a", AuditEvent::Authorization, AuditOutcome::Allowed))
            .unwrap();
        JsonlAuditSink::open(&path)
            .unwrap()
            .append(AuditRecord::new("b", AuditEvent::Authorization, AuditOutcome::Allowed))
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
    }
}
