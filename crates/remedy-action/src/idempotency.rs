//! Idempotency cache keyed by action fingerprint.
//!
//! A fingerprint covers the action type, the target resource and the sorted
//! parameters. The first submission of a fingerprint claims an in-flight slot;
//! duplicates arriving while it runs subscribe to its result, and duplicates
//! arriving after it finished get the recorded result until the TTL lapses.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::types::{ExecutionResult, RemediationAction};

/// Receives the terminal result of an action once it is written.
pub type ResultReceiver = watch::Receiver<Option<ExecutionResult>>;

/// Stable hex digest identifying what an action does.
pub fn fingerprint(action: &RemediationAction) -> String {
    let mut hasher = Sha256::new();
    hasher.update(action.action_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(action.target_resource.as_bytes());
    hasher.update([0u8]);
    for (key, value) in &action.params {
        hasher.update(key.as_bytes());
        hasher.update([b'=']);
        hasher.update(value.to_string().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

enum Entry {
    InFlight {
        action_id: Uuid,
        receiver: ResultReceiver,
    },
    Done {
        result: ExecutionResult,
        recorded_at: Instant,
    },
}

/// Outcome of claiming a fingerprint.
pub enum Claim {
    /// Nobody holds the fingerprint; the caller now owns it.
    Acquired,
    /// A recorded result is still fresh.
    Hit(ExecutionResult),
    /// An identical action is still running.
    InFlight {
        action_id: Uuid,
        receiver: ResultReceiver,
    },
}

pub struct IdempotencyCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically look up `fingerprint` and claim it if free.
    pub fn claim(&self, fingerprint: &str, action_id: Uuid, receiver: ResultReceiver) -> Claim {
        let mut entries = self.lock();
        match entries.get(fingerprint) {
            Some(Entry::Done {
                result,
                recorded_at,
            }) if recorded_at.elapsed() < self.ttl => return Claim::Hit(result.clone()),
            Some(Entry::InFlight {
                action_id,
                receiver,
            }) => {
                return Claim::InFlight {
                    action_id: *action_id,
                    receiver: receiver.clone(),
                }
            }
            _ => {}
        }
        entries.insert(
            fingerprint.to_string(),
            Entry::InFlight {
                action_id,
                receiver,
            },
        );
        Claim::Acquired
    }

    /// Record the terminal result for a claimed fingerprint.
    pub fn complete(&self, fingerprint: &str, result: ExecutionResult) {
        self.lock().insert(
            fingerprint.to_string(),
            Entry::Done {
                result,
                recorded_at: Instant::now(),
            },
        );
    }

    /// Release a claim that never produced a result (rejected at submission).
    pub fn release(&self, fingerprint: &str, action_id: Uuid) {
        let mut entries = self.lock();
        if matches!(
            entries.get(fingerprint),
            Some(Entry::InFlight { action_id: owner, .. }) if *owner == action_id
        ) {
            entries.remove(fingerprint);
        }
    }

    /// Fresh recorded result for `fingerprint`, if any.
    pub fn get(&self, fingerprint: &str) -> Option<ExecutionResult> {
        match self.lock().get(fingerprint) {
            Some(Entry::Done {
                result,
                recorded_at,
            }) if recorded_at.elapsed() < self.ttl => Some(result.clone()),
            _ => None,
        }
    }

    /// Drop recorded results older than the TTL. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let ttl = self.ttl;
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| match entry {
            Entry::Done { recorded_at, .. } => recorded_at.elapsed() < ttl,
            Entry::InFlight { .. } => true,
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
