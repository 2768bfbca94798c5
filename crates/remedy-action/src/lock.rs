//! Per-resource reservations.
//!
//! A target is reserved for one action from admission until its terminal
//! result is written, so at most one action is queued, awaiting approval or
//! executing against it at any time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::error::ActionError;

type Holders = Arc<Mutex<HashMap<String, Uuid>>>;

#[derive(Default, Clone)]
pub struct ResourceLocks {
    held: Holders,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `target` for `action_id`, failing fast if another action
    /// holds it. Reserving again for the same action is a no-op.
    pub fn reserve(&self, target: &str, action_id: Uuid) -> Result<(), ActionError> {
        let mut held = lock(&self.held);
        match held.get(target) {
            Some(holder) if *holder != action_id => {
                Err(ActionError::ResourceConflict(target.to_string()))
            }
            Some(_) => Ok(()),
            None => {
                held.insert(target.to_string(), action_id);
                Ok(())
            }
        }
    }

    /// Confirm `action_id` still holds `target`.
    pub fn ensure_held(&self, target: &str, action_id: Uuid) -> Result<(), ActionError> {
        match self.holder(target) {
            Some(holder) if holder == action_id => Ok(()),
            _ => Err(ActionError::ResourceConflict(target.to_string())),
        }
    }

    /// Drop the reservation on `target` if `action_id` holds it.
    /// Returns whether anything was released.
    pub fn release(&self, target: &str, action_id: Uuid) -> bool {
        let mut held = lock(&self.held);
        if held.get(target) == Some(&action_id) {
            held.remove(target);
            true
        } else {
            false
        }
    }

    pub fn holder(&self, target: &str) -> Option<Uuid> {
        lock(&self.held).get(target).copied()
    }

    pub fn is_locked(&self, target: &str) -> bool {
        lock(&self.held).contains_key(target)
    }

    pub fn held_count(&self) -> usize {
        lock(&self.held).len()
    }
}

fn lock(held: &Holders) -> MutexGuard<'_, HashMap<String, Uuid>> {
    held.lock().unwrap_or_else(PoisonError::into_inner)
}
