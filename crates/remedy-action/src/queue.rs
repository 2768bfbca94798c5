//! Priority queue of actions awaiting a worker.
//!
//! Higher priority pops first; within one priority, earlier enqueue pops first.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use uuid::Uuid;

use crate::types::RemediationAction;

/// A queued action and its enqueue sequence number.
#[derive(Debug, Clone)]
pub struct QueuedAction {
    pub action: RemediationAction,
    pub seq: u64,
}

impl QueuedAction {
    fn rank(&self) -> (crate::types::Priority, Reverse<u64>) {
        (self.action.priority, Reverse(self.seq))
    }
}

impl PartialEq for QueuedAction {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedAction {}

impl PartialOrd for QueuedAction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedAction {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

#[derive(Default)]
pub struct ActionQueue {
    heap: BinaryHeap<QueuedAction>,
    next_seq: u64,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an action. Returns its sequence number.
    pub fn push(&mut self, action: RemediationAction) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedAction { action, seq });
        seq
    }

    /// Put back an item taken earlier, keeping its original position.
    pub fn requeue(&mut self, item: QueuedAction) {
        self.heap.push(item);
    }

    pub fn pop(&mut self) -> Option<QueuedAction> {
        self.heap.pop()
    }

    /// Remove one action by id.
    pub fn remove(&mut self, action_id: Uuid) -> Option<QueuedAction> {
        let mut removed = None;
        let items = std::mem::take(&mut self.heap).into_vec();
        let mut kept = Vec::with_capacity(items.len());
        for item in items {
            if removed.is_none() && item.action.id == action_id {
                removed = Some(item);
            } else {
                kept.push(item);
            }
        }
        self.heap = BinaryHeap::from(kept);
        removed
    }

    /// Take up to `limit` items matching `pred`, in pop order.
    pub fn take_matching<F>(&mut self, limit: usize, mut pred: F) -> Vec<QueuedAction>
    where
        F: FnMut(&QueuedAction) -> bool,
    {
        if limit == 0 {
            return Vec::new();
        }
        let mut taken = Vec::new();
        let mut kept = Vec::new();
        while let Some(item) = self.heap.pop() {
            if taken.len() < limit && pred(&item) {
                taken.push(item);
            } else {
                kept.push(item);
            }
        }
        self.heap = BinaryHeap::from(kept);
        taken
    }

    /// Remove everything, in pop order.
    pub fn drain(&mut self) -> Vec<QueuedAction> {
        std::mem::take(&mut self.heap).into_sorted_vec().into_iter().rev().collect()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
