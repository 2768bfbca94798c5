//! Provider client seam.
//!
//! Action handlers reach real infrastructure only through a `ProviderClient`.
//! `InMemoryProvider` keeps per-resource state in memory and records every
//! call; the binary uses it as a stand-in cloud and tests use it as the
//! call-counting mock.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::ProviderError;

/// One outbound call to the infrastructure provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub operation: String,
    pub target: String,
    pub params: Value,
}

impl ProviderRequest {
    pub fn new(operation: impl Into<String>, target: impl Into<String>, params: Value) -> Self {
        Self {
            operation: operation.into(),
            target: target.into(),
            params,
        }
    }
}

/// Client for the concrete infrastructure API.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn call(&self, request: ProviderRequest) -> Result<Value, ProviderError>;
}

/// A call observed by the in-memory provider.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub request: ProviderRequest,
    pub at: Instant,
}

#[derive(Default)]
struct ProviderState {
    resources: HashMap<String, Value>,
    /// When set, only these targets exist.
    inventory: Option<HashSet<String>>,
    calls: Vec<RecordedCall>,
    /// Injected failures, consumed in order by the first matching operation.
    failures: VecDeque<(String, ProviderError)>,
    latency: HashMap<String, Duration>,
}

/// In-memory infrastructure provider.
///
/// Operations understood:
/// - `exists`: whether the target is part of the inventory.
/// - `describe`: the target's current state object.
/// - `restore`: replace the target's state with `params.state`.
/// - anything else: merge `params` into the target's state.
#[derive(Default)]
pub struct InMemoryProvider {
    state: Mutex<ProviderState>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the set of existing resources to `targets`.
    pub fn with_inventory<I, S>(self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock().inventory = Some(targets.into_iter().map(Into::into).collect());
        self
    }

    /// Seed the state of a resource.
    pub fn add_resource(&self, target: impl Into<String>, state: Value) {
        let target = target.into();
        let mut guard = self.lock();
        if let Some(inventory) = guard.inventory.as_mut() {
            inventory.insert(target.clone());
        }
        guard.resources.insert(target, state);
    }

    /// Current state of a resource, if any has been recorded.
    pub fn resource_state(&self, target: &str) -> Option<Value> {
        self.lock().resources.get(target).cloned()
    }

    /// Fail the next call to `operation` with `error`. Use `"*"` for any operation.
    pub fn fail_next(&self, operation: impl Into<String>, error: ProviderError) {
        self.lock().failures.push_back((operation.into(), error));
    }

    /// Delay every call to `operation` by `latency`.
    pub fn set_latency(&self, operation: impl Into<String>, latency: Duration) {
        self.lock().latency.insert(operation.into(), latency);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Number of recorded calls to `operation`.
    pub fn calls_for(&self, operation: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.request.operation == operation)
            .count()
    }

    /// Largest number of calls that fell inside any window of length `window`.
    pub fn max_calls_in_window(&self, window: Duration) -> usize {
        let mut instants: Vec<Instant> = self.lock().calls.iter().map(|c| c.at).collect();
        instants.sort();
        let mut best = 0;
        let mut start = 0;
        for end in 0..instants.len() {
            while instants[end].duration_since(instants[start]) >= window {
                start += 1;
            }
            best = best.max(end - start + 1);
        }
        best
    }

    /// Highest number of calls observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, request: &ProviderRequest) -> Result<Value, ProviderError> {
        let mut guard = self.lock();

        if let Some(pos) = guard
            .failures
            .iter()
            .position(|(op, _)| op == "*" || *op == request.operation)
        {
            if let Some((_, err)) = guard.failures.remove(pos) {
                return Err(err);
            }
        }

        let exists = guard
            .inventory
            .as_ref()
            .map_or(true, |inv| inv.contains(&request.target));

        match request.operation.as_str() {
            "exists" => Ok(json!(exists)),
            _ if !exists => Err(ProviderError::NotFound(request.target.clone())),
            "describe" => Ok(guard
                .resources
                .get(&request.target)
                .cloned()
                .unwrap_or_else(|| json!({}))),
            "restore" => {
                let restored = request.params.get("state").cloned().unwrap_or(Value::Null);
                guard.resources.insert(request.target.clone(), restored);
                Ok(json!({ "restored": true, "target": request.target }))
            }
            op => {
                let entry = guard
                    .resources
                    .entry(request.target.clone())
                    .or_insert_with(|| json!({}));
                if let (Some(state), Some(params)) = (entry.as_object_mut(), request.params.as_object()) {
                    for (k, v) in params {
                        state.insert(k.clone(), v.clone());
                    }
                }
                Ok(json!({ "operation": op, "target": request.target, "applied": true }))
            }
        }
    }
}

#[async_trait]
impl ProviderClient for InMemoryProvider {
    async fn call(&self, request: ProviderRequest) -> Result<Value, ProviderError> {
        let latency = {
            let mut guard = self.lock();
            guard.calls.push(RecordedCall {
                request: request.clone(),
                at: Instant::now(),
            });
            guard.latency.get(&request.operation).copied()
        };

        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let result = self.apply(&request);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(
            operation = %request.operation,
            target = %request.target,
            ok = result.is_ok(),
            "Provider call"
        );
        result
    }
}
