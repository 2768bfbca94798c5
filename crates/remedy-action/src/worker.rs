//! Worker pool loop and the execute phase.
//!
//! A worker takes a slot, pops the highest-priority action, opportunistically
//! coalesces batchable neighbours, runs the safety pipeline and the provider
//! call, and writes the terminal result.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::json;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;
use tracing::{debug, warn};

use remedy_core::config::EngineConfig;

use crate::engine::{EngineShared, Outcome};
use crate::error::{ActionError, ProviderError};
use crate::handler::{ActionOutput, RemediationHandler};
use crate::queue::QueuedAction;
use crate::safety;
use crate::types::{ActionStatus, RemediationAction};

/// An action taken off the queue together with the slot it runs in.
pub(crate) struct Member {
    pub(crate) action: RemediationAction,
    pub(crate) permit: OwnedSemaphorePermit,
}

/// Worker loop. Returns on shutdown; an action already taken runs to the end.
pub(crate) async fn run(shared: Arc<EngineShared>, worker_id: usize) {
    let mut shutdown = shared.shutdown.subscribe();
    debug!(worker_id, "Worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shared.wait_for_work() => {}
            _ = shutdown.changed() => break,
        }
        let permit = tokio::select! {
            permit = Arc::clone(&shared.slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };
        let head = shared.queue_lock().pop();
        let Some(head) = head else {
            continue;
        };
        let members = collect_batch(&shared, head, permit);
        execute_group(&shared, members).await;
    }
    debug!(worker_id, "Worker stopped");
}

/// Pull queued actions that may share a provider call with `head`.
///
/// Candidates have the same type, priority, dry-run mode and batch key, and
/// were submitted within the batch window of `head`. Each needs a free slot
/// of its own; those that cannot get one go back to the queue unchanged.
fn collect_batch(shared: &EngineShared, head: QueuedAction, permit: OwnedSemaphorePermit) -> Vec<Member> {
    let mut members = vec![Member {
        action: head.action,
        permit,
    }];
    let first = &members[0].action;

    let batchable = shared
        .registry
        .lookup(&first.action_type)
        .map(|d| d.batchable)
        .unwrap_or(false);
    if !batchable || shared.config.max_batch_size <= 1 {
        return members;
    }
    let Ok(handler) = shared.registry.handler(&first.action_type) else {
        return members;
    };
    let Some(key) = handler.batch_key(first) else {
        return members;
    };

    let window = chrono::Duration::milliseconds(shared.config.batch_window_ms as i64);
    let action_type = first.action_type.clone();
    let priority = first.priority;
    let submitted_at = first.submitted_at;
    let dry_run = shared.is_dry_run(first);

    let candidates = shared
        .queue_lock()
        .take_matching(shared.config.max_batch_size - 1, |q| {
            q.action.action_type == action_type
                && q.action.priority == priority
                && shared.is_dry_run(&q.action) == dry_run
                && (q.action.submitted_at - submitted_at).abs() <= window
                && handler.batch_key(&q.action).as_deref() == Some(key.as_str())
        });

    let mut leftovers = Vec::new();
    for item in candidates {
        match Arc::clone(&shared.slots).try_acquire_owned() {
            Ok(permit) => members.push(Member {
                action: item.action,
                permit,
            }),
            Err(_) => leftovers.push(item),
        }
    }
    if !leftovers.is_empty() {
        let returned = leftovers.len();
        let mut queue = shared.queue_lock();
        for item in leftovers {
            queue.requeue(item);
        }
        drop(queue);
        for _ in 0..returned {
            shared.queue_ready.notify_one();
        }
    }
    if members.len() > 1 {
        debug!(
            action_type = %members[0].action.action_type,
            batch_key = %key,
            size = members.len(),
            "Coalesced batch"
        );
    }
    members
}

async fn execute_group(shared: &EngineShared, members: Vec<Member>) {
    let Some(action_type) = members.first().map(|m| m.action.action_type.clone()) else {
        return;
    };
    let resolved = shared
        .registry
        .lookup(&action_type)
        .and_then(|d| shared.registry.handler(&action_type).map(|h| (d, h)));
    let (definition, handler) = match resolved {
        Ok(found) => found,
        Err(e) => {
            for member in members {
                shared.finish(
                    &member.action,
                    Outcome::failed(ActionStatus::Failed, Utc::now(), &e),
                );
            }
            return;
        }
    };

    // One deadline covers every provider call from the existence check to
    // the last execute attempt.
    let timeout_secs = shared.config.action_timeout_seconds;
    let deadline = Instant::now() + Duration::from_secs(timeout_secs);

    let mut prepared = Vec::with_capacity(members.len());
    for member in members {
        let action = member.action.clone();
        let started_at = Utc::now();
        let checks = safety::prepare(shared, &definition, handler.as_ref(), member, started_at);
        match tokio::time::timeout_at(deadline, checks).await {
            Ok(Some(ready)) => prepared.push(ready),
            Ok(None) => {}
            Err(_) => {
                shared.finish(
                    &action,
                    Outcome::failed(
                        ActionStatus::Failed,
                        started_at,
                        &ActionError::Timeout(timeout_secs),
                    ),
                );
            }
        }
    }
    let Some(first) = prepared.first() else {
        return;
    };

    let dry_run = shared.is_dry_run(&first.action);
    let actions: Vec<RemediationAction> = prepared.iter().map(|p| p.action.clone()).collect();
    let handler_ref: &dyn RemediationHandler = handler.as_ref();
    let batch: &[RemediationAction] = &actions;

    let mut attempts = 0u32;
    let outcome = tokio::time::timeout_at(
        deadline,
        call_with_retry(shared, &mut attempts, move || {
            run_once(handler_ref, batch, dry_run)
        }),
    )
    .await;

    match outcome {
        Ok(Ok(output)) => {
            for ready in prepared {
                let (action, started_at) = ready.release();
                shared.finish(
                    &action,
                    Outcome::completed(started_at, attempts, output.data.clone()),
                );
            }
        }
        Ok(Err(err)) => {
            let err = ActionError::Execution(give_up(err, attempts));
            for ready in prepared {
                safety::fail_after_execute(shared, &definition, handler_ref, ready, &err, attempts)
                    .await;
            }
        }
        Err(_) => {
            let err = ActionError::Timeout(timeout_secs);
            for ready in prepared {
                let (action, started_at) = ready.release();
                shared.finish(
                    &action,
                    Outcome::failed(ActionStatus::Failed, started_at, &err).with_attempts(attempts),
                );
            }
        }
    }
}

/// Call the provider once, through `simulate` in dry-run mode.
async fn run_once(
    handler: &dyn RemediationHandler,
    actions: &[RemediationAction],
    dry_run: bool,
) -> Result<ActionOutput, ProviderError> {
    match actions {
        [single] if dry_run => handler.simulate(single).await,
        [single] => handler.execute(single).await,
        many if dry_run => {
            for action in many {
                handler.simulate(action).await?;
            }
            Ok(ActionOutput {
                message: format!("[dry-run] batch of {}", many.len()),
                data: json!({ "simulated": true, "count": many.len() }),
            })
        }
        many => handler.execute_batch(many).await,
    }
}

/// Retry transient provider errors with backoff. Every attempt takes a
/// rate-limit token first.
async fn call_with_retry<F, Fut>(
    shared: &EngineShared,
    attempts: &mut u32,
    mut call: F,
) -> Result<ActionOutput, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ActionOutput, ProviderError>>,
{
    loop {
        shared.limiter.acquire().await;
        *attempts += 1;
        match call().await {
            Err(err) if err.is_transient() && *attempts <= shared.config.max_transient_retries => {
                let delay = backoff_delay(&shared.config, *attempts);
                warn!(
                    attempt = *attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient provider error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

/// A transient error that outlived its retries counts as permanent.
fn give_up(err: ProviderError, attempts: u32) -> ProviderError {
    match err {
        ProviderError::Transient(msg) => {
            ProviderError::Permanent(format!("gave up after {attempts} attempts: {msg}"))
        }
        other => other,
    }
}

/// Exponential backoff with equal jitter: half the capped delay is fixed,
/// the other half random.
pub(crate) fn backoff_delay(config: &EngineConfig, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    let capped = config
        .retry_base_delay_ms
        .saturating_mul(1u64 << shift)
        .min(config.retry_max_delay_ms);
    let half = capped / 2;
    let jitter = if half == 0 {
        0
    } else {
        rand::rng().random_range(0..=half)
    };
    Duration::from_millis(capped - half + jitter)
}
