//! Token-bucket limiter for outbound provider calls.
//!
//! Each token returns to the bucket exactly one window after it was spent,
//! so no window of that length ever sees more than `capacity` calls.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

const MINUTE: Duration = Duration::from_secs(60);

pub struct RateLimiter {
    capacity: u32,
    window: Duration,
    /// When each outstanding token was spent, oldest first.
    spent: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Limiter allowing `max_per_minute` calls in any 60 second window.
    pub fn per_minute(max_per_minute: u32) -> Self {
        Self::new(max_per_minute, MINUTE)
    }

    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            window,
            spent: Mutex::new(VecDeque::with_capacity(capacity as usize)),
        }
    }

    /// Take a token if one is available. Returns `true` if allowed.
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut spent = self.lock();
        self.refill(&mut spent, now);
        if (spent.len() as u32) < self.capacity {
            spent.push_back(now);
            true
        } else {
            false
        }
    }

    /// Wait until a token is available, then take it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let now = Instant::now();
                let mut spent = self.lock();
                self.refill(&mut spent, now);
                if (spent.len() as u32) < self.capacity {
                    spent.push_back(now);
                    return;
                }
                match spent.front() {
                    Some(oldest) => (*oldest + self.window).saturating_duration_since(now),
                    // Zero capacity never refills.
                    None => self.window,
                }
            };
            tracing::debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Tokens available right now.
    pub fn remaining(&self) -> u32 {
        let mut spent = self.lock();
        self.refill(&mut spent, Instant::now());
        self.capacity.saturating_sub(spent.len() as u32)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn refill(&self, spent: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = spent.front() {
            if now.duration_since(*oldest) >= self.window {
                spent.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Instant>> {
        self.spent.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
