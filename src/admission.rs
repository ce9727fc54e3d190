//! Per-caller admission control.
//!
//! Each caller key (normally the client IP) may start `limit` requests per
//! window. The window opens with the caller's first request and resets once
//! it has fully elapsed. A request over the limit is rejected outright with
//! the time until reset; nothing is queued or retried. Because the window
//! is fixed rather than rolling, a caller can get up to `2 * limit` requests
//! through in a short span straddling a reset.
//!
//! The counters live in an owned [`AdmissionController`] rather than a
//! global so that every server (and every test) gets its own state. Each
//! check is a single read-modify-write under the `DashMap` entry lock.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy)]
struct Window {
    opened: Instant,
    count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admitted {
    pub remaining: u32,
    pub reset_after: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rate limit of {limit} requests per {window_secs}s exceeded; retry in {}s", .retry_after.as_secs().max(1))]
pub struct AdmissionRejected {
    pub limit: u32,
    pub window_secs: u64,
    pub retry_after: Duration,
    pub reset_at: DateTime<Utc>,
}

impl AdmissionRejected {
    /// Whole seconds for a `Retry-After` header, never zero.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after.as_secs_f64().ceil().max(1.0) as u64
    }
}

pub struct AdmissionController {
    limit: u32,
    window: Duration,
    windows: DashMap<String, Window>,
}

impl AdmissionController {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: DashMap::new(),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn check(&self, key: &str) -> Result<Admitted, AdmissionRejected> {
        self.check_at(key, Instant::now())
    }

    /// Admission decision for `key` at time `now`.
    pub fn check_at(&self, key: &str, now: Instant) -> Result<Admitted, AdmissionRejected> {
        let mut window = self.windows.entry(key.to_string()).or_insert(Window {
            opened: now,
            count: 0,
        });

        if now.saturating_duration_since(window.opened) >= self.window {
            *window = Window {
                opened: now,
                count: 0,
            };
        }

        let reset_after = self
            .window
            .saturating_sub(now.saturating_duration_since(window.opened));

        if window.count >= self.limit {
            let reset_at = Utc::now()
                + chrono::Duration::from_std(reset_after).unwrap_or_else(|_| chrono::Duration::zero());
            return Err(AdmissionRejected {
                limit: self.limit,
                window_secs: self.window.as_secs(),
                retry_after: reset_after,
                reset_at,
            });
        }

        window.count += 1;
        Ok(Admitted {
            remaining: self.limit - window.count,
            reset_after,
        })
    }

    /// Forget callers whose window has elapsed.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.opened) < self.window);
        before.saturating_sub(self.windows.len())
    }

    pub fn tracked_callers(&self) -> usize {
        self.windows.len()
    }
}
