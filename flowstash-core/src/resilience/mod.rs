// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Resilience primitives for the write path: retry policy, flush modes and
//! the lifecycle states a pending unit moves through under backpressure.

use crate::error::{FlowstashError, Result};
use rand::random;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(25),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let jitter_factor = 1.0 + (random::<f64>() - 0.5) * 2.0 * self.jitter;
        let jittered = base * jitter_factor;
        let clamped = jittered.min(self.max_delay.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(clamped)
    }

    /// Run `operation` on the current thread, sleeping between attempts while
    /// the failure is transient. Only the writer thread calls this; it must
    /// never run on an async worker.
    ///
    /// `on_retry` is invoked once per retried attempt.
    pub fn run_blocking<T, F, R>(&self, mut operation: F, mut on_retry: R) -> Result<T>
    where
        F: FnMut() -> Result<T>,
        R: FnMut(u32, &FlowstashError),
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    on_retry(attempt, &e);
                    std::thread::sleep(self.delay_for_attempt(attempt));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// How a flush treats storage contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Errors propagate to the caller. Pending data is kept.
    Strict,
    /// Busy/locked errors are absorbed and the data is retried on the next tick.
    BestEffort,
}

impl FlushMode {
    pub fn is_best_effort(self) -> bool {
        matches!(self, FlushMode::BestEffort)
    }
}

/// Where a pending unit of work ended up.
///
/// `Submitted -> {Queued | Deferred | FallbackDirect} -> Applied | Retried | DroppedWithLog`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingState {
    Submitted,
    Queued,
    Deferred,
    FallbackDirect,
    Applied,
    Retried,
    DroppedWithLog,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;

    fn busy() -> FlowstashError {
        FlowstashError::Storage(rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        ))
    }

    #[test]
    fn test_delay_grows_and_clamps() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential()
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(25));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(1));
    }

    #[test]
    fn test_run_blocking_retries_transient_only() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            ..RetryPolicy::exponential()
        };

        let mut calls = 0;
        let mut retries = 0;
        let out = policy.run_blocking(
            || {
                calls += 1;
                if calls < 3 {
                    Err(busy())
                } else {
                    Ok(calls)
                }
            },
            |_, _| retries += 1,
        );
        assert_eq!(out.unwrap(), 3);
        assert_eq!(retries, 2);

        let mut calls = 0;
        let out: Result<()> = policy.run_blocking(
            || {
                calls += 1;
                Err(FlowstashError::SchemaMismatch("no columns".into()))
            },
            |_, _| {},
        );
        assert!(out.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_run_blocking_gives_up() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            ..RetryPolicy::exponential()
        };
        let mut calls = 0;
        let out: Result<()> = policy.run_blocking(
            || {
                calls += 1;
                Err(busy())
            },
            |_, _| {},
        );
        assert!(out.unwrap_err().is_transient());
        assert_eq!(calls, 3);
    }
}
