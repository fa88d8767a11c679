//! Bounded polling with a fixed delay schedule.
//!
//! Device-side state (provisioning, HSM init, a service being OOM-killed)
//! settles on its own clock. Checks poll it with a `RetrySchedule` instead
//! of hand-written sleep loops.

use crate::error::{HarnessError, Result};
use serde::Deserialize;
use std::time::Duration;

/// When the delay runs relative to each check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PollMode {
    /// Sleep, then check. Attempt `k` happens after the k-th delay.
    SleepFirst,
    /// Check, then sleep before the next check. No sleep after the last.
    CheckFirst,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    pub delays: Vec<Duration>,
    pub mode: PollMode,
}

impl RetrySchedule {
    pub fn sleep_first(secs: &[u64]) -> Self {
        Self {
            delays: secs.iter().copied().map(Duration::from_secs).collect(),
            mode: PollMode::SleepFirst,
        }
    }

    pub fn check_first(secs: &[u64]) -> Self {
        Self {
            delays: secs.iter().copied().map(Duration::from_secs).collect(),
            mode: PollMode::CheckFirst,
        }
    }
}

/// What a single probe saw.
#[derive(Debug)]
pub enum Check<T> {
    Ready(T),
    NotYet(T),
}

/// Result of polling a schedule to the end or to the first ready probe.
#[derive(Debug)]
pub enum Polled<T> {
    /// Ready on attempt `attempt` (1-based).
    Ready { value: T, attempt: usize },
    /// Every attempt came back not ready. `last` is the final observation,
    /// `last_error` the final transient error if the last probe failed.
    Exhausted {
        last: Option<T>,
        last_error: Option<HarnessError>,
    },
}

impl<T> Polled<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Polled::Ready { .. })
    }
}

/// Run `probe` on `schedule`, sleeping with `sleep`.
///
/// Transient errors (device unreachable) count as "not yet". Any other
/// error aborts the poll immediately.
pub fn poll<T, S, P>(schedule: &RetrySchedule, mut sleep: S, mut probe: P) -> Result<Polled<T>>
where
    S: FnMut(Duration),
    P: FnMut(usize) -> Result<Check<T>>,
{
    let mut last = None;
    let mut last_error = None;
    let attempts = schedule.delays.len();

    for (i, delay) in schedule.delays.iter().enumerate() {
        if schedule.mode == PollMode::SleepFirst {
            sleep(*delay);
        }

        let attempt = i + 1;
        match probe(attempt) {
            Ok(Check::Ready(value)) => return Ok(Polled::Ready { value, attempt }),
            Ok(Check::NotYet(value)) => {
                last = Some(value);
                last_error = None;
            }
            Err(e) if e.is_transient() => last_error = Some(e),
            Err(e) => return Err(e),
        }

        if schedule.mode == PollMode::CheckFirst && attempt < attempts {
            sleep(*delay);
        }
    }

    Ok(Polled::Exhausted { last, last_error })
}
