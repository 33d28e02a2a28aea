//! Two-phase token batching policy.
//!
//! Upstream generation yields text in tiny fragments. Publishing each one
//! as its own event would flood the event endpoint, so fragments are
//! accumulated in a [`BatchBuffer`] and flushed as one numbered batch when
//! either a time or a count threshold is reached:
//!
//! - the **first** batch uses tight thresholds so the first visible text
//!   appears quickly;
//! - every **steady**-state batch after it uses relaxed thresholds to bound
//!   the total event count on long generations;
//! - at stream end any remainder is flushed unconditionally.
//!
//! The buffer is pure: callers pass the current [`Instant`] to every
//! operation.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

pub const DEFAULT_FIRST_BATCH_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_FIRST_BATCH_MAX_FRAGMENTS: usize = 3;
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_millis(300);
pub const DEFAULT_BATCH_MAX_FRAGMENTS: usize = 20;

/// Flush thresholds for one phase. Whichever is reached first wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseThresholds {
    /// Elapsed time since the previous flush (or stream start).
    pub interval: Duration,
    /// Number of fragments accumulated since the previous flush.
    pub max_fragments: usize,
}

/// Thresholds for the first batch and for every batch after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub first: PhaseThresholds,
    pub steady: PhaseThresholds,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            first: PhaseThresholds {
                interval: DEFAULT_FIRST_BATCH_INTERVAL,
                max_fragments: DEFAULT_FIRST_BATCH_MAX_FRAGMENTS,
            },
            steady: PhaseThresholds {
                interval: DEFAULT_BATCH_INTERVAL,
                max_fragments: DEFAULT_BATCH_MAX_FRAGMENTS,
            },
        }
    }
}

impl BatchPolicy {
    /// Load the policy from environment variables with defaults.
    ///
    /// | Env Var                          | Default |
    /// |----------------------------------|---------|
    /// | `FIRST_BATCH_FLUSH_INTERVAL_MS`  | `100`   |
    /// | `FIRST_BATCH_FLUSH_MAX_TOKENS`   | `3`     |
    /// | `BATCH_FLUSH_INTERVAL_MS`        | `300`   |
    /// | `BATCH_FLUSH_MAX_TOKENS`         | `20`    |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reading through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let read = |key: &str, default: u64| -> Result<u64, CoreError> {
            match lookup(key) {
                Some(raw) => raw.trim().parse().map_err(|_| {
                    CoreError::Validation(format!("{key} must be a non-negative integer, got '{raw}'"))
                }),
                None => Ok(default),
            }
        };

        let policy = Self {
            first: PhaseThresholds {
                interval: Duration::from_millis(read(
                    "FIRST_BATCH_FLUSH_INTERVAL_MS",
                    defaults.first.interval.as_millis() as u64,
                )?),
                max_fragments: read(
                    "FIRST_BATCH_FLUSH_MAX_TOKENS",
                    defaults.first.max_fragments as u64,
                )? as usize,
            },
            steady: PhaseThresholds {
                interval: Duration::from_millis(read(
                    "BATCH_FLUSH_INTERVAL_MS",
                    defaults.steady.interval.as_millis() as u64,
                )?),
                max_fragments: read("BATCH_FLUSH_MAX_TOKENS", defaults.steady.max_fragments as u64)?
                    as usize,
            },
        };
        policy.validate()?;
        Ok(policy)
    }

    /// A zero count threshold would flush on every push and is rejected.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.first.max_fragments == 0 || self.steady.max_fragments == 0 {
            return Err(CoreError::Validation(
                "Batch flush token thresholds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn thresholds(&self, phase: BatchPhase) -> PhaseThresholds {
        match phase {
            BatchPhase::First => self.first,
            BatchPhase::Steady => self.steady,
        }
    }
}

// ---------------------------------------------------------------------------
// Buffer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPhase {
    First,
    Steady,
}

/// Why a batch was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    Count,
    Interval,
    StreamEnd,
}

/// One flushed unit of accumulated text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Strictly increasing from 1 within a run.
    pub number: u64,
    /// Fragments concatenated in arrival order, no separator.
    pub text: String,
    pub fragment_count: usize,
    pub phase: BatchPhase,
    pub trigger: FlushTrigger,
}

/// Accumulates fragments and decides when to flush.
#[derive(Debug)]
pub struct BatchBuffer {
    policy: BatchPolicy,
    pending: Vec<String>,
    last_flush: Instant,
    phase: BatchPhase,
    next_number: u64,
}

impl BatchBuffer {
    /// Create a buffer at stream start. `started_at` seeds the interval
    /// timer for the first batch.
    pub fn new(policy: BatchPolicy, started_at: Instant) -> Self {
        Self {
            policy,
            pending: Vec::new(),
            last_flush: started_at,
            phase: BatchPhase::First,
            next_number: 1,
        }
    }

    pub fn phase(&self) -> BatchPhase {
        self.phase
    }

    /// Number the next flushed batch will carry.
    pub fn next_batch_number(&self) -> u64 {
        self.next_number
    }

    pub fn pending_fragments(&self) -> usize {
        self.pending.len()
    }

    /// Append a fragment and flush if the current phase's thresholds are
    /// met at `now`. Empty fragments are ignored.
    pub fn push(&mut self, fragment: &str, now: Instant) -> Option<Batch> {
        if fragment.is_empty() {
            return None;
        }
        self.pending.push(fragment.to_string());

        let thresholds = self.policy.thresholds(self.phase);
        if self.pending.len() >= thresholds.max_fragments {
            return self.flush(now, FlushTrigger::Count);
        }
        if now.saturating_duration_since(self.last_flush) >= thresholds.interval {
            return self.flush(now, FlushTrigger::Interval);
        }
        None
    }

    /// Flush whatever remains at stream end, regardless of thresholds.
    ///
    /// Returns `None` when nothing is pending.
    pub fn finish(&mut self, now: Instant) -> Option<Batch> {
        self.flush(now, FlushTrigger::StreamEnd)
    }

    fn flush(&mut self, now: Instant, trigger: FlushTrigger) -> Option<Batch> {
        if self.pending.is_empty() {
            return None;
        }
        let fragment_count = self.pending.len();
        let text = self.pending.concat();
        self.pending.clear();

        let batch = Batch {
            number: self.next_number,
            text,
            fragment_count,
            phase: self.phase,
            trigger,
        };
        self.next_number += 1;
        self.last_flush = now;
        self.phase = BatchPhase::Steady;
        Some(batch)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
