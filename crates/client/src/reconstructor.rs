//! Extracts batched response text from the step event stream.
//!
//! Only "started" events of batch steps (`chat:tokens:{n}` or the legacy
//! `chat:token:{n}`) carry text. The reconstructor is idempotent per batch
//! number: a redelivered batch is counted and ignored, so retries that
//! replay already-seen events never duplicate text. Batches are forwarded
//! in arrival order even if a number arrives late.

use std::collections::BTreeSet;

use jobstream_core::step_event::StepEvent;
use serde::Serialize;

/// Text extracted from one batch start event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextDelta {
    pub batch: u64,
    pub text: String,
}

/// Diagnostics counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconstructorStats {
    /// Distinct batches whose text was forwarded.
    pub batches_started: u64,
    /// Batch finish events observed.
    pub batches_finished: u64,
    /// Batch start events dropped because the number was already seen.
    pub duplicates: u64,
    /// Batches that arrived after a higher-numbered batch.
    pub out_of_order: u64,
}

#[derive(Debug, Default)]
pub struct TokenReconstructor {
    text: String,
    seen: BTreeSet<u64>,
    finished: BTreeSet<u64>,
    stats: ReconstructorStats,
}

impl TokenReconstructor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one event, returning the text it contributes, if any.
    pub fn accept(&mut self, event: &StepEvent) -> Option<TextDelta> {
        let batch = event.batch_number()?;

        if event.finished {
            if self.finished.insert(batch) {
                self.stats.batches_finished += 1;
            }
            return None;
        }

        if self.seen.contains(&batch) {
            self.stats.duplicates += 1;
            tracing::debug!(batch, "Ignoring redelivered batch");
            return None;
        }
        if self.seen.last().is_some_and(|max| batch < *max) {
            self.stats.out_of_order += 1;
            tracing::debug!(batch, "Batch arrived out of order");
        }
        self.seen.insert(batch);
        self.stats.batches_started += 1;

        if event.message.is_empty() {
            return None;
        }
        self.text.push_str(&event.message);
        Some(TextDelta {
            batch,
            text: event.message.clone(),
        })
    }

    /// All text reconstructed so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn stats(&self) -> ReconstructorStats {
        self.stats
    }
}
