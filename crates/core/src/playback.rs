//! Adaptive typewriter playback.
//!
//! Batched text arrives in bursts. [`Typewriter`] turns those bursts into
//! a steady reveal by adapting the per-character delay to the backlog:
//! an almost empty queue types slowly, a queue at or beyond
//! [`PlaybackConfig::fast_threshold`] types at full speed, and a queue
//! beyond [`PlaybackConfig::burst_threshold`] reveals several characters
//! per tick so playback never falls unboundedly behind.
//!
//! The state machine never sleeps. A driver asks for
//! [`next_delay`](Typewriter::next_delay), waits that long on whatever
//! clock it owns, then calls [`tick`](Typewriter::tick). Tests can
//! therefore simulate thousands of ticks by summing delays.

use std::collections::VecDeque;
use std::time::Duration;

pub const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30);
pub const DEFAULT_FAST_THRESHOLD: usize = 50;
pub const DEFAULT_BURST_THRESHOLD: usize = 200;
pub const DEFAULT_BURST_CHARS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackConfig {
    /// Delay used when the backlog is at or above `fast_threshold`.
    pub min_delay: Duration,
    /// Delay used when the backlog is (nearly) empty.
    pub max_delay: Duration,
    /// Backlog length at which the fastest rate is reached.
    pub fast_threshold: usize,
    /// Backlog length above which `burst_chars` are revealed per tick.
    pub burst_threshold: usize,
    pub burst_chars: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            fast_threshold: DEFAULT_FAST_THRESHOLD,
            burst_threshold: DEFAULT_BURST_THRESHOLD,
            burst_chars: DEFAULT_BURST_CHARS,
        }
    }
}

impl PlaybackConfig {
    /// Inter-character delay for a backlog of `queue_len` characters.
    ///
    /// `max - min(len / fast, 1) * (max - min)`
    pub fn delay_for(&self, queue_len: usize) -> Duration {
        let max = self.max_delay.as_nanos();
        let min = self.min_delay.as_nanos().min(max);
        if self.fast_threshold == 0 {
            return self.min_delay.min(self.max_delay);
        }
        let fast = self.fast_threshold as u128;
        let filled = (queue_len as u128).min(fast);
        let nanos = max - (max - min) * filled / fast;
        Duration::from_nanos(nanos as u64)
    }

    /// Characters revealed in one tick for a backlog of `queue_len`.
    pub fn chars_per_tick(&self, queue_len: usize) -> usize {
        if queue_len > self.burst_threshold {
            self.burst_chars.max(1)
        } else {
            1
        }
    }
}

/// Text revealed by one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reveal {
    pub text: String,
    /// Characters still queued after this reveal.
    pub remaining: usize,
}

/// Queue-driven reveal state machine.
#[derive(Debug, Default)]
pub struct Typewriter {
    config: PlaybackConfig,
    queue: VecDeque<char>,
    enqueued: usize,
    emitted: usize,
}

impl Typewriter {
    pub fn new(config: PlaybackConfig) -> Self {
        Self {
            config,
            queue: VecDeque::new(),
            enqueued: 0,
            emitted: 0,
        }
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    pub fn enqueue(&mut self, text: &str) {
        let before = self.queue.len();
        self.queue.extend(text.chars());
        self.enqueued += self.queue.len() - before;
    }

    /// Queued characters not yet revealed.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// `true` when there is nothing to reveal; the driver should wait for
    /// new text instead of scheduling a tick.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Delay before the next tick, or `None` when idle.
    pub fn next_delay(&self) -> Option<Duration> {
        (!self.is_idle()).then(|| self.config.delay_for(self.queue.len()))
    }

    /// Reveal one tick's worth of characters.
    pub fn tick(&mut self) -> Option<Reveal> {
        if self.queue.is_empty() {
            return None;
        }
        let count = self.config.chars_per_tick(self.queue.len()).min(self.queue.len());
        let text: String = self.queue.drain(..count).collect();
        self.emitted += count;
        Some(Reveal {
            text,
            remaining: self.queue.len(),
        })
    }

    /// Reveal everything still queued in one step.
    pub fn flush(&mut self) -> String {
        let text: String = self.queue.drain(..).collect();
        self.emitted += text.chars().count();
        text
    }

    pub fn total_enqueued(&self) -> usize {
        self.enqueued
    }

    pub fn total_emitted(&self) -> usize {
        self.emitted
    }
}
