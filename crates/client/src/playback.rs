//! Tokio driver for the adaptive [`Typewriter`].
//!
//! The driver owns the typewriter and a tick deadline. Text arrives as
//! [`PlaybackCommand::Enqueue`]; each reveal goes out on the reveal
//! channel. When the queue empties the deadline is cleared, so an idle
//! driver only waits on its command channel.
//!
//! [`PlaybackCommand::Flush`] reveals everything still queued in one step
//! and acknowledges once that text has been handed to the reveal channel.
//! Closing the command channel flushes as well.
//!
//! Commands arrive on an unbounded channel. The sender also drains the
//! reveal channel, so it must never wait on the driver.

use jobstream_core::playback::{PlaybackConfig, Reveal, Typewriter};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

#[derive(Debug)]
pub enum PlaybackCommand {
    Enqueue(String),
    /// Reveal the remaining queue now, then signal the sender.
    Flush(oneshot::Sender<()>),
}

pub struct PlaybackDriver {
    typewriter: Typewriter,
    commands: mpsc::UnboundedReceiver<PlaybackCommand>,
    reveals: mpsc::Sender<Reveal>,
    next_tick: Option<Instant>,
}

impl PlaybackDriver {
    pub fn new(
        config: PlaybackConfig,
        commands: mpsc::UnboundedReceiver<PlaybackCommand>,
        reveals: mpsc::Sender<Reveal>,
    ) -> Self {
        Self {
            typewriter: Typewriter::new(config),
            commands,
            reveals,
            next_tick: None,
        }
    }

    /// Run until the command channel closes or the reveal receiver is
    /// dropped. Returns the number of characters revealed.
    pub async fn run(mut self) -> usize {
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(PlaybackCommand::Enqueue(text)) => self.enqueue(&text),
                    Some(PlaybackCommand::Flush(ack)) => {
                        self.flush().await;
                        let _ = ack.send(());
                    }
                    None => {
                        self.flush().await;
                        break;
                    }
                },
                _ = sleep_until(self.next_tick) => {
                    if !self.tick().await {
                        break;
                    }
                }
            }
        }
        self.typewriter.total_emitted()
    }

    fn enqueue(&mut self, text: &str) {
        self.typewriter.enqueue(text);
        if self.next_tick.is_none() {
            self.schedule(Instant::now());
        }
    }

    fn schedule(&mut self, from: Instant) {
        self.next_tick = self.typewriter.next_delay().map(|delay| from + delay);
    }

    /// Returns `false` when the reveal receiver is gone.
    async fn tick(&mut self) -> bool {
        let Some(reveal) = self.typewriter.tick() else {
            self.next_tick = None;
            return true;
        };
        tracing::trace!(remaining = reveal.remaining, "Playback tick");
        if self.reveals.send(reveal).await.is_err() {
            return false;
        }
        self.schedule(Instant::now());
        true
    }

    async fn flush(&mut self) {
        self.next_tick = None;
        let text = self.typewriter.flush();
        if text.is_empty() {
            return;
        }
        tracing::debug!(chars = text.chars().count(), "Playback flushed");
        let _ = self.reveals.send(Reveal { text, remaining: 0 }).await;
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
