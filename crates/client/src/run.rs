//! Per-run client state.

use jobstream_core::status::JobStatus;
use jobstream_core::step_event::StepEvent;
use jobstream_core::types::SequenceId;

use crate::subscriber::ConnectionPhase;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Finished(JobStatus),
    Errored(String),
    Cancelled,
}

/// Everything the client knows about one job run.
///
/// Owned by the pipeline coordinator; created on submit/attach and
/// discarded with the run.
#[derive(Debug, Clone)]
pub struct RunState {
    job_id: String,
    phase: ConnectionPhase,
    cursor: Option<SequenceId>,
    events: Vec<StepEvent>,
    text: String,
    revealed: String,
    outcome: Option<RunOutcome>,
}

impl RunState {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            phase: ConnectionPhase::Idle,
            cursor: None,
            events: Vec::new(),
            text: String::new(),
            revealed: String::new(),
            outcome: None,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn phase(&self) -> &ConnectionPhase {
        &self.phase
    }

    pub fn set_phase(&mut self, phase: ConnectionPhase) {
        self.phase = phase;
    }

    /// Last sequence id seen. Never moves backwards.
    pub fn cursor(&self) -> Option<&SequenceId> {
        self.cursor.as_ref()
    }

    /// Append an event and advance the cursor if the event carries a newer
    /// sequence id.
    pub fn record_event(&mut self, event: StepEvent) {
        if let Some(seq) = &event.sequence_id {
            if self.cursor.as_ref().map_or(true, |cursor| seq > cursor) {
                self.cursor = Some(seq.clone());
            }
        }
        self.events.push(event);
    }

    pub fn events(&self) -> &[StepEvent] {
        &self.events
    }

    pub fn append_text(&mut self, text: &str) {
        self.text.push_str(text);
    }

    /// Reconstructed text, whether or not playback has revealed it yet.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn append_revealed(&mut self, text: &str) {
        self.revealed.push_str(text);
    }

    /// Text already shown to the user.
    pub fn revealed(&self) -> &str {
        &self.revealed
    }

    /// Record how the run ended. The first outcome wins.
    pub fn finish(&mut self, outcome: RunOutcome) {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
        }
    }

    pub fn outcome(&self) -> Option<&RunOutcome> {
        self.outcome.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobstream_core::step_event::EventKind;

    fn event(seq: &str) -> StepEvent {
        StepEvent {
            step_id: "s".into(),
            message: String::new(),
            finished: false,
            server_timestamp: None,
            received_at: chrono::Utc::now(),
            sequence_id: Some(SequenceId::new(seq)),
            latency_meta: None,
            kind: EventKind::Step,
        }
    }

    #[test]
    fn cursor_never_regresses() {
        let mut state = RunState::new("job-1");
        state.record_event(event("5"));
        state.record_event(event("3"));
        assert_eq!(state.cursor(), Some(&SequenceId::new("5")));
        state.record_event(event("6"));
        assert_eq!(state.cursor(), Some(&SequenceId::new("6")));
        assert_eq!(state.events().len(), 3);
    }

    #[test]
    fn first_outcome_wins() {
        let mut state = RunState::new("job-1");
        state.finish(RunOutcome::Errored("boom".into()));
        state.finish(RunOutcome::Finished(JobStatus::Succeeded));
        assert_eq!(state.outcome(), Some(&RunOutcome::Errored("boom".into())));
        assert!(state.is_terminal());
    }
}
