use crate::error::JobError;
use chrono::{DateTime, Utc};
use isobox_common::types::JobState;
use uuid::Uuid;

/// READY -> PRIMED -> EXECUTING -> EXECUTED, with FAILED reachable from any
/// non-terminal state. Terminal states accept nothing.
#[derive(Debug, Clone)]
pub struct JobStateMachine {
    job_id: Uuid,
    state: JobState,
    history: Vec<(JobState, DateTime<Utc>)>,
}

impl JobStateMachine {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            state: JobState::Ready,
            history: vec![(JobState::Ready, Utc::now())],
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn history(&self) -> &[(JobState, DateTime<Utc>)] {
        &self.history
    }

    pub fn can_transition(from: JobState, to: JobState) -> bool {
        use JobState::*;
        match (from, to) {
            (Ready, Primed) | (Primed, Executing) | (Executing, Executed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn transition(&mut self, to: JobState) -> Result<(), JobError> {
        if !Self::can_transition(self.state, to) {
            return Err(JobError::InvalidTransition { from: self.state, to });
        }
        tracing::debug!(job_id = %self.job_id, from = %self.state, to = %to, "job transition");
        self.state = to;
        self.history.push((to, Utc::now()));
        Ok(())
    }

    /// Move to FAILED unless already terminal.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            let _ = self.transition(JobState::Failed);
        }
    }
}
