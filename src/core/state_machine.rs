//! State machine for tracking one upload task through its attempts
//!
//! `Pending -> InFlight -> {Succeeded | Retrying -> InFlight | Failed | Cancelled}`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::OutcomeState;

/// Upload task state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    InFlight,
    Retrying,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    fn can_transition_to(&self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Pending, InFlight)
                | (Pending, Cancelled)
                | (InFlight, Succeeded)
                | (InFlight, Retrying)
                | (InFlight, Failed)
                | (InFlight, Cancelled)
                | (Retrying, InFlight)
                | (Retrying, Cancelled)
        )
    }
}

/// Rejected state change
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("[{key}] illegal transition {from:?} -> {to:?}")]
pub struct StateError {
    pub key: String,
    pub from: TaskState,
    pub to: TaskState,
}

/// State transition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateTransition {
    pub from: TaskState,
    pub to: TaskState,
    pub timestamp: DateTime<Utc>,
    /// Attempt number current at the time of the transition
    pub attempt: u32,
}

/// Lifecycle of a single upload task
#[derive(Debug, Clone)]
pub struct TaskStateMachine {
    key: String,
    current_state: TaskState,
    attempts: u32,
    transitions: Vec<StateTransition>,
}

impl TaskStateMachine {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            current_state: TaskState::Pending,
            attempts: 0,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new state
    pub fn transition(&mut self, to: TaskState) -> Result<(), StateError> {
        if !self.current_state.can_transition_to(to) {
            return Err(StateError {
                key: self.key.clone(),
                from: self.current_state,
                to,
            });
        }

        if to == TaskState::InFlight {
            self.attempts += 1;
        }

        self.transitions.push(StateTransition {
            from: self.current_state,
            to,
            timestamp: Utc::now(),
            attempt: self.attempts,
        });
        self.current_state = to;

        Ok(())
    }

    pub fn state(&self) -> TaskState {
        self.current_state
    }

    /// Number of times the task went in flight
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    /// Outcome state, once terminal
    pub fn outcome_state(&self) -> Option<OutcomeState> {
        match self.current_state {
            TaskState::Succeeded => Some(OutcomeState::Succeeded),
            TaskState::Failed => Some(OutcomeState::Failed),
            TaskState::Cancelled => Some(OutcomeState::Cancelled),
            _ => None,
        }
    }

    /// Get elapsed time between the first and last transition
    pub fn elapsed_ms(&self) -> i64 {
        match (self.transitions.first(), self.transitions.last()) {
            (Some(first), Some(last)) => (last.timestamp - first.timestamp).num_milliseconds(),
            _ => 0,
        }
    }

    /// Get transition history as human-readable string
    pub fn history(&self) -> String {
        self.transitions
            .iter()
            .map(|t| format!("#{} {:?} → {:?}", t.attempt, t.from, t.to))
            .collect::<Vec<_>>()
            .join(", ")
    }
}
