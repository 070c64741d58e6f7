//! Backend process state machine.
//!
//! # States
//! ```text
//! NotStarted → Starting → Ready → Stopping → Stopped
//!                  └────→ Failed ─┘
//! ```
//!
//! `Ready → Stopping` happens on crash detection, recycle or pool shutdown.
//! Nothing leaves `Stopped`.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted = 0,
    Starting = 1,
    Ready = 2,
    Failed = 3,
    Stopping = 4,
    Stopped = 5,
}

impl From<u8> for ProcessState {
    fn from(val: u8) -> Self {
        match val {
            1 => ProcessState::Starting,
            2 => ProcessState::Ready,
            3 => ProcessState::Failed,
            4 => ProcessState::Stopping,
            5 => ProcessState::Stopped,
            _ => ProcessState::NotStarted,
        }
    }
}

impl ProcessState {
    /// Whether `self → next` is a legal edge.
    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (NotStarted, Stopping)
                | (Starting, Ready)
                | (Starting, Failed)
                | (Starting, Stopping)
                | (Ready, Stopping)
                | (Failed, Stopping)
                | (Stopping, Stopped)
        )
    }
}

/// Lock-free holder for a [`ProcessState`].
#[derive(Debug)]
pub struct AtomicProcessState(AtomicU8);

impl AtomicProcessState {
    pub fn new(state: ProcessState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> ProcessState {
        ProcessState::from(self.0.load(Ordering::Acquire))
    }

    /// Move to `next` if the current state allows it. Returns the state that
    /// was replaced on success.
    pub fn transition(&self, next: ProcessState) -> Result<ProcessState, ProcessState> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let state = ProcessState::from(current);
            if !state.can_transition_to(next) {
                return Err(state);
            }
            match self
                .0
                .compare_exchange_weak(current, next as u8, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(state),
                Err(actual) => current = actual,
            }
        }
    }
}
