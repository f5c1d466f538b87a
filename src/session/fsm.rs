//! Session lifecycle state machine.
//!
//! Transitions are validated against a fixed table; anything outside it is
//! an [`InvalidTransition`](crate::error::BrowserError::InvalidTransition)
//! bug surfaced to the caller rather than silently absorbed. `Blocked` is a
//! flag layered on `Ready`, not a state of its own: a blocked session still
//! accepts actions (the agent may be solving a challenge), it just reports
//! the condition.

use serde::{Deserialize, Serialize};

use crate::error::{BrowserError, BrowserResult};

/// Lifecycle state of one browser session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Registered, browser not yet started.
    Created,
    /// Browser process starting up.
    Launching,
    /// Idle and able to accept an action.
    Ready,
    /// An action holds the session lock.
    Acting,
    /// Browser process died; only close is possible.
    Crashed,
    /// Teardown in progress.
    Closing,
    /// Terminal.
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Launching => "launching",
            SessionState::Ready => "ready",
            SessionState::Acting => "acting",
            SessionState::Crashed => "crashed",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }

    fn allowed_next(&self) -> &'static [SessionState] {
        use SessionState::*;
        match self {
            Created => &[Launching, Closing],
            Launching => &[Ready, Crashed, Closing],
            Ready => &[Acting, Closing],
            Acting => &[Ready, Crashed],
            Crashed => &[Closing],
            Closing => &[Closed],
            Closed => &[],
        }
    }

    /// Whether the session can ever reach `Acting` again.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SessionState::Created
                | SessionState::Launching
                | SessionState::Ready
                | SessionState::Acting
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

/// Validated state holder for one session.
#[derive(Debug)]
pub struct SessionFsm {
    state: SessionState,
    /// Protection challenge currently detected, if any.
    blocked: Option<String>,
}

impl SessionFsm {
    pub fn new() -> Self {
        Self {
            state: SessionState::Created,
            blocked: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Set the blocked flag. Only meaningful alongside `Ready`/`Acting`.
    pub fn set_blocked(&mut self, kind: Option<String>) {
        self.blocked = kind;
    }

    pub fn blocked(&self) -> Option<&str> {
        self.blocked.as_deref()
    }

    /// Attempt a transition, rejecting anything outside the table.
    pub fn transition(&mut self, next: SessionState) -> BrowserResult<()> {
        if !self.state.allowed_next().contains(&next) {
            return Err(BrowserError::InvalidTransition {
                from: self.state.as_str(),
                to: next.as_str(),
            });
        }
        self.state = next;
        Ok(())
    }
}

impl Default for SessionFsm {
    fn default() -> Self {
        Self::new()
    }
}
