//! Error taxonomy for the control plane.
//!
//! Every failure carries a stable code and a three-level recoverability so
//! the calling agent can choose its next step without string matching:
//! RECOVERABLE errors are fixed by correcting input and retrying,
//! ESCALATABLE errors need a stealth-tier or strategy change, and
//! NON_RECOVERABLE errors require a fresh session. The control plane never
//! retries on its own.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the caller should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recoverability {
    /// Correct the input (re-snapshot, wait, retry).
    Recoverable,
    /// Escalate the engine tier or change strategy.
    Escalatable,
    /// Create a new session; this one is gone.
    NonRecoverable,
}

#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("ref '{0}' not found in the current snapshot")]
    RefNotFound(String),

    #[error("rate limited on {domain}: wait {wait_seconds:.1}s")]
    RateLimited { domain: String, wait_seconds: f64 },

    #[error("action timed out after {0}ms")]
    ActionTimeout(u64),

    #[error("snapshot extraction timed out after {0}ms")]
    ExtractionTimeout(u64),

    #[error("anti-bot challenge detected: {0}")]
    ChallengeDetected(String),

    #[error("browser engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("session {0} not found or expired")]
    SessionNotFound(String),

    #[error("session limit reached ({0} active)")]
    SessionLimit(usize),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    #[error("missing required param: {0}")]
    MissingParam(&'static str),

    #[error("unknown engine tier: {0}")]
    UnknownTier(u8),

    #[error("engine error: {0}")]
    Engine(String),
}

impl BrowserError {
    /// Stable identifier for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RefNotFound(_) => "REF_NOT_FOUND",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::ActionTimeout(_) => "ACTION_TIMEOUT",
            Self::ExtractionTimeout(_) => "EXTRACTION_TIMEOUT",
            Self::ChallengeDetected(_) => "CHALLENGE_DETECTED",
            Self::EngineUnavailable(_) => "ENGINE_UNAVAILABLE",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::SessionLimit(_) => "SESSION_LIMIT",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::MissingParam(_) => "MISSING_PARAM",
            Self::UnknownTier(_) => "UNKNOWN_TIER",
            Self::Engine(_) => "ENGINE_ERROR",
        }
    }

    pub fn recoverability(&self) -> Recoverability {
        match self {
            Self::RefNotFound(_)
            | Self::RateLimited { .. }
            | Self::ActionTimeout(_)
            | Self::ExtractionTimeout(_)
            | Self::MissingParam(_) => Recoverability::Recoverable,
            Self::ChallengeDetected(_) => Recoverability::Escalatable,
            Self::EngineUnavailable(_)
            | Self::SessionNotFound(_)
            | Self::SessionLimit(_)
            | Self::InvalidTransition { .. }
            | Self::UnknownTier(_)
            | Self::Engine(_) => Recoverability::NonRecoverable,
        }
    }

    /// What the agent should do next.
    pub fn agent_action(&self) -> &'static str {
        match self {
            Self::RefNotFound(_) => "Take a new snapshot; the ref is stale.",
            Self::RateLimited { .. } => "Wait before retrying; reduce action frequency on this domain.",
            Self::ActionTimeout(_) => "Take a new snapshot to verify page state, then retry.",
            Self::ExtractionTimeout(_) => "Retry the snapshot, possibly with a smaller max_depth.",
            Self::ChallengeDetected(_) => "Escalate to a higher stealth tier.",
            Self::EngineUnavailable(_) => "Launch a new session; the browser is gone.",
            Self::SessionNotFound(_) => "Launch a new session.",
            Self::SessionLimit(_) => "Close an idle session before launching another.",
            Self::InvalidTransition { .. } => "Internal error; report it.",
            Self::MissingParam(_) => "Supply the missing parameter and retry.",
            Self::UnknownTier(_) => "Use a supported engine tier.",
            Self::Engine(_) => "Take a snapshot to assess state.",
        }
    }

    /// Serializable form for action results.
    pub fn info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code().to_string(),
            message: self.to_string(),
            recoverability: self.recoverability(),
            agent_action: self.agent_action().to_string(),
        }
    }
}

/// Structured error payload carried in [`ActionResult`](crate::dispatch::ActionResult).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    pub recoverability: Recoverability,
    pub agent_action: String,
}

pub type BrowserResult<T> = Result<T, BrowserError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err = BrowserError::RefNotFound("e3".into());
        assert_eq!(err.code(), "REF_NOT_FOUND");
        assert_eq!(err.recoverability(), Recoverability::Recoverable);

        let err = BrowserError::ChallengeDetected("cloudflare".into());
        assert_eq!(err.recoverability(), Recoverability::Escalatable);

        let err = BrowserError::EngineUnavailable("page destroyed".into());
        assert_eq!(err.recoverability(), Recoverability::NonRecoverable);
    }

    #[test]
    fn info_round_trips_through_json() {
        let info = BrowserError::RateLimited {
            domain: "linkedin.com".into(),
            wait_seconds: 42.5,
        }
        .info();
        let json = serde_json::to_string(&info).unwrap();
        let back: ErrorInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back.code, "RATE_LIMITED");
        assert_eq!(back.recoverability, Recoverability::Recoverable);
    }
}
