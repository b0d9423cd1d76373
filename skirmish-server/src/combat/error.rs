//! Combat error types.
//!
//! Two families: [`ActionError`] rejects one command without touching state;
//! [`CombatFault`] means canonical state could not be advanced and ends the
//! session.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::phase::CombatPhase;
use super::state::CombatantId;

/// Wire error codes reported in `ERROR` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    SessionNotActive,
    NotYourTurn,
    InsufficientResources,
    InvalidTarget,
    InvalidCell,
    ContentUnavailable,
    /// Client-side only: a command is already awaiting its result.
    CommandPending,
    InvalidMessage,
    SessionNotFound,
}

impl ErrorCode {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SessionNotActive => "session-not-active",
            ErrorCode::NotYourTurn => "not-your-turn",
            ErrorCode::InsufficientResources => "insufficient-resources",
            ErrorCode::InvalidTarget => "invalid-target",
            ErrorCode::InvalidCell => "invalid-cell",
            ErrorCode::ContentUnavailable => "content-unavailable",
            ErrorCode::CommandPending => "command-pending",
            ErrorCode::InvalidMessage => "invalid-message",
            ErrorCode::SessionNotFound => "session-not-found",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an `ERROR` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub code: ErrorCode,
    pub message: String,
}

impl Rejection {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Validation failure for a single command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("session is not accepting actions (phase {0:?})")]
    SessionNotActive(CombatPhase),

    #[error("not {actor}'s turn")]
    NotYourTurn { actor: String },

    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("invalid cell: {0}")]
    InvalidCell(String),

    #[error("content unavailable: {0}")]
    ContentUnavailable(String),
}

impl ActionError {
    /// Map onto the wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            ActionError::SessionNotActive(_) => ErrorCode::SessionNotActive,
            ActionError::NotYourTurn { .. } => ErrorCode::NotYourTurn,
            ActionError::InsufficientResources(_) => ErrorCode::InsufficientResources,
            ActionError::InvalidTarget(_) => ErrorCode::InvalidTarget,
            ActionError::InvalidCell(_) => ErrorCode::InvalidCell,
            ActionError::ContentUnavailable(_) => ErrorCode::ContentUnavailable,
        }
    }

    pub fn to_rejection(&self) -> Rejection {
        Rejection::new(self.code(), self.to_string())
    }
}

/// Session-fatal failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CombatFault {
    #[error("invalid roster: {0}")]
    InvalidRoster(String),

    #[error("illegal phase transition {from:?} -> {to:?}")]
    IllegalTransition { from: CombatPhase, to: CombatPhase },

    #[error("unknown combatant {0}")]
    UnknownCombatant(CombatantId),

    #[error("action log sequence out of order: expected {expected}, got {found}")]
    LogSequence { expected: u64, found: u64 },

    #[error("combatant {combatant} lacks {reference}")]
    MissingResource {
        combatant: CombatantId,
        reference: String,
    },

    #[error("inconsistent state: {0}")]
    Inconsistent(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_serialize_kebab_case() {
        let json = serde_json::to_string(&ErrorCode::InsufficientResources).unwrap();
        assert_eq!(json, "\"insufficient-resources\"");

        for code in [
            ErrorCode::SessionNotActive,
            ErrorCode::NotYourTurn,
            ErrorCode::InvalidTarget,
            ErrorCode::InvalidCell,
            ErrorCode::ContentUnavailable,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn test_action_error_codes() {
        let err = ActionError::NotYourTurn {
            actor: "goblin".into(),
        };
        assert_eq!(err.code(), ErrorCode::NotYourTurn);

        let rejection = err.to_rejection();
        assert_eq!(rejection.code, ErrorCode::NotYourTurn);
        assert!(rejection.message.contains("goblin"));
    }
}
