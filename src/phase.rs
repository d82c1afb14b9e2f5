//! Play Phase State Machine
//!
//! This module is the authoritative source of truth for which phase a Play may
//! move to next. The engine consults it before every status write so a Play can
//! never skip ahead, move backwards, or leave a terminal phase.
//!
//! # Phase Flow
//!
//! ```text
//! (unset)
//!     ↓
//! Created
//!     ↓
//! Init ───────────────┐
//!     ↓               │
//! Running ──┬─────────┤
//!     ↓     ↓         ↓
//! Complete Failed   Error
//! ```
//!
//! `Running` is re-entered on every reconciliation until all frames of the
//! main screenplay are terminal; that re-entry is not a transition.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use thiserror::Error;

/// Lifecycle phase of a Play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[repr(u8)]
pub enum PlayPhase {
    /// Accepted, nothing provisioned yet
    Created = 0,
    /// Provisioning the vars config object and volumes
    Init = 1,
    /// Scenes are being scheduled
    Running = 2,
    /// Every scene passed (terminal)
    Complete = 3,
    /// A scene failed (terminal)
    Failed = 4,
    /// Configuration, provisioning or submission failure (terminal)
    Error = 5,
}

impl PlayPhase {
    /// Position in the lifecycle; all terminal phases share the same rank.
    #[inline]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Init => 1,
            Self::Running => 2,
            Self::Complete | Self::Failed | Self::Error => 3,
        }
    }

    /// Returns true for `Complete`, `Failed` and `Error`
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Error)
    }

    /// Returns true if this phase ends the Play unsuccessfully
    #[inline]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Error)
    }

    /// The phase a Play enters next on the success path, or None if terminal
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Created => Some(Self::Init),
            Self::Init => Some(Self::Running),
            Self::Running => Some(Self::Complete),
            Self::Complete | Self::Failed | Self::Error => None,
        }
    }

    /// Human-readable description used in logs
    pub const fn description(self) -> &'static str {
        match self {
            Self::Created => "play created",
            Self::Init => "provisioning resources",
            Self::Running => "running scenes",
            Self::Complete => "play complete",
            Self::Failed => "play failed",
            Self::Error => "play errored",
        }
    }

    /// Validate a move from `from` (None = unset status) to `to`.
    ///
    /// Allowed moves:
    /// - unset → `Created` or `Init`
    /// - one step forward along `Created → Init → Running → Complete`
    /// - `Init` or `Running` → `Error`
    /// - `Running` → `Failed`
    pub fn check_transition(
        from: Option<PlayPhase>,
        to: PlayPhase,
    ) -> Result<(), PhaseTransitionError> {
        let Some(from) = from else {
            return match to {
                Self::Created | Self::Init => Ok(()),
                _ => Err(PhaseTransitionError::SkippedPhase {
                    from: None,
                    to,
                }),
            };
        };

        if from.is_terminal() {
            return Err(PhaseTransitionError::FromTerminalPhase { from });
        }
        if from == to {
            return Err(PhaseTransitionError::AlreadyInPhase { phase: to });
        }
        if to.rank() < from.rank() {
            return Err(PhaseTransitionError::BackwardTransition { from, to });
        }

        let allowed = from.next() == Some(to)
            || (to == Self::Error && matches!(from, Self::Init | Self::Running))
            || (to == Self::Failed && from == Self::Running);
        if allowed {
            Ok(())
        } else {
            Err(PhaseTransitionError::SkippedPhase {
                from: Some(from),
                to,
            })
        }
    }
}

/// Errors raised by illegal phase moves
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PhaseTransitionError {
    /// Attempted to jump over one or more phases
    #[error("Cannot move from {} to {to} (phases must not be skipped)", display_from(.from))]
    SkippedPhase {
        from: Option<PlayPhase>,
        to: PlayPhase,
    },

    /// Attempted to go back to an earlier phase
    #[error("Cannot go backwards from {from} to {to}")]
    BackwardTransition { from: PlayPhase, to: PlayPhase },

    /// Terminal phases are final
    #[error("Cannot leave terminal phase {from}")]
    FromTerminalPhase { from: PlayPhase },

    /// Attempted to transition to the current phase
    #[error("Already in phase {phase}")]
    AlreadyInPhase { phase: PlayPhase },
}

fn display_from(from: &Option<PlayPhase>) -> String {
    match from {
        Some(phase) => phase.to_string(),
        None => "<unset>".to_string(),
    }
}

impl From<PhaseTransitionError> for crate::error::EngineError {
    fn from(err: PhaseTransitionError) -> Self {
        crate::error::EngineError::Transition(err.to_string())
    }
}
