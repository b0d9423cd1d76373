//! Session phase state machine.
//!
//! ```text
//! INITIALIZING ──► ACTIVE ◄──► ROUND_END
//!       │            │             │
//!       └────────────┴─────────────┴──► COMBAT_END
//! ```

use serde::{Deserialize, Serialize};

use super::error::CombatFault;

/// Session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CombatPhase {
    /// Roster received, initiative not rolled.
    Initializing,
    /// Exactly one combatant holds the turn.
    Active,
    /// Between rounds; turn order is being recomputed.
    RoundEnd,
    /// Terminal.
    CombatEnd,
}

impl CombatPhase {
    /// The transition table. Anything not listed is rejected.
    pub fn can_transition_to(self, next: CombatPhase) -> bool {
        use CombatPhase::*;
        matches!(
            (self, next),
            (Initializing, Active)
                | (Active, RoundEnd)
                | (RoundEnd, Active)
                | (Initializing, CombatEnd)
                | (Active, CombatEnd)
                | (RoundEnd, CombatEnd)
        )
    }

    /// Checked transition.
    pub fn transition(self, next: CombatPhase) -> Result<CombatPhase, CombatFault> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CombatFault::IllegalTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn is_terminal(self) -> bool {
        self == CombatPhase::CombatEnd
    }

    pub fn as_u8(self) -> u8 {
        match self {
            CombatPhase::Initializing => 0,
            CombatPhase::Active => 1,
            CombatPhase::RoundEnd => 2,
            CombatPhase::CombatEnd => 3,
        }
    }
}

/// Why a session reached `COMBAT_END`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndReason {
    /// Every hostile combatant defeated.
    Victory,
    /// Every player-aligned combatant defeated.
    Defeat,
    /// One side left the field without being defeated.
    Disengaged,
    /// External abort signal.
    Aborted,
    /// Internal resolution failure.
    Fault,
    /// Round limit reached.
    RoundLimit,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EndReason::Victory => "VICTORY",
            EndReason::Defeat => "DEFEAT",
            EndReason::Disengaged => "DISENGAGED",
            EndReason::Aborted => "ABORTED",
            EndReason::Fault => "FAULT",
            EndReason::RoundLimit => "ROUND_LIMIT",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CombatPhase::*;

    const ALL: [CombatPhase; 4] = [Initializing, Active, RoundEnd, CombatEnd];

    #[test]
    fn test_round_cycle_is_allowed() {
        assert!(Active.can_transition_to(RoundEnd));
        assert!(RoundEnd.can_transition_to(Active));
        assert!(Initializing.can_transition_to(Active));
    }

    #[test]
    fn test_terminal_has_no_exits() {
        for next in ALL {
            assert!(!CombatEnd.can_transition_to(next));
        }
        assert!(CombatEnd.is_terminal());
    }

    #[test]
    fn test_every_live_phase_can_end() {
        for phase in [Initializing, Active, RoundEnd] {
            assert_eq!(phase.transition(CombatEnd), Ok(CombatEnd));
        }
    }

    #[test]
    fn test_no_way_back_to_initializing() {
        for phase in ALL {
            assert!(phase.transition(Initializing).is_err());
        }
        assert!(Initializing.transition(RoundEnd).is_err());
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(serde_json::to_string(&RoundEnd).unwrap(), "\"ROUND_END\"");
        assert_eq!(
            serde_json::to_string(&EndReason::RoundLimit).unwrap(),
            "\"ROUND_LIMIT\""
        );
    }
}
