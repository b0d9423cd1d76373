//! Domain events and state deltas.
//!
//! The authority mutates canonical state only by applying these events, and
//! mirrors apply the same events with the same code. Anything a mirror needs
//! to stay consistent therefore travels inside the event.

use serde::{Deserialize, Serialize};

use super::grid::GridPos;
use super::log::ActionLogEntry;
use super::phase::EndReason;
use super::reward::Reward;
use super::state::{CombatantId, CombatantStatus, StatusCondition};

// =============================================================================
// STATE DELTAS
// =============================================================================

/// One atomic change produced by resolving an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "kind",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum StateDelta {
    /// Hit point loss, clamped at 0. Reaching 0 defeats the combatant.
    Damage { target: CombatantId, amount: i32 },
    /// Hit point gain, clamped at `hpMax`.
    Heal { target: CombatantId, amount: i32 },
    Move { combatant: CombatantId, to: GridPos },
    SpendActionPoints { combatant: CombatantId, amount: u32 },
    SpendMovement { combatant: CombatantId, amount: u32 },
    RestoreMovement { combatant: CombatantId, amount: u32 },
    AddCondition {
        combatant: CombatantId,
        condition: StatusCondition,
    },
    RemoveCondition { combatant: CombatantId, tag: String },
    SetStatus {
        combatant: CombatantId,
        status: CombatantStatus,
    },
    ConsumeItem { combatant: CombatantId, item_ref: String },
    ConsumeCharge {
        combatant: CombatantId,
        ability_ref: String,
    },
}

// =============================================================================
// EVENTS
// =============================================================================

/// Initiative result for one combatant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiativeEntry {
    pub combatant_id: CombatantId,
    pub name: String,
    pub initiative: i32,
}

/// Payload of `ACTION_RESULT`: the log entry plus the deltas it caused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResolved {
    #[serde(flatten)]
    pub entry: ActionLogEntry,
    #[serde(default)]
    pub effects: Vec<StateDelta>,
}

/// State-changing event broadcast to every observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum CombatEvent {
    /// Phase -> ACTIVE, round 1.
    InitiativeRolled {
        combatants: Vec<InitiativeEntry>,
        turn_order: Vec<CombatantId>,
        round: u32,
    },
    TurnStart {
        combatant_id: CombatantId,
        action_points: u32,
        movement: u32,
    },
    TurnEnd { combatant_id: CombatantId },
    #[serde(rename = "ACTION_RESULT")]
    ActionResolved(ActionResolved),
    /// `round` is the round about to begin.
    RoundEnd {
        round: u32,
        turn_order: Vec<CombatantId>,
    },
    CombatEnd {
        reason: EndReason,
        rewards: Option<Reward>,
    },
}

impl CombatEvent {
    /// Wire `type` name.
    pub fn type_name(&self) -> &'static str {
        match self {
            CombatEvent::InitiativeRolled { .. } => "INITIATIVE_ROLLED",
            CombatEvent::TurnStart { .. } => "TURN_START",
            CombatEvent::TurnEnd { .. } => "TURN_END",
            CombatEvent::ActionResolved(_) => "ACTION_RESULT",
            CombatEvent::RoundEnd { .. } => "ROUND_END",
            CombatEvent::CombatEnd { .. } => "COMBAT_END",
        }
    }

    /// Every wire type name carried by this enum.
    pub const TYPE_NAMES: [&'static str; 6] = [
        "INITIATIVE_ROLLED",
        "TURN_START",
        "TURN_END",
        "ACTION_RESULT",
        "ROUND_END",
        "COMBAT_END",
    ];

    pub fn log_entry(&self) -> Option<&ActionLogEntry> {
        match self {
            CombatEvent::ActionResolved(resolved) => Some(&resolved.entry),
            _ => None,
        }
    }
}

/// An event stamped with its position in the session's event stream.
///
/// Event sequence numbers start at 1, are gapless per session, and are
/// independent of action log sequence numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub seq: u64,
    pub event: CombatEvent,
}
