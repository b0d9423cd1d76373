//! Append-only action log.
//!
//! Sequence numbers start at 1 and have no gaps. Mirrors replay backfill
//! from them after a resync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::CombatFault;
use super::state::CombatantId;

/// Kind of resolved action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Move,
    Attack,
    Defend,
    UseItem,
    UseAbility,
    Disengage,
    Overwatch,
    /// Reactive attack fired by a combatant on overwatch.
    OverwatchShot,
    EndTurn,
}

/// `{success, damage?, message}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    #[serde(default)]
    pub damage: Option<i32>,
    pub message: String,
}

/// Immutable record of one resolved action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionLogEntry {
    pub id: Uuid,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub actor_id: CombatantId,
    pub actor_name: String,
    pub action_type: ActionType,
    #[serde(default)]
    pub target_id: Option<CombatantId>,
    #[serde(default)]
    pub target_name: Option<String>,
    pub result: ActionOutcome,
}

/// Ordered, gapless list of [`ActionLogEntry`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionLog {
    entries: Vec<ActionLogEntry>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number the next entry must carry.
    pub fn next_sequence(&self) -> u64 {
        self.entries.len() as u64 + 1
    }

    /// Sequence of the newest entry, 0 when empty.
    pub fn last_sequence(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Append an entry, rejecting anything that would leave a gap.
    pub fn append(&mut self, entry: ActionLogEntry) -> Result<(), CombatFault> {
        let expected = self.next_sequence();
        if entry.sequence != expected {
            return Err(CombatFault::LogSequence {
                expected,
                found: entry.sequence,
            });
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[ActionLogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
pub(crate) fn test_entry(sequence: u64) -> ActionLogEntry {
    ActionLogEntry {
        id: Uuid::new_v4(),
        sequence,
        timestamp: Utc::now(),
        actor_id: CombatantId::from("hero"),
        actor_name: "Hero".into(),
        action_type: ActionType::EndTurn,
        target_id: None,
        target_name: None,
        result: ActionOutcome {
            success: true,
            damage: None,
            message: "ends turn".into(),
        },
    }
}
