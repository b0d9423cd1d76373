//! Encounter input: the roster and grid an external trigger hands over.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::error::CombatFault;
use super::grid::{GridPos, GridSpec};
use super::reward::Reward;
use super::state::{
    CombatSession, CombatStats, Combatant, CombatantId, CombatantStatus, ObserverId, SessionId,
};

/// Initial stats for one combatant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub id: CombatantId,
    pub name: String,
    pub hp: i32,
    #[serde(default)]
    pub hp_max: Option<i32>,
    pub position: GridPos,
    /// Fixed initiative; rolled when absent.
    #[serde(default)]
    pub initiative: Option<i32>,
    #[serde(default)]
    pub stats: CombatStats,
    #[serde(default)]
    pub is_player: bool,
    #[serde(default)]
    pub is_ally: bool,
    #[serde(default)]
    pub controller: Option<ObserverId>,
    #[serde(default)]
    pub inventory: BTreeMap<String, u32>,
    #[serde(default)]
    pub ability_charges: BTreeMap<String, u32>,
    #[serde(default)]
    pub bounty: Reward,
}

impl RosterEntry {
    pub fn new(id: impl Into<String>, name: impl Into<String>, hp: i32, position: GridPos) -> Self {
        Self {
            id: CombatantId::new(id),
            name: name.into(),
            hp,
            hp_max: None,
            position,
            initiative: None,
            stats: CombatStats::default(),
            is_player: false,
            is_ally: false,
            controller: None,
            inventory: BTreeMap::new(),
            ability_charges: BTreeMap::new(),
            bounty: Reward::default(),
        }
    }

    /// A player character driven by `observer`.
    pub fn player(mut self, observer: impl Into<String>) -> Self {
        self.is_player = true;
        self.controller = Some(ObserverId::new(observer));
        self
    }

    pub fn ally(mut self) -> Self {
        self.is_ally = true;
        self
    }

    pub fn controlled_by(mut self, observer: impl Into<String>) -> Self {
        self.controller = Some(ObserverId::new(observer));
        self
    }

    pub fn initiative(mut self, initiative: i32) -> Self {
        self.initiative = Some(initiative);
        self
    }

    pub fn stats(mut self, stats: CombatStats) -> Self {
        self.stats = stats;
        self
    }

    pub fn hp_max(mut self, hp_max: i32) -> Self {
        self.hp_max = Some(hp_max);
        self
    }

    pub fn item(mut self, item_ref: impl Into<String>, count: u32) -> Self {
        self.inventory.insert(item_ref.into(), count);
        self
    }

    pub fn ability(mut self, ability_ref: impl Into<String>, charges: u32) -> Self {
        self.ability_charges.insert(ability_ref.into(), charges);
        self
    }

    pub fn bounty(mut self, bounty: Reward) -> Self {
        self.bounty = bounty;
        self
    }

    fn into_combatant(self) -> Combatant {
        Combatant {
            hp_max: self.hp_max.unwrap_or(self.hp),
            id: self.id,
            name: self.name,
            hp: self.hp,
            position: self.position,
            initiative: self.initiative.unwrap_or(0),
            action_points: 0,
            movement: 0,
            stats: self.stats,
            conditions: Vec::new(),
            is_player: self.is_player,
            is_ally: self.is_ally,
            status: CombatantStatus::Active,
            controller: self.controller,
            inventory: self.inventory.into_iter().filter(|(_, n)| *n > 0).collect(),
            ability_charges: self
                .ability_charges
                .into_iter()
                .filter(|(_, n)| *n > 0)
                .collect(),
            bounty: self.bounty,
        }
    }
}

/// Everything needed to create a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncounterSpec {
    /// Generated when absent.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub roster: Vec<RosterEntry>,
    #[serde(default)]
    pub grid: GridSpec,
    /// Derived from the session id and roster when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl EncounterSpec {
    pub fn new(grid: GridSpec, roster: Vec<RosterEntry>) -> Self {
        Self {
            session_id: None,
            roster,
            grid,
            seed: None,
        }
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(SessionId::new(id));
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Check the roster against the grid.
    pub fn validate(&self) -> Result<(), CombatFault> {
        let invalid = |msg: String| Err(CombatFault::InvalidRoster(msg));

        if self.grid.width <= 0 || self.grid.height <= 0 {
            return invalid(format!("grid {}x{} is empty", self.grid.width, self.grid.height));
        }
        if self.roster.is_empty() {
            return invalid("roster is empty".into());
        }

        let mut ids = BTreeSet::new();
        let mut cells = BTreeSet::new();
        for entry in &self.roster {
            if entry.id.as_str().is_empty() {
                return invalid("combatant with empty id".into());
            }
            if !ids.insert(&entry.id) {
                return invalid(format!("duplicate combatant id {}", entry.id));
            }
            let hp_max = entry.hp_max.unwrap_or(entry.hp);
            if entry.hp <= 0 || entry.hp > hp_max {
                return invalid(format!("{} has hp {} of {}", entry.id, entry.hp, hp_max));
            }
            if !self.grid.is_walkable(entry.position) {
                return invalid(format!("{} starts on unusable cell {}", entry.id, entry.position));
            }
            if !cells.insert(entry.position) {
                return invalid(format!("{} shares cell {}", entry.id, entry.position));
            }
        }

        let aligned = self.roster.iter().filter(|e| e.is_player || e.is_ally).count();
        if aligned == 0 || aligned == self.roster.len() {
            return invalid("roster needs combatants on both sides".into());
        }
        Ok(())
    }

    /// Validate and split into the initial session and the fixed initiatives.
    pub fn into_session(self) -> Result<(CombatSession, BTreeMap<CombatantId, i32>), CombatFault> {
        self.validate()?;
        let id = self.session_id.unwrap_or_else(SessionId::generate);

        let fixed: BTreeMap<CombatantId, i32> = self
            .roster
            .iter()
            .filter_map(|e| e.initiative.map(|i| (e.id.clone(), i)))
            .collect();
        let combatants = self
            .roster
            .into_iter()
            .map(RosterEntry::into_combatant)
            .collect();

        Ok((CombatSession::new(id, self.grid, combatants), fixed))
    }
}
