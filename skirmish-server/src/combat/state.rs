//! Combat session state.
//!
//! [`CombatSession`] is the aggregate root. The authority owns the canonical
//! instance; mirrors hold copies. Both sides change it only through
//! [`CombatSession::apply_event`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::hash::{digest, Canonical, StateHash, StateHasher, SESSION_DOMAIN};

use super::error::CombatFault;
use super::events::{CombatEvent, StateDelta};
use super::grid::{GridPos, GridSpec};
use super::log::ActionLog;
use super::phase::{CombatPhase, EndReason};
use super::reward::Reward;

// =============================================================================
// IDENTIFIERS
// =============================================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// External identifier of a combat session.
    SessionId
);
string_id!(
    /// Stable identifier of a combatant.
    CombatantId
);
string_id!(
    /// Identifier of a connected observer (a player's client).
    ObserverId
);

impl SessionId {
    /// A fresh random session id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

// =============================================================================
// COMBATANT
// =============================================================================

/// Lifecycle status of a combatant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombatantStatus {
    Active,
    Defeated,
    Disengaged,
}

impl CombatantStatus {
    fn as_u8(self) -> u8 {
        match self {
            CombatantStatus::Active => 0,
            CombatantStatus::Defeated => 1,
            CombatantStatus::Disengaged => 2,
        }
    }
}

/// Condition tag applied by Defend.
pub const CONDITION_DEFENDING: &str = "defending";
/// Condition tag applied by Overwatch.
pub const CONDITION_OVERWATCH: &str = "overwatch";

/// A status condition with an optional duration in rounds.
///
/// Timed conditions count down at every round end and drop off at zero.
/// Untimed conditions stay until removed explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCondition {
    pub tag: String,
    #[serde(default)]
    pub remaining: Option<u32>,
}

impl StatusCondition {
    pub fn timed(tag: impl Into<String>, rounds: u32) -> Self {
        Self {
            tag: tag.into(),
            remaining: Some(rounds),
        }
    }

    pub fn untimed(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            remaining: None,
        }
    }
}

/// Per-turn budgets and combat parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CombatStats {
    pub max_action_points: u32,
    pub max_movement: u32,
    pub attack_power: i32,
    pub defense: i32,
    /// Attack reach in cells.
    pub attack_range: u32,
    pub accuracy: i32,
    pub initiative_bonus: i32,
}

impl Default for CombatStats {
    fn default() -> Self {
        Self {
            max_action_points: 2,
            max_movement: 4,
            attack_power: 5,
            defense: 1,
            attack_range: 1,
            accuracy: 0,
            initiative_bonus: 0,
        }
    }
}

/// One participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Combatant {
    pub id: CombatantId,
    pub name: String,
    pub hp: i32,
    pub hp_max: i32,
    pub position: GridPos,
    pub initiative: i32,
    pub action_points: u32,
    pub movement: u32,
    pub stats: CombatStats,
    pub conditions: Vec<StatusCondition>,
    pub is_player: bool,
    pub is_ally: bool,
    pub status: CombatantStatus,
    /// Observer allowed to act for this combatant. `None` means NPC.
    pub controller: Option<ObserverId>,
    pub inventory: BTreeMap<String, u32>,
    pub ability_charges: BTreeMap<String, u32>,
    /// Paid out when this combatant is defeated on the losing side.
    pub bounty: Reward,
}

impl Combatant {
    pub fn is_active(&self) -> bool {
        self.status == CombatantStatus::Active
    }

    /// Player or ally.
    pub fn is_player_aligned(&self) -> bool {
        self.is_player || self.is_ally
    }

    pub fn is_hostile_to(&self, other: &Combatant) -> bool {
        self.is_player_aligned() != other.is_player_aligned()
    }

    pub fn has_condition(&self, tag: &str) -> bool {
        self.conditions.iter().any(|c| c.tag == tag)
    }

    pub fn is_controlled_by(&self, observer: &ObserverId) -> bool {
        self.controller.as_ref() == Some(observer)
    }

    pub fn item_count(&self, item_ref: &str) -> u32 {
        self.inventory.get(item_ref).copied().unwrap_or(0)
    }

    pub fn charges(&self, ability_ref: &str) -> u32 {
        self.ability_charges.get(ability_ref).copied().unwrap_or(0)
    }

    fn set_status(&mut self, status: CombatantStatus) {
        self.status = status;
        if status != CombatantStatus::Active {
            self.action_points = 0;
            self.movement = 0;
        }
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// The aggregate root for one combat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombatSession {
    pub id: SessionId,
    pub phase: CombatPhase,
    /// 0 until initiative is rolled.
    pub round: u32,
    pub turn_order: Vec<CombatantId>,
    pub active_combatant: Option<CombatantId>,
    /// Index into `turn_order` of the most recent turn this round.
    pub turn_index: Option<usize>,
    pub combatants: BTreeMap<CombatantId, Combatant>,
    pub grid: GridSpec,
    pub action_log: ActionLog,
    pub end_reason: Option<EndReason>,
    pub rewards: Option<Reward>,
}

impl CombatSession {
    /// A session in `INITIALIZING` with the given roster.
    pub fn new(id: SessionId, grid: GridSpec, combatants: Vec<Combatant>) -> Self {
        Self {
            id,
            phase: CombatPhase::Initializing,
            round: 0,
            turn_order: Vec::new(),
            active_combatant: None,
            turn_index: None,
            combatants: combatants.into_iter().map(|c| (c.id.clone(), c)).collect(),
            grid,
            action_log: ActionLog::new(),
            end_reason: None,
            rewards: None,
        }
    }

    pub fn combatant(&self, id: &CombatantId) -> Option<&Combatant> {
        self.combatants.get(id)
    }

    fn combatant_mut(&mut self, id: &CombatantId) -> Result<&mut Combatant, CombatFault> {
        self.combatants
            .get_mut(id)
            .ok_or_else(|| CombatFault::UnknownCombatant(id.clone()))
    }

    /// The current turn holder.
    pub fn active(&self) -> Option<&Combatant> {
        self.active_combatant
            .as_ref()
            .and_then(|id| self.combatants.get(id))
    }

    /// Cells holding an active combatant, optionally excluding one.
    pub fn occupied_cells(&self, except: Option<&CombatantId>) -> BTreeSet<GridPos> {
        self.combatants
            .values()
            .filter(|c| c.is_active() && Some(&c.id) != except)
            .map(|c| c.position)
            .collect()
    }

    pub fn combatant_at(&self, pos: GridPos) -> Option<&Combatant> {
        self.combatants
            .values()
            .find(|c| c.is_active() && c.position == pos)
    }

    fn set_phase(&mut self, next: CombatPhase) -> Result<(), CombatFault> {
        self.phase = self.phase.transition(next)?;
        Ok(())
    }

    /// Apply one event.
    ///
    /// Fails without guarantees about partial application; callers that need
    /// atomicity apply to a copy.
    pub fn apply_event(&mut self, event: &CombatEvent) -> Result<(), CombatFault> {
        match event {
            CombatEvent::InitiativeRolled {
                combatants,
                turn_order,
                round,
            } => {
                self.set_phase(CombatPhase::Active)?;
                for entry in combatants {
                    self.combatant_mut(&entry.combatant_id)?.initiative = entry.initiative;
                }
                self.turn_order = turn_order.clone();
                self.round = *round;
                self.turn_index = None;
                self.active_combatant = None;
            }
            CombatEvent::TurnStart {
                combatant_id,
                action_points,
                movement,
            } => {
                if self.phase == CombatPhase::RoundEnd {
                    self.set_phase(CombatPhase::Active)?;
                } else if self.phase != CombatPhase::Active {
                    return Err(CombatFault::Inconsistent(format!(
                        "turn start in phase {:?}",
                        self.phase
                    )));
                }
                let index = self
                    .turn_order
                    .iter()
                    .position(|id| id == combatant_id)
                    .ok_or_else(|| {
                        CombatFault::Inconsistent(format!("{combatant_id} is not in turn order"))
                    })?;
                let combatant = self.combatant_mut(combatant_id)?;
                if !combatant.is_active() {
                    return Err(CombatFault::Inconsistent(format!(
                        "{combatant_id} cannot take a turn while {:?}",
                        combatant.status
                    )));
                }
                combatant.action_points = *action_points;
                combatant.movement = *movement;
                combatant.conditions.retain(|c| c.tag != CONDITION_OVERWATCH);
                self.active_combatant = Some(combatant_id.clone());
                self.turn_index = Some(index);
            }
            CombatEvent::TurnEnd { combatant_id } => {
                if let Some(active) = &self.active_combatant {
                    if active != combatant_id {
                        return Err(CombatFault::Inconsistent(format!(
                            "turn end for {combatant_id} while {active} holds the turn"
                        )));
                    }
                }
                self.active_combatant = None;
            }
            CombatEvent::ActionResolved(resolved) => {
                if self.phase != CombatPhase::Active {
                    return Err(CombatFault::Inconsistent(format!(
                        "action resolved in phase {:?}",
                        self.phase
                    )));
                }
                self.action_log.append(resolved.entry.clone())?;
                for delta in &resolved.effects {
                    self.apply_delta(delta)?;
                }
            }
            CombatEvent::RoundEnd { round, turn_order } => {
                self.set_phase(CombatPhase::RoundEnd)?;
                if *round != self.round + 1 {
                    return Err(CombatFault::Inconsistent(format!(
                        "round {round} does not follow {}",
                        self.round
                    )));
                }
                self.round = *round;
                self.turn_order = turn_order.clone();
                self.turn_index = None;
                self.active_combatant = None;
                for combatant in self.combatants.values_mut() {
                    combatant.conditions.retain_mut(|c| match c.remaining.as_mut() {
                        Some(rounds) => {
                            *rounds = rounds.saturating_sub(1);
                            *rounds > 0
                        }
                        None => true,
                    });
                }
            }
            CombatEvent::CombatEnd { reason, rewards } => {
                self.set_phase(CombatPhase::CombatEnd)?;
                self.active_combatant = None;
                self.end_reason = Some(*reason);
                self.rewards = rewards.clone();
            }
        }
        Ok(())
    }

    fn apply_delta(&mut self, delta: &StateDelta) -> Result<(), CombatFault> {
        match delta {
            StateDelta::Damage { target, amount } => {
                let combatant = self.combatant_mut(target)?;
                combatant.hp = combatant
                    .hp
                    .saturating_sub((*amount).max(0))
                    .clamp(0, combatant.hp_max);
                if combatant.hp == 0 && combatant.is_active() {
                    combatant.set_status(CombatantStatus::Defeated);
                }
            }
            StateDelta::Heal { target, amount } => {
                let combatant = self.combatant_mut(target)?;
                if combatant.is_active() {
                    combatant.hp = combatant
                        .hp
                        .saturating_add((*amount).max(0))
                        .clamp(0, combatant.hp_max);
                }
            }
            StateDelta::Move { combatant, to } => {
                self.combatant_mut(combatant)?.position = *to;
            }
            StateDelta::SpendActionPoints { combatant, amount } => {
                let c = self.combatant_mut(combatant)?;
                c.action_points = c.action_points.saturating_sub(*amount);
            }
            StateDelta::SpendMovement { combatant, amount } => {
                let c = self.combatant_mut(combatant)?;
                c.movement = c.movement.saturating_sub(*amount);
            }
            StateDelta::RestoreMovement { combatant, amount } => {
                let c = self.combatant_mut(combatant)?;
                c.movement = c.movement.saturating_add(*amount).min(c.stats.max_movement);
            }
            StateDelta::AddCondition {
                combatant,
                condition,
            } => {
                let c = self.combatant_mut(combatant)?;
                c.conditions.retain(|existing| existing.tag != condition.tag);
                c.conditions.push(condition.clone());
            }
            StateDelta::RemoveCondition { combatant, tag } => {
                self.combatant_mut(combatant)?
                    .conditions
                    .retain(|c| &c.tag != tag);
            }
            StateDelta::SetStatus { combatant, status } => {
                self.combatant_mut(combatant)?.set_status(*status);
            }
            StateDelta::ConsumeItem {
                combatant,
                item_ref,
            } => {
                let c = self.combatant_mut(combatant)?;
                consume(&mut c.inventory, item_ref).ok_or_else(|| CombatFault::MissingResource {
                    combatant: combatant.clone(),
                    reference: item_ref.clone(),
                })?;
            }
            StateDelta::ConsumeCharge {
                combatant,
                ability_ref,
            } => {
                let c = self.combatant_mut(combatant)?;
                consume(&mut c.ability_charges, ability_ref).ok_or_else(|| {
                    CombatFault::MissingResource {
                        combatant: combatant.clone(),
                        reference: ability_ref.clone(),
                    }
                })?;
            }
        }

        // The turn holder must always be an active combatant.
        if let Some(active) = &self.active_combatant {
            if !self.combatants.get(active).is_some_and(Combatant::is_active) {
                self.active_combatant = None;
            }
        }
        Ok(())
    }

    /// Deterministic hash of the canonical state.
    ///
    /// Covers everything that affects future resolution. Log entry ids and
    /// timestamps are excluded.
    pub fn compute_hash(&self) -> StateHash {
        digest(SESSION_DOMAIN, self)
    }
}

impl Canonical for CombatantId {
    fn feed(&self, hasher: &mut StateHasher) {
        self.as_str().feed(hasher);
    }
}

impl Canonical for GridPos {
    fn feed(&self, hasher: &mut StateHasher) {
        hasher.write(&self.x).write(&self.y);
    }
}

impl Canonical for StatusCondition {
    fn feed(&self, hasher: &mut StateHasher) {
        hasher.write(&self.tag).write(&self.remaining);
    }
}

impl Canonical for Combatant {
    fn feed(&self, hasher: &mut StateHasher) {
        hasher
            .write(&self.hp)
            .write(&self.hp_max)
            .write(&self.position)
            .write(&self.initiative)
            .write(&self.action_points)
            .write(&self.movement)
            .write(&self.status.as_u8())
            .write(&self.conditions)
            .write(&self.inventory)
            .write(&self.ability_charges);
    }
}

impl Canonical for EndReason {
    fn feed(&self, hasher: &mut StateHasher) {
        self.to_string().feed(hasher);
    }
}

impl Canonical for Reward {
    fn feed(&self, hasher: &mut StateHasher) {
        hasher.write(&self.experience).write(&self.currency).write(&self.items);
    }
}

impl Canonical for CombatSession {
    fn feed(&self, hasher: &mut StateHasher) {
        hasher
            .write(self.id.as_str())
            .write(&self.phase.as_u8())
            .write(&self.round)
            .write(&self.turn_order)
            .write(&self.active_combatant)
            .write(&self.turn_index.map(|i| i as u64))
            .write(&self.combatants)
            .write(&self.end_reason)
            .write(&self.rewards);

        let log = self.action_log.entries();
        hasher.write(&(log.len() as u64));
        for entry in log {
            hasher
                .write(&entry.sequence)
                .write(&entry.actor_id)
                .write(&entry.result.success)
                .write(&entry.result.damage);
        }
    }
}

fn consume(counts: &mut BTreeMap<String, u32>, key: &str) -> Option<()> {
    let count = counts.get_mut(key).filter(|n| **n > 0)?;
    *count -= 1;
    if *count == 0 {
        counts.remove(key);
    }
    Some(())
}

// =============================================================================
// TESTS
// =============================================================================
