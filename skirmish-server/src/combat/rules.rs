//! Pluggable combat rules.
//!
//! Hit chance, damage, initiative and the overwatch trigger are balance
//! parameters, so the engine only talks to them through [`CombatRules`].
//! [`StandardRules`] is the stock implementation driven by [`RulesConfig`].

use serde::{Deserialize, Serialize};

use crate::core::rng::DeterministicRng;

use super::grid::GridPos;
use super::state::{Combatant, CONDITION_DEFENDING};

/// Result of one attack roll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttackRoll {
    pub hit: bool,
    /// Damage to apply; 0 on a miss.
    pub damage: i32,
}

/// Balance rules consulted by the resolvers.
///
/// All randomness must come from the supplied RNG so sessions replay.
pub trait CombatRules: Send + Sync {
    /// Initiative score for a combatant without a fixed score.
    fn roll_initiative(&self, combatant: &Combatant, rng: &mut DeterministicRng) -> i32;

    /// Hit/miss and damage for `attacker` striking `defender`.
    fn resolve_attack(
        &self,
        attacker: &Combatant,
        defender: &Combatant,
        rng: &mut DeterministicRng,
    ) -> AttackRoll;

    /// Whether combatants may attack their own side.
    fn friendly_fire(&self) -> bool {
        false
    }

    /// Whether `watcher` on overwatch reacts to `mover` stepping from `from`
    /// to `to`.
    ///
    /// Default: the mover enters the watcher's attack range from outside it.
    fn overwatch_triggers(
        &self,
        watcher: &Combatant,
        mover: &Combatant,
        from: GridPos,
        to: GridPos,
    ) -> bool {
        let range = watcher.stats.attack_range;
        watcher.is_hostile_to(mover)
            && watcher.position.distance(from) > range
            && watcher.position.distance(to) <= range
    }
}

/// Parameters for [`StandardRules`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RulesConfig {
    /// Hit chance in percent when accuracy equals defense.
    pub base_hit_chance: u32,
    /// Percent added per point of accuracy over defense.
    pub accuracy_step: i32,
    pub min_hit_chance: u32,
    pub max_hit_chance: u32,
    /// Damage varies uniformly by up to this much either way.
    pub damage_variance: i32,
    /// Damage against a defending target is divided by this.
    pub defend_divisor: i32,
    pub friendly_fire: bool,
    /// Faces on the initiative die.
    pub initiative_die: u32,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            base_hit_chance: 75,
            accuracy_step: 5,
            min_hit_chance: 5,
            max_hit_chance: 95,
            damage_variance: 2,
            defend_divisor: 2,
            friendly_fire: false,
            initiative_die: 20,
        }
    }
}

impl RulesConfig {
    /// Every attack hits for exactly `attack_power - defense` (minimum 1).
    pub fn always_hit() -> Self {
        Self {
            min_hit_chance: 100,
            max_hit_chance: 100,
            damage_variance: 0,
            ..Self::default()
        }
    }
}

/// Stock rules: percentile hit check, flat damage with variance.
#[derive(Debug, Clone, Default)]
pub struct StandardRules {
    config: RulesConfig,
}

impl StandardRules {
    pub fn new(config: RulesConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RulesConfig {
        &self.config
    }

    /// Hit chance in percent, clamped to the configured bounds.
    ///
    /// Roster stats are untrusted input, so the arithmetic saturates.
    pub fn hit_chance(&self, attacker: &Combatant, defender: &Combatant) -> u32 {
        let edge = attacker
            .stats
            .accuracy
            .saturating_sub(defender.stats.defense)
            .saturating_mul(self.config.accuracy_step);
        let base = i32::try_from(self.config.base_hit_chance).unwrap_or(i32::MAX);
        let chance = base.saturating_add(edge).max(0) as u32;
        chance.clamp(self.config.min_hit_chance, self.config.max_hit_chance.max(self.config.min_hit_chance))
    }
}

impl CombatRules for StandardRules {
    fn roll_initiative(&self, combatant: &Combatant, rng: &mut DeterministicRng) -> i32 {
        rng.roll_die(self.config.initiative_die)
            .saturating_add(combatant.stats.initiative_bonus)
    }

    fn resolve_attack(
        &self,
        attacker: &Combatant,
        defender: &Combatant,
        rng: &mut DeterministicRng,
    ) -> AttackRoll {
        if !rng.chance(self.hit_chance(attacker, defender)) {
            return AttackRoll {
                hit: false,
                damage: 0,
            };
        }

        let variance = self.config.damage_variance.max(0);
        let spread = rng.between(-variance, variance);
        let mut damage = attacker
            .stats
            .attack_power
            .saturating_sub(defender.stats.defense)
            .saturating_add(spread)
            .max(1);
        if defender.has_condition(CONDITION_DEFENDING) {
            damage = (damage / self.config.defend_divisor.max(1)).max(1);
        }

        AttackRoll { hit: true, damage }
    }

    fn friendly_fire(&self) -> bool {
        self.config.friendly_fire
    }
}
