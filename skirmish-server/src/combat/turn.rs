//! Turn Resolver.
//!
//! Pure functions over a session: initiative ordering, who acts next, and
//! whether the combat is over.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use crate::core::rng::DeterministicRng;

use super::events::{CombatEvent, InitiativeEntry};
use super::phase::EndReason;
use super::rules::CombatRules;
use super::state::{CombatSession, Combatant, CombatantId, CombatantStatus};

/// Active combatants sorted by initiative descending, ties by id.
///
/// The result does not depend on input order.
pub fn compute_turn_order<'a>(combatants: impl IntoIterator<Item = &'a Combatant>) -> Vec<CombatantId> {
    let mut active: Vec<&Combatant> = combatants.into_iter().filter(|c| c.is_active()).collect();
    active.sort_by_key(|c| (Reverse(c.initiative), c.id.clone()));
    active.into_iter().map(|c| c.id.clone()).collect()
}

/// Roll initiative for every combatant and build the `INITIATIVE_ROLLED` event.
///
/// Combatants with a fixed score keep it. Rolls happen in id order so the
/// RNG stream is independent of roster order.
pub fn roll_initiative(
    session: &CombatSession,
    fixed: &BTreeMap<CombatantId, i32>,
    rules: &dyn CombatRules,
    rng: &mut DeterministicRng,
) -> CombatEvent {
    let mut rolled: Vec<Combatant> = Vec::with_capacity(session.combatants.len());
    let mut entries = Vec::with_capacity(session.combatants.len());

    for combatant in session.combatants.values() {
        let initiative = match fixed.get(&combatant.id) {
            Some(score) => *score,
            None => rules.roll_initiative(combatant, rng),
        };
        entries.push(InitiativeEntry {
            combatant_id: combatant.id.clone(),
            name: combatant.name.clone(),
            initiative,
        });
        let mut updated = combatant.clone();
        updated.initiative = initiative;
        rolled.push(updated);
    }

    let turn_order = compute_turn_order(&rolled);
    entries.sort_by_key(|e| (Reverse(e.initiative), e.combatant_id.clone()));

    CombatEvent::InitiativeRolled {
        combatants: entries,
        turn_order,
        round: 1,
    }
}

/// Next combatant in this round's order who can still act.
pub fn next_turn_holder(session: &CombatSession) -> Option<CombatantId> {
    let start = session.turn_index.map_or(0, |i| i + 1);
    session
        .turn_order
        .iter()
        .skip(start)
        .find(|id| session.combatant(id).is_some_and(Combatant::is_active))
        .cloned()
}

/// Whether the combat has reached an end condition.
///
/// Defeat is checked before victory, so a mutual wipe counts as a defeat.
pub fn end_condition(session: &CombatSession) -> Option<EndReason> {
    let side_over = |aligned: bool| -> Option<EndReason> {
        let mut side = session
            .combatants
            .values()
            .filter(|c| c.is_player_aligned() == aligned)
            .peekable();
        side.peek()?;
        let mut any_disengaged = false;
        for c in side {
            match c.status {
                CombatantStatus::Active => return None,
                CombatantStatus::Disengaged => any_disengaged = true,
                CombatantStatus::Defeated => {}
            }
        }
        Some(if any_disengaged {
            EndReason::Disengaged
        } else if aligned {
            EndReason::Defeat
        } else {
            EndReason::Victory
        })
    };

    side_over(true).or_else(|| side_over(false))
}

/// End condition at a round boundary, including the round limit.
///
/// `next_round` is the round about to begin.
pub fn end_condition_at_round(
    session: &CombatSession,
    next_round: u32,
    max_rounds: u32,
) -> Option<EndReason> {
    end_condition(session).or_else(|| (next_round > max_rounds).then_some(EndReason::RoundLimit))
}
