//! Built-in policy for combatants without a controlling observer.
//!
//! Attack the nearest legal target in reach, otherwise close distance,
//! otherwise end the turn. Every plan goes through the normal resolver.

use super::action::{check_attack_target, reachable_cells, ActionRequest};
use super::state::{CombatSession, Combatant};

/// Choose the next action for `actor`, the current turn holder.
pub fn plan(session: &CombatSession, actor: &Combatant, friendly_fire: bool) -> ActionRequest {
    let mut hostiles: Vec<&Combatant> = session
        .combatants
        .values()
        .filter(|c| c.is_active() && actor.is_hostile_to(c))
        .collect();
    hostiles.sort_by_key(|c| (actor.position.distance(c.position), c.id.clone()));

    if actor.action_points > 0 {
        let target = hostiles
            .iter()
            .find(|c| check_attack_target(session, actor, &c.id, friendly_fire).is_ok());
        if let Some(target) = target {
            return ActionRequest::attack(target.id.clone());
        }
    }

    if actor.movement > 0 {
        if let Some(nearest) = hostiles.first() {
            let current = actor.position.distance(nearest.position);
            let best = reachable_cells(session, actor)
                .into_iter()
                .map(|(cell, cost)| (cell.distance(nearest.position), cost, cell))
                .min();
            if let Some((distance, _, cell)) = best {
                if distance < current {
                    return ActionRequest::move_to(cell);
                }
            }
        }
    }

    ActionRequest::EndTurn {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combat::grid::{GridPos, GridSpec};
    use crate::combat::phase::CombatPhase;
    use crate::combat::state::fixtures::combatant;
    use crate::combat::state::SessionId;

    fn session_with(actor_pos: (i32, i32), foe_pos: (i32, i32), ap: u32, movement: u32) -> CombatSession {
        let mut orc = combatant("orc", 10, false, actor_pos.0, actor_pos.1);
        orc.action_points = ap;
        orc.movement = movement;
        let mut session = CombatSession::new(
            SessionId::from("npc"),
            GridSpec::open(10, 10),
            vec![orc, combatant("hero", 5, true, foe_pos.0, foe_pos.1)],
        );
        session.phase = CombatPhase::Active;
        session.active_combatant = Some("orc".into());
        session
    }

    fn orc(session: &CombatSession) -> &Combatant {
        &session.combatants[&"orc".into()]
    }

    #[test]
    fn test_attacks_when_in_reach() {
        let session = session_with((2, 2), (3, 3), 1, 4);
        assert_eq!(plan(&session, orc(&session), false), ActionRequest::attack("hero"));
    }

    #[test]
    fn test_closes_distance() {
        let session = session_with((0, 0), (6, 0), 2, 3);
        match plan(&session, orc(&session), false) {
            ActionRequest::Move { x, y } => {
                assert_eq!(GridPos::new(x, y).distance(GridPos::new(6, 0)), 3);
            }
            other => panic!("expected a move, got {other:?}"),
        }
    }

    #[test]
    fn test_ends_turn_when_spent() {
        let session = session_with((0, 0), (6, 0), 0, 0);
        assert_eq!(plan(&session, orc(&session), false), ActionRequest::EndTurn {});

        // In reach but out of action points, already adjacent
        let session = session_with((5, 0), (6, 0), 0, 4);
        assert_eq!(plan(&session, orc(&session), false), ActionRequest::EndTurn {});
    }
}
