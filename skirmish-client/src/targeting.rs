//! Grid/Targeting helper.
//!
//! Derives input affordances (where the active combatant can move, what it
//! can attack or use an effect on) from mirrored state. Results are advisory:
//! the authority validates every command again with the same checks.

use std::collections::BTreeMap;

use skirmish::combat::action::{check_attack_target, reachable_cells as path_reach};
use skirmish::combat::content::{EffectDefinition, EffectTarget};
use skirmish::combat::grid::GridPos;
use skirmish::combat::phase::CombatPhase;
use skirmish::combat::state::{CombatSession, Combatant, CombatantId, ObserverId};

/// What the observer's combatant can do right now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Affordances {
    pub actor: Option<CombatantId>,
    /// Destination cells with their movement cost.
    pub reachable: BTreeMap<GridPos, u32>,
    pub attack_targets: Vec<CombatantId>,
    pub action_points: u32,
}

/// The combatant whose turn it is, if it is active and the session accepts
/// actions.
pub fn acting_combatant(session: &CombatSession) -> Option<&Combatant> {
    if session.phase != CombatPhase::Active {
        return None;
    }
    session
        .active_combatant
        .as_ref()
        .and_then(|id| session.combatant(id))
        .filter(|c| c.is_active())
}

fn acting<'s>(session: &'s CombatSession, actor_id: &CombatantId) -> Option<&'s Combatant> {
    acting_combatant(session).filter(|c| c.id == *actor_id)
}

/// Affordances for `observer`, empty unless it controls the acting combatant.
pub fn affordances(session: &CombatSession, observer: &ObserverId, friendly_fire: bool) -> Affordances {
    let Some(actor) = acting_combatant(session).filter(|c| c.is_controlled_by(observer)) else {
        return Affordances::default();
    };
    Affordances {
        actor: Some(actor.id.clone()),
        reachable: reachable_cells(session, &actor.id),
        attack_targets: attack_targets(session, &actor.id, friendly_fire),
        action_points: actor.action_points,
    }
}

/// Cells the combatant can move to this turn, keyed to path cost.
pub fn reachable_cells(session: &CombatSession, actor_id: &CombatantId) -> BTreeMap<GridPos, u32> {
    match acting(session, actor_id) {
        Some(actor) if actor.movement > 0 => path_reach(session, actor),
        _ => BTreeMap::new(),
    }
}

/// Combatants the actor could attack from where it stands, nearest first.
pub fn attack_targets(session: &CombatSession, actor_id: &CombatantId, friendly_fire: bool) -> Vec<CombatantId> {
    let Some(actor) = acting(session, actor_id).filter(|c| c.action_points > 0) else {
        return Vec::new();
    };
    let mut targets: Vec<&Combatant> = session
        .combatants
        .keys()
        .filter_map(|id| check_attack_target(session, actor, id, friendly_fire).ok())
        .collect();
    targets.sort_by_key(|c| (actor.position.distance(c.position), c.id.clone()));
    targets.into_iter().map(|c| c.id.clone()).collect()
}

/// Combatants an item or ability could be used on.
pub fn effect_targets(
    session: &CombatSession,
    actor_id: &CombatantId,
    definition: &EffectDefinition,
) -> Vec<CombatantId> {
    let Some(actor) = acting(session, actor_id).filter(|c| c.action_points > 0) else {
        return Vec::new();
    };
    match definition.target {
        EffectTarget::SelfOnly => vec![actor.id.clone()],
        EffectTarget::Ally | EffectTarget::Enemy => {
            let wants_hostile = definition.target == EffectTarget::Enemy;
            session
                .combatants
                .values()
                .filter(|c| c.is_active())
                .filter(|c| actor.is_hostile_to(c) == wants_hostile)
                .filter(|c| actor.position.distance(c.position) <= definition.range)
                .map(|c| c.id.clone())
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use skirmish::combat::action::ActionRequest;
    use skirmish::combat::content::{ContentCatalog, ContentTable};
    use skirmish::combat::engine::{CombatEngine, EngineOptions};
    use skirmish::combat::grid::GridSpec;
    use skirmish::combat::roster::{EncounterSpec, RosterEntry};
    use skirmish::combat::rules::{RulesConfig, StandardRules};

    fn started() -> CombatEngine {
        let spec = EncounterSpec::new(
            GridSpec::open(10, 10).with_blocked([GridPos::new(1, 1)]),
            vec![
                RosterEntry::new("hero", "Hero", 20, GridPos::new(2, 2)).player("p1").initiative(20),
                RosterEntry::new("cleric", "Cleric", 12, GridPos::new(2, 3)).ally().initiative(5),
                RosterEntry::new("goblin", "Goblin", 8, GridPos::new(3, 2)).initiative(10),
                RosterEntry::new("ogre", "Ogre", 30, GridPos::new(9, 9)).initiative(1),
            ],
        )
        .with_session_id("targeting")
        .with_seed(3);
        let mut engine = CombatEngine::new(
            spec,
            Arc::new(StandardRules::new(RulesConfig::default())),
            Arc::new(ContentTable::starter()),
            EngineOptions::default(),
        )
        .unwrap();
        engine.start().unwrap();
        engine
    }

    #[test]
    fn test_affordances_only_for_controller() {
        let engine = started();
        let session = engine.session();

        let mine = affordances(session, &ObserverId::new("p1"), false);
        assert_eq!(mine.actor, Some(CombatantId::new("hero")));
        assert_eq!(mine.attack_targets, vec![CombatantId::new("goblin")]);
        assert!(mine.action_points > 0);

        let theirs = affordances(session, &ObserverId::new("p2"), false);
        assert_eq!(theirs, Affordances::default());
    }

    #[test]
    fn test_reachable_cells_avoid_blocked_and_occupied() {
        let engine = started();
        let cells = reachable_cells(engine.session(), &CombatantId::new("hero"));

        assert!(!cells.is_empty());
        assert!(!cells.contains_key(&GridPos::new(2, 2)));
        assert!(!cells.contains_key(&GridPos::new(1, 1)));
        assert!(!cells.contains_key(&GridPos::new(2, 3)));
        assert!(!cells.contains_key(&GridPos::new(3, 2)));
        assert_eq!(cells.get(&GridPos::new(0, 0)), Some(&3));
        assert!(cells.values().all(|&cost| cost > 0));
    }

    #[test]
    fn test_friendly_fire_widens_attack_targets() {
        let engine = started();
        let hero = CombatantId::new("hero");

        let targets = attack_targets(engine.session(), &hero, true);
        assert_eq!(targets.len(), 2);
        assert!(targets.contains(&CombatantId::new("cleric")));
        assert!(!targets.contains(&CombatantId::new("ogre")));
    }

    #[test]
    fn test_effect_targets_follow_side_and_range() {
        let engine = started();
        let session = engine.session();
        let hero = CombatantId::new("hero");
        let content = ContentTable::starter();

        let potion = content.item("potion").unwrap();
        assert_eq!(effect_targets(session, &hero, &potion), vec![hero.clone()]);

        let rally = content.ability("rally").unwrap();
        let allies = effect_targets(session, &hero, &rally);
        assert!(allies.contains(&hero));
        assert!(allies.contains(&CombatantId::new("cleric")));
        assert!(!allies.contains(&CombatantId::new("goblin")));

        let firebomb = content.item("firebomb").unwrap();
        assert_eq!(effect_targets(session, &hero, &firebomb), vec![CombatantId::new("goblin")]);
    }

    #[test]
    fn test_spent_actor_has_no_targets() {
        let mut engine = started();
        let p1 = ObserverId::new("p1");
        engine.submit(&p1, &ActionRequest::EndTurn {}).unwrap();

        let hero = CombatantId::new("hero");
        assert!(attack_targets(engine.session(), &hero, false).is_empty());
        assert!(reachable_cells(engine.session(), &hero).is_empty());
        assert_eq!(affordances(engine.session(), &p1, false), Affordances::default());
    }
}
