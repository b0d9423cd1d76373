//! Action Resolver.
//!
//! [`resolve`] validates a proposed action against the session and returns
//! the log outcome plus the deltas to apply. It never mutates the session;
//! the engine applies the deltas through the shared event path.
//!
//! Validation order: phase, turn holder, resources, then target or cell
//! legality.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::rng::DeterministicRng;

use super::content::{ContentCatalog, Effect, EffectDefinition, EffectTarget};
use super::error::ActionError;
use super::events::StateDelta;
use super::grid::GridPos;
use super::log::{ActionOutcome, ActionType};
use super::phase::CombatPhase;
use super::rules::CombatRules;
use super::state::{
    CombatSession, Combatant, CombatantId, CombatantStatus, StatusCondition, CONDITION_DEFENDING,
    CONDITION_OVERWATCH,
};

// =============================================================================
// REQUESTS
// =============================================================================

/// A command as submitted on the wire: `{type, payload}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ActionRequest {
    Move {
        x: i32,
        y: i32,
    },
    Attack {
        target_id: CombatantId,
    },
    Defend {},
    UseItem {
        item_ref: String,
        #[serde(default)]
        target_id: Option<CombatantId>,
    },
    UseAbility {
        ability_ref: String,
        #[serde(default)]
        target_id: Option<CombatantId>,
    },
    Disengage {},
    Overwatch {},
    EndTurn {},
}

impl ActionRequest {
    /// Every command `type` accepted on the wire.
    pub const TYPE_NAMES: [&'static str; 8] = [
        "MOVE",
        "ATTACK",
        "DEFEND",
        "USE_ITEM",
        "USE_ABILITY",
        "DISENGAGE",
        "OVERWATCH",
        "END_TURN",
    ];

    pub fn action_type(&self) -> ActionType {
        match self {
            ActionRequest::Move { .. } => ActionType::Move,
            ActionRequest::Attack { .. } => ActionType::Attack,
            ActionRequest::Defend {} => ActionType::Defend,
            ActionRequest::UseItem { .. } => ActionType::UseItem,
            ActionRequest::UseAbility { .. } => ActionType::UseAbility,
            ActionRequest::Disengage {} => ActionType::Disengage,
            ActionRequest::Overwatch {} => ActionType::Overwatch,
            ActionRequest::EndTurn {} => ActionType::EndTurn,
        }
    }

    pub fn move_to(pos: GridPos) -> Self {
        ActionRequest::Move { x: pos.x, y: pos.y }
    }

    pub fn attack(target: impl Into<CombatantId>) -> Self {
        ActionRequest::Attack {
            target_id: target.into(),
        }
    }
}

// =============================================================================
// RESOLUTION
// =============================================================================

/// Validated outcome of one action, not yet applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub action_type: ActionType,
    pub target: Option<CombatantId>,
    pub outcome: ActionOutcome,
    pub effects: Vec<StateDelta>,
    /// Turn ends regardless of remaining resources.
    pub ends_turn: bool,
}

impl Resolution {
    fn new(action_type: ActionType, message: String) -> Self {
        Self {
            action_type,
            target: None,
            outcome: ActionOutcome {
                success: true,
                damage: None,
                message,
            },
            effects: Vec::new(),
            ends_turn: false,
        }
    }
}

/// Collaborators the resolver consults.
#[derive(Clone, Copy)]
pub struct ResolveContext<'a> {
    pub rules: &'a dyn CombatRules,
    pub content: &'a dyn ContentCatalog,
}

/// Validate and resolve `request` for `actor_id`.
pub fn resolve(
    session: &CombatSession,
    actor_id: &CombatantId,
    request: &ActionRequest,
    ctx: ResolveContext<'_>,
    rng: &mut DeterministicRng,
) -> Result<Resolution, ActionError> {
    let actor = check_turn(session, actor_id)?;

    match request {
        ActionRequest::Attack { target_id } => resolve_attack(session, actor, target_id, ctx, rng),
        ActionRequest::Defend {} => {
            require_action_point(actor)?;
            let mut resolution =
                Resolution::new(ActionType::Defend, format!("{} takes a defensive stance", actor.name));
            resolution.effects = vec![
                spend_ap(actor, 1),
                StateDelta::AddCondition {
                    combatant: actor.id.clone(),
                    condition: StatusCondition::timed(CONDITION_DEFENDING, 1),
                },
            ];
            Ok(resolution)
        }
        ActionRequest::Move { x, y } => {
            let dest = GridPos::new(*x, *y);
            let cost = check_move(session, actor, dest)?;
            let mut resolution =
                Resolution::new(ActionType::Move, format!("{} moves to {}", actor.name, dest));
            resolution.effects = vec![
                StateDelta::Move {
                    combatant: actor.id.clone(),
                    to: dest,
                },
                StateDelta::SpendMovement {
                    combatant: actor.id.clone(),
                    amount: cost,
                },
            ];
            Ok(resolution)
        }
        ActionRequest::UseItem {
            item_ref,
            target_id,
        } => {
            require_action_point(actor)?;
            if actor.item_count(item_ref) == 0 {
                return Err(ActionError::InsufficientResources(format!(
                    "{} has no {}",
                    actor.name, item_ref
                )));
            }
            let definition = ctx
                .content
                .item(item_ref)
                .map_err(|e| ActionError::ContentUnavailable(e.to_string()))?;
            let consume = StateDelta::ConsumeItem {
                combatant: actor.id.clone(),
                item_ref: item_ref.clone(),
            };
            resolve_effect(session, actor, ActionType::UseItem, &definition, target_id.as_ref(), consume)
        }
        ActionRequest::UseAbility {
            ability_ref,
            target_id,
        } => {
            require_action_point(actor)?;
            if actor.charges(ability_ref) == 0 {
                return Err(ActionError::InsufficientResources(format!(
                    "{} has no charges of {}",
                    actor.name, ability_ref
                )));
            }
            let definition = ctx
                .content
                .ability(ability_ref)
                .map_err(|e| ActionError::ContentUnavailable(e.to_string()))?;
            let consume = StateDelta::ConsumeCharge {
                combatant: actor.id.clone(),
                ability_ref: ability_ref.clone(),
            };
            resolve_effect(
                session,
                actor,
                ActionType::UseAbility,
                &definition,
                target_id.as_ref(),
                consume,
            )
        }
        ActionRequest::Disengage {} => {
            require_action_point(actor)?;
            let mut resolution =
                Resolution::new(ActionType::Disengage, format!("{} disengages", actor.name));
            resolution.effects = vec![
                spend_ap(actor, actor.action_points),
                StateDelta::SetStatus {
                    combatant: actor.id.clone(),
                    status: CombatantStatus::Disengaged,
                },
            ];
            resolution.ends_turn = true;
            Ok(resolution)
        }
        ActionRequest::Overwatch {} => {
            require_action_point(actor)?;
            let mut resolution =
                Resolution::new(ActionType::Overwatch, format!("{} stands overwatch", actor.name));
            resolution.effects = vec![
                spend_ap(actor, actor.action_points),
                StateDelta::SpendMovement {
                    combatant: actor.id.clone(),
                    amount: actor.movement,
                },
                StateDelta::AddCondition {
                    combatant: actor.id.clone(),
                    condition: StatusCondition::untimed(CONDITION_OVERWATCH),
                },
            ];
            resolution.ends_turn = true;
            Ok(resolution)
        }
        ActionRequest::EndTurn {} => {
            let mut resolution =
                Resolution::new(ActionType::EndTurn, format!("{} ends their turn", actor.name));
            resolution.ends_turn = true;
            Ok(resolution)
        }
    }
}

/// Phase and turn-holder checks shared by every action.
pub fn check_turn<'s>(
    session: &'s CombatSession,
    actor_id: &CombatantId,
) -> Result<&'s Combatant, ActionError> {
    if session.phase != CombatPhase::Active {
        return Err(ActionError::SessionNotActive(session.phase));
    }
    let not_your_turn = || ActionError::NotYourTurn {
        actor: actor_id.to_string(),
    };
    if session.active_combatant.as_ref() != Some(actor_id) {
        return Err(not_your_turn());
    }
    session
        .combatant(actor_id)
        .filter(|c| c.is_active())
        .ok_or_else(not_your_turn)
}

/// Whether `actor` may attack `target_id` from where it stands.
pub fn check_attack_target<'s>(
    session: &'s CombatSession,
    actor: &Combatant,
    target_id: &CombatantId,
    friendly_fire: bool,
) -> Result<&'s Combatant, ActionError> {
    let target = session
        .combatant(target_id)
        .ok_or_else(|| ActionError::InvalidTarget(format!("unknown combatant {target_id}")))?;

    if target.id == actor.id {
        return Err(ActionError::InvalidTarget(format!("{} cannot attack itself", actor.name)));
    }
    if !target.is_active() {
        return Err(ActionError::InvalidTarget(format!(
            "{} is {:?}",
            target.name, target.status
        )));
    }
    if !friendly_fire && !actor.is_hostile_to(target) {
        return Err(ActionError::InvalidTarget(format!(
            "{} is on the same side",
            target.name
        )));
    }
    let distance = actor.position.distance(target.position);
    if distance > actor.stats.attack_range {
        return Err(ActionError::InvalidTarget(format!(
            "{} is out of range ({} > {})",
            target.name, distance, actor.stats.attack_range
        )));
    }
    Ok(target)
}

/// Cells `actor` can reach with its remaining movement, with path costs.
///
/// The actor's own cell is excluded.
pub fn reachable_cells(session: &CombatSession, actor: &Combatant) -> BTreeMap<GridPos, u32> {
    let occupied = session.occupied_cells(Some(&actor.id));
    let mut costs = session
        .grid
        .path_costs(actor.position, &occupied, actor.movement);
    costs.remove(&actor.position);
    costs
}

/// Path cost of moving `actor` to `dest`.
pub fn check_move(
    session: &CombatSession,
    actor: &Combatant,
    dest: GridPos,
) -> Result<u32, ActionError> {
    if actor.movement == 0 {
        return Err(ActionError::InsufficientResources(format!(
            "{} has no movement remaining",
            actor.name
        )));
    }
    if !session.grid.in_bounds(dest) {
        return Err(ActionError::InvalidCell(format!("{dest} is off the grid")));
    }
    if session.grid.blocked.contains(&dest) {
        return Err(ActionError::InvalidCell(format!("{dest} is blocked")));
    }
    if dest == actor.position {
        return Err(ActionError::InvalidCell(format!("{} is already at {dest}", actor.name)));
    }
    if let Some(occupant) = session.combatant_at(dest) {
        return Err(ActionError::InvalidCell(format!(
            "{dest} is occupied by {}",
            occupant.name
        )));
    }

    reachable_cells(session, actor)
        .get(&dest)
        .copied()
        .ok_or_else(|| ActionError::InvalidCell(format!("{dest} is out of movement range")))
}

fn require_action_point(actor: &Combatant) -> Result<(), ActionError> {
    if actor.action_points == 0 {
        return Err(ActionError::InsufficientResources(format!(
            "{} has no action points remaining",
            actor.name
        )));
    }
    Ok(())
}

fn spend_ap(actor: &Combatant, amount: u32) -> StateDelta {
    StateDelta::SpendActionPoints {
        combatant: actor.id.clone(),
        amount,
    }
}

fn resolve_attack(
    session: &CombatSession,
    actor: &Combatant,
    target_id: &CombatantId,
    ctx: ResolveContext<'_>,
    rng: &mut DeterministicRng,
) -> Result<Resolution, ActionError> {
    require_action_point(actor)?;
    let target = check_attack_target(session, actor, target_id, ctx.rules.friendly_fire())?;
    let roll = ctx.rules.resolve_attack(actor, target, rng);

    let message = if !roll.hit {
        format!("{} misses {}", actor.name, target.name)
    } else if roll.damage >= target.hp {
        format!(
            "{} hits {} for {} damage; {} is defeated",
            actor.name, target.name, roll.damage, target.name
        )
    } else {
        format!("{} hits {} for {} damage", actor.name, target.name, roll.damage)
    };

    let mut resolution = Resolution::new(ActionType::Attack, message);
    resolution.target = Some(target.id.clone());
    resolution.outcome.success = roll.hit;
    resolution.effects.push(spend_ap(actor, 1));
    if roll.hit {
        resolution.outcome.damage = Some(roll.damage);
        resolution.effects.push(StateDelta::Damage {
            target: target.id.clone(),
            amount: roll.damage,
        });
    }
    Ok(resolution)
}

fn resolve_effect(
    session: &CombatSession,
    actor: &Combatant,
    action_type: ActionType,
    definition: &EffectDefinition,
    target_id: Option<&CombatantId>,
    consume: StateDelta,
) -> Result<Resolution, ActionError> {
    let target = match definition.target {
        EffectTarget::SelfOnly => {
            if target_id.is_some_and(|id| *id != actor.id) {
                return Err(ActionError::InvalidTarget(format!(
                    "{} can only be used on oneself",
                    definition.name
                )));
            }
            actor
        }
        EffectTarget::Ally | EffectTarget::Enemy => {
            let id = match (target_id, definition.target) {
                (Some(id), _) => id,
                (None, EffectTarget::Ally) => &actor.id,
                (None, _) => {
                    return Err(ActionError::InvalidTarget(format!(
                        "{} needs a target",
                        definition.name
                    )))
                }
            };
            let target = session
                .combatant(id)
                .filter(|c| c.is_active())
                .ok_or_else(|| ActionError::InvalidTarget(format!("{id} cannot be targeted")))?;
            let wants_hostile = definition.target == EffectTarget::Enemy;
            if actor.is_hostile_to(target) != wants_hostile {
                return Err(ActionError::InvalidTarget(format!(
                    "{} cannot be used on {}",
                    definition.name, target.name
                )));
            }
            if actor.position.distance(target.position) > definition.range {
                return Err(ActionError::InvalidTarget(format!(
                    "{} is out of range of {}",
                    target.name, definition.name
                )));
            }
            target
        }
    };

    let mut resolution = Resolution::new(
        action_type,
        format!("{} uses {} on {}", actor.name, definition.name, target.name),
    );
    resolution.target = Some(target.id.clone());
    resolution.effects.push(spend_ap(actor, 1));
    resolution.effects.push(consume);

    let mut total_damage = 0;
    for effect in &definition.effects {
        let delta = match effect {
            Effect::Heal { amount } => StateDelta::Heal {
                target: target.id.clone(),
                amount: *amount,
            },
            Effect::Damage { amount } => {
                total_damage += *amount;
                StateDelta::Damage {
                    target: target.id.clone(),
                    amount: *amount,
                }
            }
            Effect::Condition { tag, rounds } => StateDelta::AddCondition {
                combatant: target.id.clone(),
                condition: StatusCondition {
                    tag: tag.clone(),
                    remaining: *rounds,
                },
            },
            Effect::RestoreMovement { amount } => StateDelta::RestoreMovement {
                combatant: target.id.clone(),
                amount: *amount,
            },
        };
        resolution.effects.push(delta);
    }
    if total_damage > 0 {
        resolution.outcome.damage = Some(total_damage);
    }
    Ok(resolution)
}

// =============================================================================
// TESTS
// =============================================================================
