//! Combat engine.
//!
//! Synchronous core of a session authority. Every command runs as a
//! transaction against a copy of the session and RNG: the copy is committed
//! when the command succeeds, discarded when it is rejected, and a fault
//! concludes the untouched session with [`EndReason::Fault`]. Observers never
//! see a partially resolved command.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::core::hash::StateHash;
use crate::core::rng::DeterministicRng;

use super::action::{self, check_attack_target, ActionRequest, Resolution, ResolveContext};
use super::content::ContentCatalog;
use super::error::{ActionError, CombatFault};
use super::events::{ActionResolved, CombatEvent, SequencedEvent, StateDelta};
use super::grid::GridPos;
use super::log::{ActionLogEntry, ActionOutcome, ActionType};
use super::npc;
use super::phase::{CombatPhase, EndReason};
use super::reward::{self, Reward};
use super::roster::EncounterSpec;
use super::rules::CombatRules;
use super::state::{CombatSession, CombatantId, ObserverId, SessionId, CONDITION_OVERWATCH};
use super::turn;

/// Engine tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// The session ends with `ROUND_LIMIT` once this many rounds completed.
    pub max_rounds: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self { max_rounds: 50 }
    }
}

/// Full-state payload of `COMBAT_STATE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombatSnapshot {
    #[serde(flatten)]
    pub session: CombatSession,
    /// Sequence number of the newest event reflected in `session`.
    pub last_event_seq: u64,
    /// Hex SHA-256 of the canonical state.
    pub state_hash: String,
}

/// Record of a concluded session, handed to reward delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionArchive {
    pub session_id: SessionId,
    pub reason: EndReason,
    pub rewards: Option<Reward>,
    pub rounds: u32,
    pub log: Vec<ActionLogEntry>,
    pub final_hash: StateHash,
    pub concluded_at: DateTime<Utc>,
}

impl SessionArchive {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

enum TxError {
    Rejected(ActionError),
    Fault(CombatFault),
}

impl From<ActionError> for TxError {
    fn from(err: ActionError) -> Self {
        TxError::Rejected(err)
    }
}

impl From<CombatFault> for TxError {
    fn from(fault: CombatFault) -> Self {
        TxError::Fault(fault)
    }
}

/// Working copy for one command.
struct Transaction<'e> {
    session: CombatSession,
    rng: DeterministicRng,
    events: Vec<CombatEvent>,
    rules: &'e dyn CombatRules,
    content: &'e dyn ContentCatalog,
    max_rounds: u32,
}

impl Transaction<'_> {
    fn emit(&mut self, event: CombatEvent) -> Result<(), CombatFault> {
        self.session.apply_event(&event)?;
        self.events.push(event);
        Ok(())
    }

    fn perform(&mut self, actor_id: &CombatantId, request: &ActionRequest) -> Result<(), TxError> {
        let ctx = ResolveContext {
            rules: self.rules,
            content: self.content,
        };
        let resolution = action::resolve(&self.session, actor_id, request, ctx, &mut self.rng)?;
        let from = self.session.combatant(actor_id).map(|c| c.position);
        let ends_turn = resolution.ends_turn;

        self.record(actor_id, resolution)?;
        if let (ActionRequest::Move { .. }, Some(from)) = (request, from) {
            self.overwatch_reactions(actor_id, from)?;
        }
        self.settle(ends_turn)?;
        Ok(())
    }

    fn record(&mut self, actor_id: &CombatantId, resolution: Resolution) -> Result<(), CombatFault> {
        let actor_name = self
            .session
            .combatant(actor_id)
            .map(|c| c.name.clone())
            .ok_or_else(|| CombatFault::UnknownCombatant(actor_id.clone()))?;
        let target_name = resolution
            .target
            .as_ref()
            .and_then(|id| self.session.combatant(id))
            .map(|c| c.name.clone());

        let entry = ActionLogEntry {
            id: Uuid::new_v4(),
            sequence: self.session.action_log.next_sequence(),
            timestamp: Utc::now(),
            actor_id: actor_id.clone(),
            actor_name,
            action_type: resolution.action_type,
            target_id: resolution.target,
            target_name,
            result: resolution.outcome,
        };
        self.emit(CombatEvent::ActionResolved(ActionResolved {
            entry,
            effects: resolution.effects,
        }))
    }

    /// Watchers fire once each, in id order, until the mover is down.
    fn overwatch_reactions(&mut self, mover_id: &CombatantId, from: GridPos) -> Result<(), CombatFault> {
        let watchers: Vec<CombatantId> = self
            .session
            .combatants
            .values()
            .filter(|c| c.is_active() && c.has_condition(CONDITION_OVERWATCH) && c.id != *mover_id)
            .map(|c| c.id.clone())
            .collect();

        for watcher_id in watchers {
            let shot = {
                let (Some(watcher), Some(mover)) = (
                    self.session.combatant(&watcher_id),
                    self.session.combatant(mover_id),
                ) else {
                    break;
                };
                if !mover.is_active() {
                    break;
                }
                if !watcher.is_active()
                    || !self.rules.overwatch_triggers(watcher, mover, from, mover.position)
                    || check_attack_target(&self.session, watcher, mover_id, self.rules.friendly_fire()).is_err()
                {
                    continue;
                }

                let roll = self.rules.resolve_attack(watcher, mover, &mut self.rng);
                let mut effects = vec![StateDelta::RemoveCondition {
                    combatant: watcher_id.clone(),
                    tag: CONDITION_OVERWATCH.to_string(),
                }];
                let message = if roll.hit {
                    effects.push(StateDelta::Damage {
                        target: mover_id.clone(),
                        amount: roll.damage,
                    });
                    format!(
                        "{} fires on {} from overwatch for {} damage",
                        watcher.name, mover.name, roll.damage
                    )
                } else {
                    format!("{} fires on {} from overwatch and misses", watcher.name, mover.name)
                };
                Resolution {
                    action_type: ActionType::OverwatchShot,
                    target: Some(mover_id.clone()),
                    outcome: ActionOutcome {
                        success: roll.hit,
                        damage: roll.hit.then_some(roll.damage),
                        message,
                    },
                    effects,
                    ends_turn: false,
                }
            };
            self.record(&watcher_id, shot)?;
        }
        Ok(())
    }

    /// After an action: end the combat, or pass the turn when the holder is
    /// done.
    fn settle(&mut self, ends_turn: bool) -> Result<(), CombatFault> {
        if let Some(reason) = turn::end_condition(&self.session) {
            return self.conclude(reason);
        }
        let holder_done = match self.session.active() {
            None => true,
            Some(holder) => ends_turn || (holder.action_points == 0 && holder.movement == 0),
        };
        if holder_done {
            self.end_turn()?;
        }
        Ok(())
    }

    fn end_turn(&mut self) -> Result<(), CombatFault> {
        let current = self
            .session
            .turn_index
            .and_then(|i| self.session.turn_order.get(i))
            .cloned();
        if let Some(combatant_id) = current {
            self.emit(CombatEvent::TurnEnd { combatant_id })?;
        }
        self.advance()
    }

    fn advance(&mut self) -> Result<(), CombatFault> {
        match turn::next_turn_holder(&self.session) {
            Some(id) => self.begin_turn(&id),
            None => self.end_round(),
        }
    }

    fn begin_turn(&mut self, id: &CombatantId) -> Result<(), CombatFault> {
        let stats = self
            .session
            .combatant(id)
            .map(|c| c.stats.clone())
            .ok_or_else(|| CombatFault::UnknownCombatant(id.clone()))?;
        self.emit(CombatEvent::TurnStart {
            combatant_id: id.clone(),
            action_points: stats.max_action_points,
            movement: stats.max_movement,
        })
    }

    fn end_round(&mut self) -> Result<(), CombatFault> {
        let next_round = self.session.round + 1;
        let turn_order = turn::compute_turn_order(self.session.combatants.values());
        self.emit(CombatEvent::RoundEnd {
            round: next_round,
            turn_order,
        })?;

        if let Some(reason) = turn::end_condition_at_round(&self.session, next_round, self.max_rounds) {
            return self.conclude(reason);
        }
        match turn::next_turn_holder(&self.session) {
            Some(id) => self.begin_turn(&id),
            None => Err(CombatFault::Inconsistent(format!(
                "no combatant can act in round {next_round}"
            ))),
        }
    }

    fn conclude(&mut self, reason: EndReason) -> Result<(), CombatFault> {
        let rewards = reward::settle(&self.session, reason);
        self.emit(CombatEvent::CombatEnd { reason, rewards })
    }

    fn start(&mut self, fixed: &BTreeMap<CombatantId, i32>) -> Result<(), CombatFault> {
        let rolled = turn::roll_initiative(&self.session, fixed, self.rules, &mut self.rng);
        self.emit(rolled)?;
        if let Some(reason) = turn::end_condition(&self.session) {
            return self.conclude(reason);
        }
        self.advance()
    }

    fn time_out(&mut self) -> Result<(), TxError> {
        let holder = self
            .session
            .active()
            .filter(|_| self.session.phase == CombatPhase::Active)
            .map(|c| (c.id.clone(), c.name.clone()))
            .ok_or(ActionError::SessionNotActive(self.session.phase))?;

        let resolution = Resolution {
            action_type: ActionType::EndTurn,
            target: None,
            outcome: ActionOutcome {
                success: true,
                damage: None,
                message: format!("{} ran out of time", holder.1),
            },
            effects: Vec::new(),
            ends_turn: true,
        };
        self.record(&holder.0, resolution)?;
        self.settle(true)?;
        Ok(())
    }
}

/// Authoritative state machine for one session.
pub struct CombatEngine {
    session: CombatSession,
    rng: DeterministicRng,
    rules: Arc<dyn CombatRules>,
    content: Arc<dyn ContentCatalog>,
    fixed_initiative: BTreeMap<CombatantId, i32>,
    options: EngineOptions,
    last_event_seq: u64,
}

impl CombatEngine {
    /// Validate the encounter and build a session in `INITIALIZING`.
    pub fn new(
        spec: EncounterSpec,
        rules: Arc<dyn CombatRules>,
        content: Arc<dyn ContentCatalog>,
        options: EngineOptions,
    ) -> Result<Self, CombatFault> {
        let seed = spec.seed;
        let (session, fixed_initiative) = spec.into_session()?;
        let rng = match seed {
            Some(seed) => DeterministicRng::new(seed),
            None => {
                let ids: Vec<&str> = session.combatants.keys().map(CombatantId::as_str).collect();
                DeterministicRng::for_session(session.id.as_str(), &ids)
            }
        };

        Ok(Self {
            session,
            rng,
            rules,
            content,
            fixed_initiative,
            options,
            last_event_seq: 0,
        })
    }

    pub fn session(&self) -> &CombatSession {
        &self.session
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session.id
    }

    pub fn phase(&self) -> CombatPhase {
        self.session.phase
    }

    pub fn is_over(&self) -> bool {
        self.session.phase.is_terminal()
    }

    pub fn last_event_seq(&self) -> u64 {
        self.last_event_seq
    }

    pub fn state_hash(&self) -> StateHash {
        self.session.compute_hash()
    }

    pub fn snapshot(&self) -> CombatSnapshot {
        CombatSnapshot {
            session: self.session.clone(),
            last_event_seq: self.last_event_seq,
            state_hash: hex::encode(self.state_hash()),
        }
    }

    /// Roll initiative and hand the first turn out.
    pub fn start(&mut self) -> Result<Vec<SequencedEvent>, ActionError> {
        if self.session.phase != CombatPhase::Initializing {
            return Err(ActionError::SessionNotActive(self.session.phase));
        }
        let fixed = self.fixed_initiative.clone();
        let events = self.transact(|tx| tx.start(&fixed).map_err(TxError::from))?;
        info!(
            session = %self.session.id,
            order = ?self.session.turn_order,
            "Initiative rolled"
        );
        Ok(events)
    }

    /// Resolve a command from an observer on behalf of the turn holder it
    /// controls.
    pub fn submit(
        &mut self,
        observer: &ObserverId,
        request: &ActionRequest,
    ) -> Result<Vec<SequencedEvent>, ActionError> {
        if self.session.phase != CombatPhase::Active {
            return Err(ActionError::SessionNotActive(self.session.phase));
        }
        let holder = self
            .session
            .active()
            .filter(|c| c.is_controlled_by(observer))
            .map(|c| c.id.clone())
            .ok_or_else(|| ActionError::NotYourTurn {
                actor: observer.to_string(),
            })?;
        self.act(&holder, request)
    }

    /// Resolve an action for a specific combatant.
    pub fn act(
        &mut self,
        actor: &CombatantId,
        request: &ActionRequest,
    ) -> Result<Vec<SequencedEvent>, ActionError> {
        let result = self.transact(|tx| tx.perform(actor, request));
        if let Err(err) = &result {
            debug!(session = %self.session.id, actor = %actor, error = %err, "Action rejected");
        }
        result
    }

    /// The turn holder when it has no controlling observer.
    pub fn npc_turn(&self) -> Option<CombatantId> {
        if self.session.phase != CombatPhase::Active {
            return None;
        }
        self.session
            .active()
            .filter(|c| c.controller.is_none())
            .map(|c| c.id.clone())
    }

    /// Take one action for the NPC holding the turn.
    pub fn step_npc(&mut self) -> Option<Vec<SequencedEvent>> {
        let actor_id = self.npc_turn()?;
        let actor = self.session.combatant(&actor_id)?;
        let request = npc::plan(&self.session, actor, self.rules.friendly_fire());

        match self.act(&actor_id, &request) {
            Ok(events) => Some(events),
            Err(err) => {
                debug!(session = %self.session.id, actor = %actor_id, error = %err, "NPC plan rejected, ending turn");
                self.act(&actor_id, &ActionRequest::EndTurn {}).ok()
            }
        }
    }

    /// Force the turn holder's turn to end (turn timer expiry).
    pub fn force_end_turn(&mut self) -> Result<Vec<SequencedEvent>, ActionError> {
        self.transact(|tx| tx.time_out())
    }

    /// Conclude with `ABORTED`. Empty when the session already ended.
    pub fn abort(&mut self) -> Vec<SequencedEvent> {
        if self.is_over() {
            return Vec::new();
        }
        self.transact(|tx| tx.conclude(EndReason::Aborted).map_err(TxError::from))
            .unwrap_or_default()
    }

    /// Archive record; meaningful once the session is over.
    pub fn archive(&self) -> SessionArchive {
        SessionArchive {
            session_id: self.session.id.clone(),
            reason: self.session.end_reason.unwrap_or(EndReason::Aborted),
            rewards: self.session.rewards.clone(),
            rounds: self.session.round,
            log: self.session.action_log.entries().to_vec(),
            final_hash: self.state_hash(),
            concluded_at: Utc::now(),
        }
    }

    fn transact<F>(&mut self, op: F) -> Result<Vec<SequencedEvent>, ActionError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<(), TxError>,
    {
        let rules = Arc::clone(&self.rules);
        let content = Arc::clone(&self.content);
        let mut tx = Transaction {
            session: self.session.clone(),
            rng: self.rng.clone(),
            events: Vec::new(),
            rules: rules.as_ref(),
            content: content.as_ref(),
            max_rounds: self.options.max_rounds,
        };

        match op(&mut tx) {
            Ok(()) => {
                let Transaction {
                    session,
                    rng,
                    events,
                    ..
                } = tx;
                self.session = session;
                self.rng = rng;
                Ok(self.stamp(events))
            }
            Err(TxError::Rejected(err)) => Err(err),
            Err(TxError::Fault(fault)) => Ok(self.fail(fault)),
        }
    }

    fn fail(&mut self, fault: CombatFault) -> Vec<SequencedEvent> {
        error!(session = %self.session.id, %fault, "Combat fault, ending session");
        if self.is_over() {
            return Vec::new();
        }
        let event = CombatEvent::CombatEnd {
            reason: EndReason::Fault,
            rewards: None,
        };
        match self.session.apply_event(&event) {
            Ok(()) => self.stamp(vec![event]),
            Err(err) => {
                error!(session = %self.session.id, %err, "Could not conclude faulted session");
                Vec::new()
            }
        }
    }

    fn stamp(&mut self, events: Vec<CombatEvent>) -> Vec<SequencedEvent> {
        events
            .into_iter()
            .map(|event| {
                self.last_event_seq += 1;
                SequencedEvent {
                    seq: self.last_event_seq,
                    event,
                }
            })
            .collect()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::combat::content::ContentTable;
    use crate::combat::grid::GridSpec;
    use crate::combat::roster::RosterEntry;
    use crate::combat::rules::{RulesConfig, StandardRules};

    pub fn engine_with(spec: EncounterSpec, rules: RulesConfig) -> CombatEngine {
        CombatEngine::new(
            spec,
            Arc::new(StandardRules::new(rules)),
            Arc::new(ContentTable::starter()),
            EngineOptions::default(),
        )
        .unwrap()
    }

    /// Hero (initiative 15, observer p1) next to a goblin (initiative 10).
    pub fn duel_spec() -> EncounterSpec {
        EncounterSpec::new(
            GridSpec::open(8, 8),
            vec![
                RosterEntry::new("hero", "Hero", 30, GridPos::new(0, 0))
                    .player("p1")
                    .initiative(15),
                RosterEntry::new("goblin", "Goblin", 10, GridPos::new(1, 0))
                    .controlled_by("gm")
                    .initiative(10)
                    .bounty(Reward::new(25, 7).with_item("goblin-ear")),
            ],
        )
        .with_session_id("duel")
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::combat::content::ContentTable;
    use crate::combat::grid::GridSpec;
    use crate::combat::roster::RosterEntry;
    use crate::combat::rules::{RulesConfig, StandardRules};
    use crate::combat::state::{CombatStats, CombatantStatus};
    use proptest::prelude::*;

    fn p1() -> ObserverId {
        ObserverId::from("p1")
    }

    fn types(events: &[SequencedEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.event.type_name()).collect()
    }

    #[test]
    fn test_initiative_and_first_turn() {
        let mut engine = engine_with(duel_spec(), RulesConfig::always_hit());
        let events = engine.start().unwrap();

        assert_eq!(types(&events), vec!["INITIATIVE_ROLLED", "TURN_START"]);
        match &events[0].event {
            CombatEvent::InitiativeRolled { turn_order, .. } => {
                let expected: Vec<CombatantId> = vec!["hero".into(), "goblin".into()];
                assert_eq!(turn_order, &expected);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            events[1].event,
            CombatEvent::TurnStart {
                combatant_id: "hero".into(),
                action_points: 2,
                movement: 4
            }
        );
        assert_eq!(engine.phase(), CombatPhase::Active);
        assert_eq!(engine.session().round, 1);
        assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_action_points_exhaust() {
        let mut spec = duel_spec();
        spec.roster[1].hp = 40;
        spec.roster[1].hp_max = Some(40);
        let mut engine = engine_with(spec, RulesConfig::always_hit());
        engine.start().unwrap();

        let first = engine.submit(&p1(), &ActionRequest::attack("goblin")).unwrap();
        assert_eq!(types(&first), vec!["ACTION_RESULT"]);
        let hero = engine.session().combatant(&"hero".into()).unwrap();
        assert_eq!(hero.action_points, 1);
        let goblin = engine.session().combatant(&"goblin".into()).unwrap();
        assert_eq!(goblin.hp, 40 - 4);

        engine.submit(&p1(), &ActionRequest::attack("goblin")).unwrap();
        let log_len = engine.session().action_log.len();
        let before = engine.session().clone();

        let err = engine.submit(&p1(), &ActionRequest::attack("goblin")).unwrap_err();
        assert_eq!(err.code(), crate::combat::error::ErrorCode::InsufficientResources);
        assert_eq!(engine.session().action_log.len(), log_len);
        assert_eq!(engine.session(), &before);
    }

    #[test]
    fn test_lethal_damage_defeats_and_removes_from_order() {
        let mut spec = EncounterSpec::new(
            GridSpec::open(8, 8),
            vec![
                RosterEntry::new("hero", "Hero", 30, GridPos::new(0, 0))
                    .player("p1")
                    .initiative(20)
                    .stats(CombatStats {
                        attack_power: 15,
                        ..CombatStats::default()
                    }),
                RosterEntry::new("goblin", "Goblin", 10, GridPos::new(1, 0)).initiative(10),
                RosterEntry::new("wolf", "Wolf", 10, GridPos::new(7, 7)).initiative(5),
            ],
        );
        spec.roster[1].stats.defense = 0;
        let mut engine = engine_with(spec, RulesConfig::always_hit());
        engine.start().unwrap();

        engine.submit(&p1(), &ActionRequest::attack("goblin")).unwrap();
        let goblin = engine.session().combatant(&"goblin".into()).unwrap();
        assert_eq!(goblin.hp, 0);
        assert_eq!(goblin.status, CombatantStatus::Defeated);

        let events = engine.submit(&p1(), &ActionRequest::EndTurn {}).unwrap();
        // Goblin is skipped; the wolf (NPC) gets the turn
        assert!(events.iter().any(|e| e.event
            == CombatEvent::TurnStart {
                combatant_id: "wolf".into(),
                action_points: 2,
                movement: 4
            }));

        while engine.step_npc().is_some() {}
        let order = &engine.session().turn_order;
        assert!(!order.contains(&"goblin".into()));
        assert_eq!(engine.session().round, 2);
    }

    #[test]
    fn test_victory_pays_bounty() {
        let mut spec = duel_spec();
        spec.roster[0].stats.attack_power = 20;
        let mut engine = engine_with(spec, RulesConfig::always_hit());
        engine.start().unwrap();

        let events = engine.submit(&p1(), &ActionRequest::attack("goblin")).unwrap();
        assert_eq!(types(&events), vec!["ACTION_RESULT", "COMBAT_END"]);
        assert_eq!(engine.phase(), CombatPhase::CombatEnd);
        assert_eq!(engine.session().end_reason, Some(EndReason::Victory));

        let rewards = engine.session().rewards.clone().unwrap();
        assert_eq!(rewards, Reward::new(25, 7).with_item("goblin-ear"));

        let err = engine.submit(&p1(), &ActionRequest::EndTurn {}).unwrap_err();
        assert_eq!(err, ActionError::SessionNotActive(CombatPhase::CombatEnd));
    }

    #[test]
    fn test_not_your_turn_leaves_state_unchanged() {
        let mut engine = engine_with(duel_spec(), RulesConfig::always_hit());
        engine.start().unwrap();
        let before = engine.snapshot();

        let err = engine
            .submit(&ObserverId::from("gm"), &ActionRequest::attack("hero"))
            .unwrap_err();
        assert!(matches!(err, ActionError::NotYourTurn { .. }));

        let err = engine
            .act(&"goblin".into(), &ActionRequest::attack("hero"))
            .unwrap_err();
        assert!(matches!(err, ActionError::NotYourTurn { .. }));

        assert_eq!(engine.snapshot(), before);
    }

    #[test]
    fn test_round_cycle_increments_once() {
        let mut engine = engine_with(duel_spec(), RulesConfig::always_hit());
        engine.start().unwrap();

        engine.submit(&p1(), &ActionRequest::EndTurn {}).unwrap();
        assert_eq!(engine.session().round, 1);
        let events = engine
            .submit(&ObserverId::from("gm"), &ActionRequest::EndTurn {})
            .unwrap();

        assert_eq!(
            types(&events),
            vec!["ACTION_RESULT", "TURN_END", "ROUND_END", "TURN_START"]
        );
        assert_eq!(engine.session().round, 2);
        assert_eq!(engine.session().active_combatant, Some("hero".into()));
    }

    #[test]
    fn test_spending_everything_ends_turn() {
        let mut spec = duel_spec();
        spec.roster[0].stats.max_action_points = 1;
        spec.roster[0].stats.max_movement = 0;
        spec.roster[1].hp = 30;
        spec.roster[1].hp_max = Some(30);
        let mut engine = engine_with(spec, RulesConfig::always_hit());
        engine.start().unwrap();

        let events = engine.submit(&p1(), &ActionRequest::attack("goblin")).unwrap();
        assert_eq!(types(&events), vec!["ACTION_RESULT", "TURN_END", "TURN_START"]);
        assert_eq!(engine.session().active_combatant, Some("goblin".into()));
    }

    #[test]
    fn test_overwatch_fires_when_entering_range() {
        let spec = EncounterSpec::new(
            GridSpec::open(10, 3),
            vec![
                RosterEntry::new("hero", "Hero", 20, GridPos::new(0, 1))
                    .player("p1")
                    .initiative(5),
                RosterEntry::new("sentry", "Sentry", 20, GridPos::new(6, 1))
                    .controlled_by("gm")
                    .initiative(10)
                    .stats(CombatStats {
                        attack_range: 2,
                        attack_power: 7,
                        ..CombatStats::default()
                    }),
            ],
        );
        let mut engine = engine_with(spec, RulesConfig::always_hit());
        engine.start().unwrap();

        let gm = ObserverId::from("gm");
        let events = engine.submit(&gm, &ActionRequest::Overwatch {}).unwrap();
        assert_eq!(types(&events), vec!["ACTION_RESULT", "TURN_END", "TURN_START"]);

        // Stays outside range: no reaction
        let events = engine.submit(&p1(), &ActionRequest::Move { x: 2, y: 1 }).unwrap();
        assert_eq!(types(&events), vec!["ACTION_RESULT"]);

        // Enters range: one shot
        let events = engine.submit(&p1(), &ActionRequest::Move { x: 4, y: 1 }).unwrap();
        let shots: Vec<_> = events
            .iter()
            .filter_map(|e| e.event.log_entry())
            .filter(|e| e.action_type == ActionType::OverwatchShot)
            .collect();
        assert_eq!(shots.len(), 1);
        assert_eq!(shots[0].result.damage, Some(6));
        let hero = engine.session().combatant(&"hero".into()).unwrap();
        assert_eq!(hero.hp, 14);
        let sentry = engine.session().combatant(&"sentry".into()).unwrap();
        assert!(!sentry.has_condition(CONDITION_OVERWATCH));
    }

    #[test]
    fn test_disengage_ends_combat_when_side_empties() {
        let mut engine = engine_with(duel_spec(), RulesConfig::always_hit());
        engine.start().unwrap();

        let events = engine.submit(&p1(), &ActionRequest::Disengage {}).unwrap();
        assert_eq!(types(&events), vec!["ACTION_RESULT", "COMBAT_END"]);
        assert_eq!(engine.session().end_reason, Some(EndReason::Disengaged));
        assert_eq!(engine.session().rewards, None);
    }

    #[test]
    fn test_timeout_forces_end_turn() {
        let mut engine = engine_with(duel_spec(), RulesConfig::always_hit());
        engine.start().unwrap();

        let events = engine.force_end_turn().unwrap();
        assert_eq!(types(&events), vec!["ACTION_RESULT", "TURN_END", "TURN_START"]);
        let entry = events[0].event.log_entry().unwrap();
        assert_eq!(entry.action_type, ActionType::EndTurn);
        assert!(entry.result.message.contains("ran out of time"));
    }

    #[test]
    fn test_fault_concludes_untouched_session() {
        let mut engine = engine_with(duel_spec(), RulesConfig::always_hit());
        engine.start().unwrap();
        let before = engine.session().clone();
        let seq_before = engine.last_event_seq();

        // The attack resolves inside the transaction, then state cannot advance.
        let events = engine
            .transact(|tx| {
                tx.perform(&"hero".into(), &ActionRequest::attack("goblin"))?;
                assert!(!tx.events.is_empty());
                Err(TxError::Fault(CombatFault::Inconsistent("turn holder vanished".into())))
            })
            .unwrap();

        assert_eq!(types(&events), vec!["COMBAT_END"]);
        assert_eq!(
            events[0].event,
            CombatEvent::CombatEnd {
                reason: EndReason::Fault,
                rewards: None
            }
        );
        assert_eq!(events[0].seq, seq_before + 1);

        let mut expected = before;
        expected.phase = CombatPhase::CombatEnd;
        expected.active_combatant = None;
        expected.end_reason = Some(EndReason::Fault);
        expected.rewards = None;
        assert_eq!(engine.session(), &expected);
        assert_eq!(engine.session().action_log.len(), 0);

        // Terminal from here on.
        assert!(engine.abort().is_empty());
        assert_eq!(engine.archive().reason, EndReason::Fault);
        assert!(engine.submit(&p1(), &ActionRequest::EndTurn {}).is_err());
    }

    #[test]
    fn test_abort_is_terminal_and_idempotent() {
        let mut engine = engine_with(duel_spec(), RulesConfig::always_hit());
        engine.start().unwrap();

        let events = engine.abort();
        assert_eq!(types(&events), vec!["COMBAT_END"]);
        assert_eq!(engine.session().end_reason, Some(EndReason::Aborted));
        assert!(engine.abort().is_empty());
    }

    #[test]
    fn test_abort_before_start() {
        let mut engine = engine_with(duel_spec(), RulesConfig::always_hit());
        assert_eq!(types(&engine.abort()), vec!["COMBAT_END"]);
        assert!(engine.start().is_err());
    }

    #[test]
    fn test_events_replay_to_same_state() {
        let mut engine = engine_with(duel_spec(), RulesConfig::default());
        let mut replica = engine.session().clone();
        let mut events = engine.start().unwrap();
        for _ in 0..6 {
            events.extend(engine.submit(&p1(), &ActionRequest::attack("goblin")).unwrap_or_default());
            events.extend(engine.submit(&p1(), &ActionRequest::EndTurn {}).unwrap_or_default());
            events.extend(
                engine
                    .submit(&ObserverId::from("gm"), &ActionRequest::EndTurn {})
                    .unwrap_or_default(),
            );
        }

        for event in &events {
            replica.apply_event(&event.event).unwrap();
        }
        assert_eq!(&replica, engine.session());
        assert_eq!(replica.compute_hash(), engine.state_hash());
    }

    #[test]
    fn test_archive_bytes() {
        let mut engine = engine_with(duel_spec(), RulesConfig::always_hit());
        engine.start().unwrap();
        engine.abort();

        let archive = engine.archive();
        let restored = SessionArchive::from_bytes(&archive.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, archive);
        assert_eq!(restored.reason, EndReason::Aborted);
    }

    #[test]
    fn test_same_seed_same_outcome() {
        let run = || {
            let mut engine = engine_with(npc_spec(4, 7), RulesConfig::default());
            engine.start().unwrap();
            while engine.step_npc().is_some() {}
            engine.state_hash()
        };
        assert_eq!(run(), run());
    }

    fn npc_spec(per_side: usize, seed: u64) -> EncounterSpec {
        let mut roster = Vec::new();
        for i in 0..per_side {
            let mut ally = RosterEntry::new(format!("ally{i}"), format!("Ally {i}"), 12, GridPos::new(0, i as i32 * 2));
            ally.is_ally = true;
            roster.push(ally);
            roster.push(RosterEntry::new(
                format!("foe{i}"),
                format!("Foe {i}"),
                12,
                GridPos::new(9, i as i32 * 2),
            ));
        }
        EncounterSpec::new(GridSpec::open(10, 10), roster).with_seed(seed)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_npc_combat_terminates_with_invariants(per_side in 1usize..5, seed in any::<u64>()) {
            let mut engine = CombatEngine::new(
                npc_spec(per_side, seed),
                Arc::new(StandardRules::default()),
                Arc::new(ContentTable::starter()),
                EngineOptions { max_rounds: 30 },
            ).unwrap();
            engine.start().unwrap();

            let mut last_seq = engine.last_event_seq();
            let mut steps = 0;
            while let Some(events) = engine.step_npc() {
                steps += 1;
                prop_assert!(steps < 10_000);

                for event in &events {
                    prop_assert_eq!(event.seq, last_seq + 1);
                    last_seq = event.seq;
                }

                let session = engine.session();
                for c in session.combatants.values() {
                    prop_assert!(c.hp >= 0 && c.hp <= c.hp_max);
                    prop_assert_eq!(c.hp == 0, c.status == CombatantStatus::Defeated);
                }
                if let Some(holder) = session.active() {
                    prop_assert!(holder.is_active());
                }
                for (i, entry) in session.action_log.entries().iter().enumerate() {
                    prop_assert_eq!(entry.sequence, i as u64 + 1);
                }
            }

            prop_assert!(engine.is_over());
            prop_assert!(engine.session().round <= 31);
        }

        #[test]
        fn prop_rejections_never_mutate(
            commands in proptest::collection::vec((0u8..8, 0i32..8, 0i32..8, any::<bool>()), 1..40)
        ) {
            let mut engine = engine_with(duel_spec(), RulesConfig::default());
            engine.start().unwrap();

            for (kind, x, y, as_hero) in commands {
                let request = match kind {
                    0 => ActionRequest::Move { x, y },
                    1 => ActionRequest::attack("goblin"),
                    2 => ActionRequest::attack("hero"),
                    3 => ActionRequest::Defend {},
                    4 => ActionRequest::UseItem { item_ref: "potion".into(), target_id: None },
                    5 => ActionRequest::Overwatch {},
                    6 => ActionRequest::EndTurn {},
                    _ => ActionRequest::Move { x: x - 4, y },
                };
                let observer = if as_hero { p1() } else { ObserverId::from("gm") };

                let before = engine.snapshot();
                match engine.submit(&observer, &request) {
                    Ok(events) => prop_assert_eq!(
                        engine.last_event_seq(),
                        before.last_event_seq + events.len() as u64
                    ),
                    Err(_) => prop_assert_eq!(engine.snapshot(), before),
                }
                if engine.is_over() {
                    break;
                }
            }
        }
    }
}
