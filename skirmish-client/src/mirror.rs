//! Client Mirror
//!
//! Rebuilds the authority's session from `COMBAT_STATE` snapshots and
//! sequenced events, through the same event application the authority uses.
//! Events at or below the applied sequence are discarded, so a snapshot
//! followed by replayed events never double-applies. A gap or an event that
//! does not apply marks the mirror desynced until the next snapshot.
//!
//! The mirror also tracks the one command an observer may have in flight.
//! The slot is released by the command's result or error, by the end of
//! combat, or by losing the connection the command was sent on. Changes are
//! published on a broadcast channel for presentation layers.

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use skirmish::combat::action::ActionRequest;
use skirmish::combat::error::Rejection;
use skirmish::combat::events::CombatEvent;
use skirmish::combat::state::CombatSession;
use skirmish::network::protocol::ServerMessage;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MirrorError {
    /// A command is already waiting for its result.
    #[error("command {0} is still pending")]
    CommandPending(String),

    /// No snapshot received yet, or waiting for a resync.
    #[error("mirror is not in sync with the session")]
    NotSynced,
}

/// The pending-command state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandState {
    Idle,
    AwaitingResult { request_id: String },
}

/// What the caller should do after [`ClientMirror::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorAction {
    None,
    /// Send `RESYNC`; the mirror cannot continue from its current state.
    RequestResync,
}

/// Change notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorUpdate {
    Snapshot { seq: u64 },
    Applied { seq: u64, event: CombatEvent },
    CommandResolved { request_id: String },
    CommandRejected { request_id: String, rejection: Rejection },
    /// The connection carrying the command dropped before its result arrived.
    CommandDropped { request_id: String },
    Desynced { expected: u64, received: u64 },
}

/// Per-observer cache of one session.
#[derive(Debug)]
pub struct ClientMirror {
    session: Option<CombatSession>,
    applied_seq: u64,
    state_hash: Option<String>,
    command: CommandState,
    desynced: bool,
    next_request: u64,
    updates: broadcast::Sender<MirrorUpdate>,
}

impl Default for ClientMirror {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientMirror {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            session: None,
            applied_seq: 0,
            state_hash: None,
            command: CommandState::Idle,
            desynced: false,
            next_request: 0,
            updates,
        }
    }

    pub fn session(&self) -> Option<&CombatSession> {
        self.session.as_ref()
    }

    /// Sequence number of the newest applied event.
    pub fn applied_seq(&self) -> u64 {
        self.applied_seq
    }

    /// Hash reported by the last snapshot.
    pub fn snapshot_hash(&self) -> Option<&str> {
        self.state_hash.as_deref()
    }

    pub fn command_state(&self) -> &CommandState {
        &self.command
    }

    pub fn is_pending(&self) -> bool {
        self.command != CommandState::Idle
    }

    pub fn is_synced(&self) -> bool {
        self.session.is_some() && !self.desynced
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MirrorUpdate> {
        self.updates.subscribe()
    }

    /// Reserve the command slot. Returns the request id to send with the
    /// command.
    pub fn begin_command(&mut self, request: &ActionRequest) -> Result<String, MirrorError> {
        if let CommandState::AwaitingResult { request_id } = &self.command {
            return Err(MirrorError::CommandPending(request_id.clone()));
        }
        if !self.is_synced() {
            return Err(MirrorError::NotSynced);
        }
        self.next_request += 1;
        let request_id = format!("cmd-{}", self.next_request);
        debug!(request_id = %request_id, action = ?request.action_type(), "Command submitted");
        self.command = CommandState::AwaitingResult {
            request_id: request_id.clone(),
        };
        Ok(request_id)
    }

    /// Release the command slot without a result, e.g. when the send failed.
    pub fn abandon_command(&mut self) {
        self.command = CommandState::Idle;
    }

    /// The transport dropped. A pending command was either lost with the
    /// connection or is reflected in the snapshot sent on reattach, so the
    /// slot is released. Events are ignored until that snapshot arrives.
    pub fn connection_lost(&mut self) {
        if self.session.is_some() {
            self.desynced = true;
        }
        let command = std::mem::replace(&mut self.command, CommandState::Idle);
        if let CommandState::AwaitingResult { request_id } = command {
            debug!(request_id = %request_id, "Pending command dropped with the connection");
            self.publish(MirrorUpdate::CommandDropped { request_id });
        }
    }

    /// Apply one server message.
    pub fn apply(&mut self, message: &ServerMessage) -> MirrorAction {
        match message {
            ServerMessage::State(snapshot) => {
                let local = hex::encode(snapshot.session.compute_hash());
                if local != snapshot.state_hash {
                    warn!(
                        seq = snapshot.last_event_seq,
                        expected = %snapshot.state_hash,
                        computed = %local,
                        "Snapshot hash mismatch, rules versions may differ"
                    );
                }
                self.session = Some(snapshot.session.clone());
                self.applied_seq = snapshot.last_event_seq;
                self.state_hash = Some(snapshot.state_hash.clone());
                self.desynced = false;
                self.publish(MirrorUpdate::Snapshot {
                    seq: snapshot.last_event_seq,
                });
                MirrorAction::None
            }

            ServerMessage::Event {
                seq,
                request_id,
                event,
            } => {
                let action = self.apply_event(*seq, request_id.as_deref(), event);
                self.settle_command(request_id.as_deref(), event);
                action
            }

            ServerMessage::Error {
                request_id,
                rejection,
            } => {
                if let (CommandState::AwaitingResult { request_id: pending }, Some(id)) =
                    (&self.command, request_id)
                {
                    if pending == id {
                        self.command = CommandState::Idle;
                        self.publish(MirrorUpdate::CommandRejected {
                            request_id: id.clone(),
                            rejection: rejection.clone(),
                        });
                    }
                }
                MirrorAction::None
            }

            ServerMessage::Pong { .. } => MirrorAction::None,
        }
    }

    fn apply_event(&mut self, seq: u64, request_id: Option<&str>, event: &CombatEvent) -> MirrorAction {
        if self.desynced {
            return MirrorAction::None;
        }
        let Some(session) = self.session.as_mut() else {
            self.desynced = true;
            return MirrorAction::RequestResync;
        };
        if seq <= self.applied_seq {
            debug!(seq, applied = self.applied_seq, "Duplicate event discarded");
            return MirrorAction::None;
        }
        if seq != self.applied_seq + 1 {
            warn!(expected = self.applied_seq + 1, received = seq, "Event gap, requesting resync");
            self.desynced = true;
            self.publish(MirrorUpdate::Desynced {
                expected: self.applied_seq + 1,
                received: seq,
            });
            return MirrorAction::RequestResync;
        }

        let mut next = session.clone();
        if let Err(fault) = next.apply_event(event) {
            warn!(seq, %fault, "Event does not apply, requesting resync");
            self.desynced = true;
            self.publish(MirrorUpdate::Desynced {
                expected: self.applied_seq + 1,
                received: seq,
            });
            return MirrorAction::RequestResync;
        }
        *session = next;
        self.applied_seq = seq;
        self.publish(MirrorUpdate::Applied {
            seq,
            event: event.clone(),
        });
        MirrorAction::None
    }

    /// Release the slot on the command's own result, even when the event
    /// itself was discarded as a duplicate or while desynced.
    fn settle_command(&mut self, request_id: Option<&str>, event: &CombatEvent) {
        let CommandState::AwaitingResult { request_id: pending } = &self.command else {
            return;
        };
        let resolved = matches!(event, CombatEvent::ActionResolved(_)) && request_id == Some(pending.as_str());
        if resolved {
            let request_id = pending.clone();
            self.command = CommandState::Idle;
            self.publish(MirrorUpdate::CommandResolved { request_id });
        } else if matches!(event, CombatEvent::CombatEnd { .. }) {
            self.command = CommandState::Idle;
        }
    }

    fn publish(&self, update: MirrorUpdate) {
        let _ = self.updates.send(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    use skirmish::combat::content::ContentTable;
    use skirmish::combat::engine::{CombatEngine, CombatSnapshot, EngineOptions};
    use skirmish::combat::error::ErrorCode;
    use skirmish::combat::events::SequencedEvent;
    use skirmish::combat::grid::{GridPos, GridSpec};
    use skirmish::combat::roster::{EncounterSpec, RosterEntry};
    use skirmish::combat::rules::{RulesConfig, StandardRules};

    /// Initial snapshot, every event and the final authoritative state of a
    /// seeded NPC-only encounter.
    fn recorded() -> (CombatSnapshot, Vec<SequencedEvent>, CombatSession) {
        let spec = EncounterSpec::new(
            GridSpec::open(8, 8),
            vec![
                RosterEntry::new("guard", "Guard", 20, GridPos::new(0, 0)).ally(),
                RosterEntry::new("scout", "Scout", 12, GridPos::new(0, 2)).ally(),
                RosterEntry::new("wolf", "Wolf", 14, GridPos::new(7, 7)),
                RosterEntry::new("bandit", "Bandit", 16, GridPos::new(6, 7)),
            ],
        )
        .with_session_id("mirror")
        .with_seed(99);
        let mut engine = CombatEngine::new(
            spec,
            Arc::new(StandardRules::new(RulesConfig::default())),
            Arc::new(ContentTable::starter()),
            EngineOptions::default(),
        )
        .unwrap();

        let initial = engine.snapshot();
        let mut events = engine.start().unwrap();
        while let Some(step) = engine.step_npc() {
            events.extend(step);
        }
        (initial, events, engine.session().clone())
    }

    fn event(sequenced: &SequencedEvent, request_id: Option<&str>) -> ServerMessage {
        ServerMessage::Event {
            seq: sequenced.seq,
            request_id: request_id.map(str::to_string),
            event: sequenced.event.clone(),
        }
    }

    #[test]
    fn test_replay_reproduces_authority_state() {
        let (initial, events, authoritative) = recorded();
        let mut mirror = ClientMirror::new();

        assert_eq!(mirror.apply(&ServerMessage::State(Box::new(initial))), MirrorAction::None);
        for sequenced in &events {
            assert_eq!(mirror.apply(&event(sequenced, None)), MirrorAction::None);
        }

        let session = mirror.session().unwrap();
        assert_eq!(session, &authoritative);
        assert_eq!(session.compute_hash(), authoritative.compute_hash());
        assert_eq!(mirror.applied_seq(), events.len() as u64);
    }

    #[test]
    fn test_gap_requests_resync_until_snapshot() {
        let (initial, events, _) = recorded();
        let mut mirror = ClientMirror::new();
        let mut updates = mirror.subscribe();
        mirror.apply(&ServerMessage::State(Box::new(initial)));

        assert_eq!(mirror.apply(&event(&events[0], None)), MirrorAction::None);
        assert_eq!(mirror.apply(&event(&events[2], None)), MirrorAction::RequestResync);
        assert!(!mirror.is_synced());
        // Further events are ignored while waiting for the snapshot.
        assert_eq!(mirror.apply(&event(&events[1], None)), MirrorAction::None);
        assert_eq!(mirror.applied_seq(), 1);

        let mut saw_desync = false;
        while let Ok(update) = updates.try_recv() {
            if let MirrorUpdate::Desynced { expected, received } = update {
                assert_eq!((expected, received), (2, 3));
                saw_desync = true;
            }
        }
        assert!(saw_desync);
    }

    #[test]
    fn test_event_before_snapshot_requests_resync() {
        let (_, events, _) = recorded();
        let mut mirror = ClientMirror::new();
        assert_eq!(mirror.apply(&event(&events[0], None)), MirrorAction::RequestResync);
        assert!(mirror.session().is_none());
    }

    #[test]
    fn test_pending_command_cleared_by_matching_result() {
        let (initial, events, _) = recorded();
        let mut mirror = ClientMirror::new();
        assert_eq!(mirror.begin_command(&ActionRequest::EndTurn {}), Err(MirrorError::NotSynced));

        mirror.apply(&ServerMessage::State(Box::new(initial)));
        let request_id = mirror.begin_command(&ActionRequest::Defend {}).unwrap();
        assert_eq!(
            mirror.begin_command(&ActionRequest::EndTurn {}),
            Err(MirrorError::CommandPending(request_id.clone()))
        );

        let first_action = events
            .iter()
            .position(|e| matches!(e.event, CombatEvent::ActionResolved(_)))
            .unwrap();
        for sequenced in &events[..first_action] {
            mirror.apply(&event(sequenced, None));
            assert!(mirror.is_pending());
        }
        // Another observer's result does not release the slot.
        mirror.apply(&event(&events[first_action], Some("someone-else")));
        assert!(mirror.is_pending());

        mirror.abandon_command();
        let request_id = mirror.begin_command(&ActionRequest::Defend {}).unwrap();
        let next_action = events
            .iter()
            .skip(first_action + 1)
            .position(|e| matches!(e.event, CombatEvent::ActionResolved(_)))
            .unwrap()
            + first_action
            + 1;
        for sequenced in &events[first_action + 1..next_action] {
            mirror.apply(&event(sequenced, None));
        }
        mirror.apply(&event(&events[next_action], Some(&request_id)));
        assert_eq!(mirror.command_state(), &CommandState::Idle);
    }

    #[test]
    fn test_pending_command_cleared_by_matching_error() {
        let (initial, _, _) = recorded();
        let mut mirror = ClientMirror::new();
        mirror.apply(&ServerMessage::State(Box::new(initial)));
        let request_id = mirror.begin_command(&ActionRequest::EndTurn {}).unwrap();

        let rejection = Rejection::new(ErrorCode::NotYourTurn, "not your turn");
        mirror.apply(&ServerMessage::Error {
            request_id: Some("stale".into()),
            rejection: rejection.clone(),
        });
        assert!(mirror.is_pending());

        mirror.apply(&ServerMessage::Error {
            request_id: Some(request_id),
            rejection,
        });
        assert!(!mirror.is_pending());
    }

    #[test]
    fn test_snapshot_keeps_pending_command() {
        let (initial, _, _) = recorded();
        let mut mirror = ClientMirror::new();
        mirror.apply(&ServerMessage::State(Box::new(initial.clone())));
        let request_id = mirror.begin_command(&ActionRequest::EndTurn {}).unwrap();

        mirror.apply(&ServerMessage::State(Box::new(initial)));
        assert_eq!(mirror.command_state(), &CommandState::AwaitingResult { request_id });
    }

    #[test]
    fn test_connection_loss_releases_slot_and_waits_for_snapshot() {
        let (initial, events, _) = recorded();
        let mut mirror = ClientMirror::new();
        let mut updates = mirror.subscribe();
        mirror.apply(&ServerMessage::State(Box::new(initial.clone())));
        let request_id = mirror.begin_command(&ActionRequest::Defend {}).unwrap();

        mirror.connection_lost();
        assert!(!mirror.is_pending());
        assert!(!mirror.is_synced());
        assert_eq!(mirror.begin_command(&ActionRequest::Defend {}), Err(MirrorError::NotSynced));
        // Events from the old connection are ignored.
        assert_eq!(mirror.apply(&event(&events[0], None)), MirrorAction::None);
        assert_eq!(mirror.applied_seq(), 0);

        mirror.apply(&ServerMessage::State(Box::new(initial)));
        assert!(mirror.is_synced());
        assert!(mirror.begin_command(&ActionRequest::Defend {}).is_ok());

        let mut dropped = Vec::new();
        while let Ok(update) = updates.try_recv() {
            if let MirrorUpdate::CommandDropped { request_id } = update {
                dropped.push(request_id);
            }
        }
        assert_eq!(dropped, vec![request_id]);
    }

    #[test]
    fn test_result_releases_slot_while_desynced() {
        let (initial, events, _) = recorded();
        let mut mirror = ClientMirror::new();
        mirror.apply(&ServerMessage::State(Box::new(initial)));
        let request_id = mirror.begin_command(&ActionRequest::Defend {}).unwrap();

        let action = events
            .iter()
            .position(|e| matches!(e.event, CombatEvent::ActionResolved(_)))
            .unwrap();
        assert!(action > 0);
        // Skipping straight to the result is a gap; the result still settles the command.
        assert_eq!(mirror.apply(&event(&events[action], Some(&request_id))), MirrorAction::RequestResync);
        assert!(!mirror.is_synced());
        assert!(!mirror.is_pending());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Redelivering already-applied events, or a fresh snapshot taken
        /// mid-stream, never changes the final mirror state.
        #[test]
        fn prop_redelivery_is_idempotent(
            redeliveries in proptest::collection::vec((any::<bool>(), any::<prop::sample::Index>()), 256),
            resync_at in any::<prop::sample::Index>(),
        ) {
            let (initial, events, authoritative) = recorded();
            let resync_at = resync_at.index(events.len());

            // Snapshot as the authority would send it after `resync_at` events.
            let mut midway = initial.session.clone();
            for sequenced in &events[..resync_at] {
                midway.apply_event(&sequenced.event).unwrap();
            }
            let midway = CombatSnapshot {
                state_hash: hex::encode(midway.compute_hash()),
                session: midway,
                last_event_seq: resync_at as u64,
            };

            let mut mirror = ClientMirror::new();
            mirror.apply(&ServerMessage::State(Box::new(initial)));
            for (i, sequenced) in events.iter().enumerate() {
                mirror.apply(&event(sequenced, None));
                let (redeliver, pick) = redeliveries[i % redeliveries.len()];
                if redeliver {
                    let earlier = &events[pick.index(i + 1)];
                    prop_assert_eq!(mirror.apply(&event(earlier, None)), MirrorAction::None);
                }
                if i + 1 == resync_at {
                    mirror.apply(&ServerMessage::State(Box::new(midway.clone())));
                }
            }

            prop_assert_eq!(mirror.session().unwrap(), &authoritative);
            prop_assert_eq!(mirror.applied_seq(), events.len() as u64);
        }
    }
}
