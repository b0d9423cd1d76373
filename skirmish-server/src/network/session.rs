//! Session Authority
//!
//! One actor task per combat session. The task owns the [`CombatEngine`] and
//! is the only writer of session state; connections talk to it through an
//! [`AuthorityHandle`] and receive events on their own bounded outbox.
//!
//! ```text
//!  connection ──Submit/Resync──▶ ┌───────────────┐ ──Event──▶ outbox (per observer)
//!  connection ──Attach/Detach──▶ │  authority    │ ──State──▶ outbox (on attach/resync)
//!  registry   ──Abort─────────▶  │  (engine)     │ ──Error──▶ submitter only
//!                                └───────────────┘
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, instrument, warn};

use crate::combat::action::ActionRequest;
use crate::combat::engine::{CombatEngine, CombatSnapshot, SessionArchive};
use crate::combat::error::CombatFault;
use crate::combat::events::{CombatEvent, SequencedEvent};
use crate::combat::phase::CombatPhase;
use crate::combat::rules::RulesConfig;
use crate::combat::state::{ObserverId, SessionId};
use crate::network::env_or;
use crate::network::protocol::ServerMessage;

/// Configuration for a session authority.
#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    /// Per-turn timer for observer-controlled turns. `None` disables it.
    pub turn_timeout: Option<Duration>,
    /// Rounds before the session ends with `ROUND_LIMIT`.
    pub max_rounds: u32,
    /// How long a finished session stays attachable.
    pub linger: Duration,
    /// Capacity of the command queue.
    pub command_buffer: usize,
    /// Combat formulas.
    pub rules: RulesConfig,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            turn_timeout: None,
            max_rounds: 50,
            linger: Duration::from_secs(30),
            command_buffer: 64,
            rules: RulesConfig::default(),
        }
    }
}

impl AuthorityConfig {
    /// Read `SKIRMISH_*` overrides on top of the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let turn_timeout = match env_or::<u64>("SKIRMISH_TURN_TIMEOUT_SECS", 0) {
            0 => defaults.turn_timeout,
            secs => Some(Duration::from_secs(secs)),
        };

        Self {
            turn_timeout,
            max_rounds: env_or("SKIRMISH_MAX_ROUNDS", defaults.max_rounds),
            linger: Duration::from_secs(env_or("SKIRMISH_LINGER_SECS", defaults.linger.as_secs())),
            command_buffer: env_or("SKIRMISH_COMMAND_BUFFER", defaults.command_buffer).max(1),
            rules: RulesConfig {
                friendly_fire: env_or("SKIRMISH_FRIENDLY_FIRE", defaults.rules.friendly_fire),
                ..defaults.rules
            },
        }
    }
}

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The authority task has stopped.
    #[error("Session authority closed")]
    Closed,

    /// No session with this id.
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    /// A session with this id is already running.
    #[error("Session already exists: {0}")]
    AlreadyExists(SessionId),

    /// The encounter could not be turned into a session.
    #[error("Invalid encounter: {0}")]
    Encounter(#[from] CombatFault),
}

/// Identifies one attachment of an observer. A reconnect gets a new token,
/// so a late detach from the old connection cannot drop the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionToken(u64);

#[derive(Debug)]
enum AuthorityCommand {
    Attach {
        observer: ObserverId,
        outbox: mpsc::Sender<ServerMessage>,
        reply: oneshot::Sender<ConnectionToken>,
    },
    Detach {
        observer: ObserverId,
        token: ConnectionToken,
    },
    Submit {
        observer: ObserverId,
        request_id: Option<String>,
        request: ActionRequest,
    },
    Resync {
        observer: ObserverId,
    },
    Snapshot {
        reply: oneshot::Sender<CombatSnapshot>,
    },
    Abort,
}

/// Cloneable handle to a running authority.
#[derive(Debug, Clone)]
pub struct AuthorityHandle {
    session_id: SessionId,
    commands: mpsc::Sender<AuthorityCommand>,
}

impl AuthorityHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// True once the authority task has exited.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Attach an observer. Its outbox first receives `COMBAT_STATE`; an
    /// earlier attachment of the same observer is replaced.
    pub async fn attach(
        &self,
        observer: ObserverId,
        outbox: mpsc::Sender<ServerMessage>,
    ) -> Result<ConnectionToken, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(AuthorityCommand::Attach {
            observer,
            outbox,
            reply,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn detach(&self, observer: ObserverId, token: ConnectionToken) -> Result<(), SessionError> {
        self.send(AuthorityCommand::Detach { observer, token }).await
    }

    /// Queue a command. The outcome arrives on the observer's outbox: the
    /// resulting events, or an `ERROR` carrying `request_id`.
    pub async fn submit(
        &self,
        observer: ObserverId,
        request_id: Option<String>,
        request: ActionRequest,
    ) -> Result<(), SessionError> {
        self.send(AuthorityCommand::Submit {
            observer,
            request_id,
            request,
        })
        .await
    }

    pub async fn resync(&self, observer: ObserverId) -> Result<(), SessionError> {
        self.send(AuthorityCommand::Resync { observer }).await
    }

    pub async fn snapshot(&self) -> Result<CombatSnapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(AuthorityCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// End the session with `ABORTED`.
    pub async fn abort(&self) -> Result<(), SessionError> {
        self.send(AuthorityCommand::Abort).await
    }

    async fn send(&self, command: AuthorityCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }
}

struct Attachment {
    token: ConnectionToken,
    outbox: mpsc::Sender<ServerMessage>,
}

/// The actor. Build it with [`SessionAuthority::spawn`].
pub struct SessionAuthority {
    engine: CombatEngine,
    config: AuthorityConfig,
    commands: mpsc::Receiver<AuthorityCommand>,
    observers: BTreeMap<ObserverId, Attachment>,
    next_token: u64,
    turn_deadline: Option<Instant>,
    ended_at: Option<Instant>,
}

impl SessionAuthority {
    /// Start the authority task. The join handle yields the archive once
    /// the session is over and every observer has left, or the linger
    /// period ran out.
    pub fn spawn(engine: CombatEngine, config: AuthorityConfig) -> (AuthorityHandle, JoinHandle<SessionArchive>) {
        let (tx, rx) = mpsc::channel(config.command_buffer.max(1));
        let handle = AuthorityHandle {
            session_id: engine.session_id().clone(),
            commands: tx,
        };
        let authority = SessionAuthority {
            engine,
            config,
            commands: rx,
            observers: BTreeMap::new(),
            next_token: 0,
            turn_deadline: None,
            ended_at: None,
        };
        (handle, tokio::spawn(authority.run()))
    }

    #[instrument(skip(self), fields(session = %self.engine.session_id()))]
    async fn run(mut self) -> SessionArchive {
        info!("Session authority started");

        if self.engine.phase() == CombatPhase::Initializing {
            match self.engine.start() {
                Ok(events) => self.broadcast(&events, None),
                Err(err) => warn!(%err, "Could not start session"),
            }
        }
        self.drive_npcs().await;

        loop {
            if self.engine.is_over() && self.observers.is_empty() {
                break;
            }

            let linger_deadline = self.ended_at.map(|at| at + self.config.linger);
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => {
                        debug!("All handles dropped");
                        let events = self.engine.abort();
                        self.broadcast(&events, None);
                        break;
                    }
                },
                _ = sleep_until_opt(self.turn_deadline) => {
                    self.turn_deadline = None;
                    match self.engine.force_end_turn() {
                        Ok(events) => {
                            info!("Turn timer expired");
                            self.broadcast(&events, None);
                        }
                        Err(err) => debug!(%err, "Turn timer fired outside a turn"),
                    }
                }
                _ = sleep_until_opt(linger_deadline) => {
                    debug!(observers = self.observers.len(), "Linger period over");
                    break;
                }
            }

            self.drive_npcs().await;
        }

        let archive = self.engine.archive();
        info!(
            reason = %archive.reason,
            rounds = archive.rounds,
            actions = archive.log.len(),
            "Session authority stopped"
        );
        archive
    }

    fn handle(&mut self, command: AuthorityCommand) {
        match command {
            AuthorityCommand::Attach {
                observer,
                outbox,
                reply,
            } => {
                self.next_token += 1;
                let token = ConnectionToken(self.next_token);
                let snapshot = ServerMessage::State(Box::new(self.engine.snapshot()));
                if outbox.try_send(snapshot).is_err() {
                    warn!(observer = %observer, "Outbox rejected initial snapshot");
                    return;
                }
                let replaced = self
                    .observers
                    .insert(observer.clone(), Attachment { token, outbox })
                    .is_some();
                if replaced {
                    info!(observer = %observer, "Observer reattached, previous connection replaced");
                } else {
                    info!(observer = %observer, "Observer attached");
                }
                let _ = reply.send(token);
            }

            AuthorityCommand::Detach { observer, token } => {
                let current = self.observers.get(&observer).map(|a| a.token);
                if current == Some(token) {
                    self.observers.remove(&observer);
                    info!(observer = %observer, "Observer detached");
                } else {
                    debug!(observer = %observer, "Ignoring detach from a replaced connection");
                }
            }

            AuthorityCommand::Submit {
                observer,
                request_id,
                request,
            } => match self.engine.submit(&observer, &request) {
                Ok(events) => self.broadcast(&events, Some((&observer, request_id))),
                Err(err) => {
                    let message = ServerMessage::Error {
                        request_id,
                        rejection: err.to_rejection(),
                    };
                    self.deliver(&observer, message);
                }
            },

            AuthorityCommand::Resync { observer } => {
                debug!(observer = %observer, "Resync requested");
                let snapshot = ServerMessage::State(Box::new(self.engine.snapshot()));
                self.deliver(&observer, snapshot);
            }

            AuthorityCommand::Snapshot { reply } => {
                let _ = reply.send(self.engine.snapshot());
            }

            AuthorityCommand::Abort => {
                let events = self.engine.abort();
                if !events.is_empty() {
                    info!("Session aborted");
                }
                self.broadcast(&events, None);
            }
        }
    }

    /// Resolve NPC turns until an observer-controlled combatant holds the
    /// turn or the session ends.
    async fn drive_npcs(&mut self) {
        while let Some(events) = self.engine.step_npc() {
            self.broadcast(&events, None);
            tokio::task::yield_now().await;
        }
    }

    /// Fan events out to every observer. The submitter's copy of the first
    /// `ACTION_RESULT` carries its request id.
    fn broadcast(&mut self, events: &[SequencedEvent], origin: Option<(&ObserverId, Option<String>)>) {
        let correlated = events
            .iter()
            .position(|e| matches!(e.event, CombatEvent::ActionResolved(_)));
        let mut dropped: Vec<ObserverId> = Vec::new();

        for (index, sequenced) in events.iter().enumerate() {
            self.track_timers(&sequenced.event);

            for (observer, attachment) in &self.observers {
                if dropped.contains(observer) {
                    continue;
                }
                let request_id = match &origin {
                    Some((submitter, request_id)) if *submitter == observer && correlated == Some(index) => {
                        request_id.clone()
                    }
                    _ => None,
                };
                let message = ServerMessage::Event {
                    seq: sequenced.seq,
                    request_id,
                    event: sequenced.event.clone(),
                };
                if attachment.outbox.try_send(message).is_err() {
                    dropped.push(observer.clone());
                }
            }
        }

        for observer in dropped {
            warn!(observer = %observer, "Observer outbox full or closed, detaching");
            self.observers.remove(&observer);
        }
    }

    fn deliver(&mut self, observer: &ObserverId, message: ServerMessage) {
        let Some(attachment) = self.observers.get(observer) else {
            debug!(observer = %observer, kind = message.type_name(), "Reply to unattached observer dropped");
            return;
        };
        if attachment.outbox.try_send(message).is_err() {
            warn!(observer = %observer, "Observer outbox full or closed, detaching");
            self.observers.remove(observer);
        }
    }

    fn track_timers(&mut self, event: &CombatEvent) {
        match event {
            CombatEvent::TurnStart { .. } => {
                self.turn_deadline = self.config.turn_timeout.map(|t| Instant::now() + t);
            }
            CombatEvent::CombatEnd { .. } => {
                self.turn_deadline = None;
                self.ended_at = Some(Instant::now());
            }
            _ => {}
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// TESTS
// =============================================================================
