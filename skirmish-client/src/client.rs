//! Combat client: one connection channel feeding one mirror.

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use skirmish::combat::action::ActionRequest;
use skirmish::combat::state::{CombatSession, ObserverId};
use skirmish::network::protocol::{ClientMessage, ServerMessage};

use crate::mirror::{ClientMirror, MirrorAction, MirrorError, MirrorUpdate};
use crate::network::{ChannelConfig, ChannelError, ChannelEvent, ConnectionChannel, ConnectionStatus};
use crate::targeting::{self, Affordances};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Mirror(#[from] MirrorError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// An observer's view of one session.
pub struct CombatClient {
    observer_id: ObserverId,
    channel: ConnectionChannel,
    inbound: mpsc::Receiver<ChannelEvent>,
    mirror: ClientMirror,
    /// Connection the mirror is currently fed from.
    epoch: Option<u64>,
}

impl CombatClient {
    /// Open the channel. State arrives through [`CombatClient::next_message`].
    pub fn connect(config: ChannelConfig) -> Self {
        let observer_id = config.observer_id.clone();
        let (channel, inbound) = ConnectionChannel::open(config);
        Self {
            observer_id,
            channel,
            inbound,
            mirror: ClientMirror::new(),
            epoch: None,
        }
    }

    pub fn observer_id(&self) -> &ObserverId {
        &self.observer_id
    }

    pub fn mirror(&self) -> &ClientMirror {
        &self.mirror
    }

    pub fn session(&self) -> Option<&CombatSession> {
        self.mirror.session()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<MirrorUpdate> {
        self.mirror.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.channel.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.channel.watch_status()
    }

    /// Receive the next server message and apply it to the mirror.
    ///
    /// Returns `None` once the channel has stopped for good.
    pub async fn next_message(&mut self) -> Option<ServerMessage> {
        loop {
            match self.inbound.recv().await? {
                ChannelEvent::Connected { epoch } => {
                    debug!(observer = %self.observer_id, epoch, "Connection up");
                    self.epoch = Some(epoch);
                }
                ChannelEvent::Disconnected { epoch } => {
                    info!(observer = %self.observer_id, epoch, "Connection lost");
                    self.epoch = None;
                    self.mirror.connection_lost();
                }
                ChannelEvent::Message(message) => {
                    if self.mirror.apply(&message) == MirrorAction::RequestResync {
                        debug!(observer = %self.observer_id, "Requesting resync");
                        if let Err(e) = self.channel.send(ClientMessage::Resync).await {
                            warn!(observer = %self.observer_id, "Resync request not sent: {}", e);
                        }
                    }
                    return Some(message);
                }
            }
        }
    }

    /// Submit a command for the observer's combatant.
    ///
    /// Fails with [`MirrorError::CommandPending`] while an earlier command is
    /// unresolved and with [`ChannelError::NotConnected`] during an outage.
    /// The command is bound to the current connection: if that connection
    /// drops before it is written, it is discarded and the slot is released.
    /// Returns the request id echoed by the result.
    pub async fn submit(&mut self, request: ActionRequest) -> Result<String, ClientError> {
        let epoch = match self.epoch {
            Some(epoch) if self.channel.status() == ConnectionStatus::Connected => epoch,
            _ => return Err(ChannelError::NotConnected.into()),
        };
        let request_id = self.mirror.begin_command(&request)?;
        let message = ClientMessage::command(request_id.clone(), request);
        if let Err(e) = self.channel.send_on(epoch, message).await {
            self.mirror.abandon_command();
            return Err(e.into());
        }
        Ok(request_id)
    }

    /// Ask for a fresh snapshot.
    pub async fn resync(&self) -> Result<(), ClientError> {
        self.channel.send(ClientMessage::Resync).await?;
        Ok(())
    }

    /// Drop the transport and reconnect; the mirror resyncs from the
    /// snapshot sent on attach.
    pub fn reconnect(&self) {
        self.channel.reconnect();
    }

    pub fn affordances(&self, friendly_fire: bool) -> Affordances {
        self.mirror
            .session()
            .map(|session| targeting::affordances(session, &self.observer_id, friendly_fire))
            .unwrap_or_default()
    }

    /// Leave the session and close the channel.
    pub async fn close(self) {
        self.channel.close().await;
    }
}
