//! Connection Channel
//!
//! One logical, ordered channel between an observer and a session authority.
//! The channel owns the socket: it reconnects with backoff when the transport
//! drops, sends `PING` heartbeats and treats a silent server as a dropped
//! connection. It knows nothing about combat; every server frame is handed to
//! the consumer as a [`ServerMessage`], bracketed by connect and disconnect
//! markers carrying the connection's epoch.
//!
//! Frames sent with [`ConnectionChannel::send_on`] are bound to one epoch and
//! are discarded rather than replayed on a later connection.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use skirmish::combat::state::{ObserverId, SessionId};
use skirmish::network::env_or;
use skirmish::network::protocol::{ClientMessage, ServerMessage};

use super::backoff::{Backoff, BackoffConfig};

/// Channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Base URL of the combat server, e.g. `ws://127.0.0.1:8080`.
    pub server_url: String,
    pub session_id: SessionId,
    pub observer_id: ObserverId,
    pub backoff: BackoffConfig,
    pub heartbeat_interval: Duration,
    /// Silence longer than this drops the connection.
    pub heartbeat_timeout: Duration,
    /// Give up after this many failed attempts in a row. `None` retries forever.
    pub max_attempts: Option<u32>,
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
}

impl ChannelConfig {
    pub fn new(server_url: impl Into<String>, session_id: SessionId, observer_id: ObserverId) -> Self {
        Self {
            server_url: server_url.into(),
            session_id,
            observer_id,
            backoff: BackoffConfig::default(),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            max_attempts: None,
            inbound_capacity: 256,
            outbound_capacity: 64,
        }
    }

    /// `SKIRMISH_SERVER_URL`, `SKIRMISH_SESSION` and `SKIRMISH_OBSERVER`.
    pub fn from_env() -> Self {
        Self::new(
            env_or("SKIRMISH_SERVER_URL", "ws://127.0.0.1:8080".to_string()),
            SessionId::new(env_or("SKIRMISH_SESSION", "demo".to_string())),
            ObserverId::new(env_or("SKIRMISH_OBSERVER", "watcher".to_string())),
        )
    }

    /// Full WebSocket URL of this observer's session endpoint.
    pub fn endpoint(&self) -> String {
        format!(
            "{}/combat/{}?observer={}",
            self.server_url.trim_end_matches('/'),
            self.session_id,
            self.observer_id
        )
    }
}

/// Transport state published to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting { attempt: u32 },
    Connected,
    Reconnecting { attempt: u32, retry_in: Duration },
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("not connected")]
    NotConnected,
}

/// What the channel hands to its consumer, in order.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Connection number `epoch` is up; its frames follow.
    Connected { epoch: u64 },
    Message(ServerMessage),
    /// Connection number `epoch` is gone. Frames bound to it that were still
    /// queued will not be sent.
    Disconnected { epoch: u64 },
}

#[derive(Debug)]
struct Outbound {
    epoch: Option<u64>,
    message: ClientMessage,
}

/// Handle to a running channel. Dropping it stops the connection.
pub struct ConnectionChannel {
    outbound: mpsc::Sender<Outbound>,
    status: watch::Receiver<ConnectionStatus>,
    shutdown_tx: broadcast::Sender<()>,
    kick: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ConnectionChannel {
    /// Start connecting. Server frames arrive on the returned receiver, in
    /// order, across reconnects.
    pub fn open(config: ChannelConfig) -> (Self, mpsc::Receiver<ChannelEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting { attempt: 0 });
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let kick = Arc::new(Notify::new());

        let worker = Worker {
            config,
            outbound: outbound_rx,
            inbound: inbound_tx,
            status: status_tx,
            shutdown: shutdown_rx,
            kick: kick.clone(),
        };
        let channel = Self {
            outbound: outbound_tx,
            status: status_rx,
            shutdown_tx,
            kick,
            task: tokio::spawn(worker.run()),
        };
        (channel, inbound_rx)
    }

    /// Queue a message. Messages queued while disconnected go out after the
    /// next successful connect.
    pub async fn send(&self, message: ClientMessage) -> Result<(), ChannelError> {
        self.enqueue(Outbound { epoch: None, message }).await
    }

    /// Queue a message for connection `epoch` only. If that connection drops
    /// first, the message is discarded.
    pub async fn send_on(&self, epoch: u64, message: ClientMessage) -> Result<(), ChannelError> {
        self.enqueue(Outbound {
            epoch: Some(epoch),
            message,
        })
        .await
    }

    async fn enqueue(&self, outbound: Outbound) -> Result<(), ChannelError> {
        self.outbound.send(outbound).await.map_err(|_| ChannelError::Closed)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Drop the current connection and go through the normal reconnect path.
    /// A request made while not connected is discarded at the next connect.
    pub fn reconnect(&self) {
        self.kick.notify_one();
    }

    /// Send `LEAVE`, close the socket and wait for the worker to stop.
    pub async fn close(mut self) {
        let _ = self.shutdown_tx.send(());
        let _ = (&mut self.task).await;
    }
}

impl Drop for ConnectionChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ended {
    Lost,
    Shutdown,
}

struct Worker {
    config: ChannelConfig,
    outbound: mpsc::Receiver<Outbound>,
    inbound: mpsc::Sender<ChannelEvent>,
    status: watch::Sender<ConnectionStatus>,
    shutdown: broadcast::Receiver<()>,
    kick: Arc<Notify>,
}

impl Worker {
    async fn run(mut self) {
        let endpoint = self.config.endpoint();
        let mut backoff = Backoff::new(self.config.backoff.clone());
        let mut epoch = 0u64;

        loop {
            self.status.send_replace(ConnectionStatus::Connecting {
                attempt: backoff.attempt(),
            });

            let ended = match connect_async(endpoint.as_str()).await {
                Ok((ws, _)) => {
                    epoch += 1;
                    info!(endpoint = %endpoint, epoch, "Connected");
                    backoff.reset();
                    // Stale reconnect request from while we were down.
                    let _ = self.kick.notified().now_or_never();
                    if self.inbound.send(ChannelEvent::Connected { epoch }).await.is_err() {
                        break;
                    }
                    self.status.send_replace(ConnectionStatus::Connected);
                    let ended = self.drive(ws, epoch).await;
                    if ended == Ended::Lost {
                        let lost = ChannelEvent::Disconnected { epoch };
                        if self.inbound.send(lost).await.is_err() {
                            break;
                        }
                    }
                    ended
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, "Connect failed: {}", e);
                    Ended::Lost
                }
            };
            if ended == Ended::Shutdown {
                break;
            }

            if let Some(max) = self.config.max_attempts {
                if backoff.attempt() >= max {
                    warn!(endpoint = %endpoint, "Giving up after {} attempts", max);
                    break;
                }
            }

            let delay = backoff.next_delay();
            info!(attempt = backoff.attempt(), "Reconnecting in {:?}", delay);
            self.status.send_replace(ConnectionStatus::Reconnecting {
                attempt: backoff.attempt(),
                retry_in: delay,
            });
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown.recv() => break,
            }
        }

        self.status.send_replace(ConnectionStatus::Closed);
        debug!(endpoint = %endpoint, "Channel worker stopped");
    }

    /// Pump one connection until it drops or the channel shuts down.
    async fn drive(&mut self, ws: WebSocketStream<MaybeTlsStream<TcpStream>>, epoch: u64) -> Ended {
        let (mut write, mut read) = ws.split();
        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            let outgoing = tokio::select! {
                frame = read.next() => {
                    last_seen = Instant::now();
                    match frame {
                        Some(Ok(Message::Text(text))) => match ServerMessage::from_json(&text) {
                            Ok(ServerMessage::Pong { timestamp, .. }) => {
                                debug!(rtt_ms = now_ms().saturating_sub(timestamp), "Pong");
                            }
                            Ok(message) => {
                                if self.inbound.send(ChannelEvent::Message(message)).await.is_err() {
                                    debug!("Inbound receiver dropped");
                                    return Ended::Shutdown;
                                }
                            }
                            Err(e) => warn!("Invalid server message: {}", e),
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Server closed connection");
                            return Ended::Lost;
                        }
                        Some(Err(e)) => {
                            warn!("WebSocket read error: {}", e);
                            return Ended::Lost;
                        }
                        Some(Ok(_)) => {}
                    }
                    continue;
                }
                outbound = self.outbound.recv() => match outbound {
                    Some(Outbound { epoch: Some(bound), .. }) if bound != epoch => {
                        debug!(bound, epoch, "Discarding frame bound to a closed connection");
                        continue;
                    }
                    Some(outbound) => outbound.message,
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        return Ended::Shutdown;
                    }
                },
                _ = heartbeat.tick() => ClientMessage::Ping { timestamp: now_ms() },
                _ = sleep_until(last_seen + self.config.heartbeat_timeout) => {
                    warn!("Heartbeat timed out, dropping connection");
                    return Ended::Lost;
                }
                _ = self.kick.notified() => {
                    info!("Reconnect requested, dropping connection");
                    let _ = write.send(Message::Close(None)).await;
                    return Ended::Lost;
                }
                _ = self.shutdown.recv() => {
                    if let Ok(text) = ClientMessage::Leave.to_json() {
                        let _ = write.send(Message::Text(text)).await;
                    }
                    let _ = write.send(Message::Close(None)).await;
                    return Ended::Shutdown;
                }
            };

            let text = match outgoing.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if let Err(e) = write.send(Message::Text(text)).await {
                warn!("Failed to send message: {}", e);
                return Ended::Lost;
            }
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
