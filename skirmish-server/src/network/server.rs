//! WebSocket Combat Server
//!
//! Accepts observer connections on `/combat/{sessionId}?observer={id}`,
//! attaches them to the session authority and relays frames both ways.
//! Heartbeats run in both directions: the server pings each socket and drops
//! it when nothing arrives within the heartbeat timeout, and answers `PING`
//! frames with `PONG`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::combat::error::{ErrorCode, Rejection};
use crate::combat::state::{ObserverId, SessionId};
use crate::network::env_or;
use crate::network::protocol::{ClientMessage, ServerMessage};
use crate::network::registry::SessionRegistry;
use crate::network::session::SessionError;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Interval between server pings.
    pub heartbeat_interval: Duration,
    /// A connection silent for this long is dropped.
    pub heartbeat_timeout: Duration,
    /// Per-connection event buffer; overflowing it detaches the observer.
    pub outbox_capacity: usize,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            outbox_capacity: 256,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Read `SKIRMISH_*` overrides on top of the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_or("SKIRMISH_BIND_ADDR", defaults.bind_addr),
            max_connections: env_or("SKIRMISH_MAX_CONNECTIONS", defaults.max_connections),
            heartbeat_interval: Duration::from_secs(env_or(
                "SKIRMISH_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval.as_secs(),
            )),
            heartbeat_timeout: Duration::from_secs(env_or(
                "SKIRMISH_HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat_timeout.as_secs(),
            )),
            outbox_capacity: env_or("SKIRMISH_OUTBOX_CAPACITY", defaults.outbox_capacity).max(1),
            version: defaults.version,
        }
    }
}

/// Combat server errors.
#[derive(Debug, thiserror::Error)]
pub enum CombatServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Session error.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// A connected observer.
#[derive(Debug, Clone)]
struct ConnectedObserver {
    session_id: SessionId,
    observer_id: ObserverId,
    connected_at: Instant,
}

/// The combat server.
pub struct CombatServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    connections: Arc<RwLock<BTreeMap<SocketAddr, ConnectedObserver>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl CombatServer {
    /// Create a new combat server.
    pub fn new(config: ServerConfig, registry: Arc<SessionRegistry>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            registry,
            connections: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), CombatServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), CombatServerError> {
        info!("Combat server {} listening on {}", self.config.version, listener.local_addr()?);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let connection_count = self.connections.read().await.len();
                            if connection_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let registry = self.registry.clone();
        let connections = self.connections.clone();
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut target: Option<(String, Option<String>)> = None;
            let capture = |req: &Request, resp: Response| {
                target = Some((req.uri().path().to_string(), req.uri().query().map(str::to_string)));
                Ok::<Response, ErrorResponse>(resp)
            };
            let mut ws_stream = match accept_hdr_async(stream, capture).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let route = target
                .as_ref()
                .and_then(|(path, query)| parse_route(path, query.as_deref()));
            let handle = match &route {
                Some((session_id, _)) => registry.get(session_id).await,
                None => None,
            };
            let (Some((session_id, observer_id)), Some(handle)) = (route, handle) else {
                debug!("Client {} asked for an unknown session: {:?}", addr, target);
                let reply = ServerMessage::Error {
                    request_id: None,
                    rejection: Rejection::new(ErrorCode::SessionNotFound, "no such session"),
                };
                if let Ok(text) = reply.to_json() {
                    let _ = ws_stream.send(Message::Text(text)).await;
                }
                let _ = ws_stream.close(None).await;
                return;
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (outbox_tx, mut outbox_rx) = mpsc::channel::<ServerMessage>(config.outbox_capacity);
            let (direct_tx, mut direct_rx) = mpsc::channel::<ServerMessage>(16);

            let token = match handle.attach(observer_id.clone(), outbox_tx).await {
                Ok(token) => token,
                Err(e) => {
                    warn!("Could not attach {} to {}: {}", observer_id, session_id, e);
                    return;
                }
            };

            {
                let mut connections = connections.write().await;
                connections.insert(addr, ConnectedObserver {
                    session_id: session_id.clone(),
                    observer_id: observer_id.clone(),
                    connected_at: Instant::now(),
                });
            }
            info!(session = %session_id, observer = %observer_id, "Observer connected from {}", addr);

            // Writer: authority events, direct replies and server pings.
            let heartbeat_interval = config.heartbeat_interval;
            let mut sender_task = tokio::spawn(async move {
                let mut ping = interval(heartbeat_interval);
                ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    let msg = tokio::select! {
                        msg = outbox_rx.recv() => match msg {
                            Some(msg) => msg,
                            None => {
                                // The authority dropped this attachment.
                                let _ = ws_sender.send(Message::Close(None)).await;
                                break;
                            }
                        },
                        Some(msg) = direct_rx.recv() => msg,
                        _ = ping.tick() => {
                            if ws_sender.send(Message::Ping(Vec::new())).await.is_err() {
                                break;
                            }
                            continue;
                        }
                    };

                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            // Reader: client frames, with a heartbeat watchdog.
            let mut last_seen = Instant::now();
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        last_seen = Instant::now();
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let client_msg = match ClientMessage::from_json(&text) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        let _ = direct_tx.send(ServerMessage::Error {
                                            request_id: None,
                                            rejection: Rejection::new(ErrorCode::InvalidMessage, e.to_string()),
                                        }).await;
                                        continue;
                                    }
                                };

                                let delivered = match client_msg {
                                    ClientMessage::Command { request_id, request } => {
                                        handle.submit(observer_id.clone(), request_id, request).await
                                    }
                                    ClientMessage::Ping { timestamp } => {
                                        let _ = direct_tx.send(ServerMessage::Pong {
                                            timestamp,
                                            server_time: server_time_ms(),
                                        }).await;
                                        Ok(())
                                    }
                                    ClientMessage::Resync => handle.resync(observer_id.clone()).await,
                                    ClientMessage::Leave => {
                                        debug!("Client {} left", addr);
                                        break;
                                    }
                                };
                                if delivered.is_err() {
                                    debug!("Session {} closed under client {}", session_id, addr);
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                warn!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            Some(Ok(_)) => {}
                        }
                    }
                    _ = sleep_until(last_seen + config.heartbeat_timeout) => {
                        warn!("Client {} missed heartbeats, dropping", addr);
                        break;
                    }
                    _ = &mut sender_task => {
                        debug!("Outbound stream for {} closed", addr);
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }

            // Cleanup
            sender_task.abort();
            let _ = handle.detach(observer_id.clone(), token).await;

            let connected_for = connections
                .write()
                .await
                .remove(&addr)
                .map(|c| c.connected_at.elapsed());
            info!(
                session = %session_id,
                observer = %observer_id,
                "Client {} cleaned up after {:?}",
                addr,
                connected_for.unwrap_or_default()
            );
        });
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Observers currently connected to a session.
    pub async fn observers_of(&self, session_id: &SessionId) -> Vec<ObserverId> {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| &c.session_id == session_id)
            .map(|c| c.observer_id.clone())
            .collect()
    }

    /// Get running session count.
    pub async fn session_count(&self) -> usize {
        self.registry.session_count().await
    }
}

/// Split `/combat/{sessionId}?observer={id}`. Connections without an
/// observer id watch as an anonymous spectator.
fn parse_route(path: &str, query: Option<&str>) -> Option<(SessionId, ObserverId)> {
    let session = path.strip_prefix("/combat/")?.trim_end_matches('/');
    if session.is_empty() || session.contains('/') {
        return None;
    }
    let observer = query
        .and_then(|q| q.split('&').find_map(|pair| pair.strip_prefix("observer=")))
        .filter(|o| !o.is_empty())
        .map(ObserverId::from)
        .unwrap_or_else(|| ObserverId::new(format!("spectator-{}", Uuid::new_v4())));
    Some((SessionId::from(session), observer))
}

fn server_time_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combat::action::ActionRequest;
    use crate::combat::content::ContentTable;
    use crate::combat::engine::testing::duel_spec;
    use crate::combat::events::CombatEvent;
    use crate::network::session::AuthorityConfig;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    const WAIT: Duration = Duration::from_secs(5);

    fn registry() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(
            AuthorityConfig::default(),
            Arc::new(ContentTable::starter()),
        ))
    }

    async fn start(registry: Arc<SessionRegistry>) -> (Arc<CombatServer>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(CombatServer::new(ServerConfig::default(), registry));
        let serving = server.clone();
        tokio::spawn(async move { serving.serve(listener).await });
        (server, addr)
    }

    async fn recv_message(ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>) -> ServerMessage {
        loop {
            let frame = tokio::time::timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
            if let Message::Text(text) = frame {
                return ServerMessage::from_json(&text).unwrap();
            }
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(15));
        assert_eq!(config.outbox_capacity, 256);
    }

    #[test]
    fn test_parse_route() {
        let (session, observer) = parse_route("/combat/duel", Some("observer=p1")).unwrap();
        assert_eq!(session.as_str(), "duel");
        assert_eq!(observer.as_str(), "p1");

        let (_, spectator) = parse_route("/combat/duel/", None).unwrap();
        assert!(spectator.as_str().starts_with("spectator-"));

        assert!(parse_route("/combat/", None).is_none());
        assert!(parse_route("/lobby/duel", None).is_none());
        assert!(parse_route("/combat/a/b", None).is_none());
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = CombatServer::new(ServerConfig::default(), registry());

        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_serving_and_drops_connections() {
        let registry = registry();
        registry.create_session(duel_spec()).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(CombatServer::new(ServerConfig::default(), registry));
        let serving = server.clone();
        let task = tokio::spawn(async move { serving.serve(listener).await });

        let (mut ws, _) = connect_async(format!("ws://{addr}/combat/duel?observer=p1"))
            .await
            .unwrap();
        assert!(matches!(recv_message(&mut ws).await, ServerMessage::State(_)));

        server.shutdown();
        let served = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert!(served.is_ok());

        let closed = tokio::time::timeout(WAIT, async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_session_gets_error() {
        let (_server, addr) = start(registry()).await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/combat/nope?observer=p1"))
            .await
            .unwrap();

        match recv_message(&mut ws).await {
            ServerMessage::Error { rejection, .. } => {
                assert_eq!(rejection.code, ErrorCode::SessionNotFound)
            }
            other => panic!("expected ERROR, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_observer_round_trip() {
        let registry = registry();
        registry.create_session(duel_spec()).await.unwrap();
        let (server, addr) = start(registry).await;

        let (mut ws, _) = connect_async(format!("ws://{addr}/combat/duel?observer=p1"))
            .await
            .unwrap();
        assert!(matches!(recv_message(&mut ws).await, ServerMessage::State(_)));
        assert_eq!(server.observers_of(&SessionId::from("duel")).await.len(), 1);

        let ping = ClientMessage::Ping { timestamp: 42 }.to_json().unwrap();
        ws.send(Message::Text(ping)).await.unwrap();
        match recv_message(&mut ws).await {
            ServerMessage::Pong { timestamp, .. } => assert_eq!(timestamp, 42),
            other => panic!("expected PONG, got {other:?}"),
        }

        ws.send(Message::Text("{not json".into())).await.unwrap();
        match recv_message(&mut ws).await {
            ServerMessage::Error { rejection, .. } => {
                assert_eq!(rejection.code, ErrorCode::InvalidMessage)
            }
            other => panic!("expected ERROR, got {other:?}"),
        }

        let command = ClientMessage::command("r1", ActionRequest::Defend {}).to_json().unwrap();
        ws.send(Message::Text(command)).await.unwrap();
        match recv_message(&mut ws).await {
            ServerMessage::Event {
                request_id,
                event: CombatEvent::ActionResolved(resolved),
                ..
            } => {
                assert_eq!(request_id.as_deref(), Some("r1"));
                assert!(resolved.entry.result.success);
            }
            other => panic!("expected ACTION_RESULT, got {other:?}"),
        }
    }
}
