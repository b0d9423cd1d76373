//! Skirmish Watch
//!
//! Connects to a combat session as an observer and logs the mirrored state.
//! Configure with `SKIRMISH_SERVER_URL`, `SKIRMISH_SESSION` and
//! `SKIRMISH_OBSERVER`.

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use skirmish::combat::events::CombatEvent;
use skirmish::network::protocol::ServerMessage;
use skirmish_client::{ChannelConfig, CombatClient, ConnectionStatus};

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;

    let config = ChannelConfig::from_env();
    info!("Watching {}", config.endpoint());

    let mut client = CombatClient::connect(config);
    let mut status = client.watch_status();

    loop {
        tokio::select! {
            message = client.next_message() => match message {
                Some(message) => log_message(&client, &message),
                None => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                match current {
                    ConnectionStatus::Reconnecting { attempt, retry_in } => {
                        warn!("Connection lost, retry #{} in {:?}", attempt, retry_in);
                    }
                    ConnectionStatus::Closed => break,
                    other => info!("Connection: {:?}", other),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, leaving session");
                break;
            }
        }
    }

    client.close().await;
    Ok(())
}

fn log_message(client: &CombatClient, message: &ServerMessage) {
    match message {
        ServerMessage::State(snapshot) => info!(
            "Snapshot: round {}, phase {:?}, {} log entries, hash {}",
            snapshot.session.round,
            snapshot.session.phase,
            snapshot.session.action_log.len(),
            snapshot.state_hash
        ),
        ServerMessage::Event { seq, event, .. } => match event {
            CombatEvent::ActionResolved(resolved) => info!(
                "[{}] #{} {}: {}",
                seq, resolved.entry.sequence, resolved.entry.actor_name, resolved.entry.result.message
            ),
            CombatEvent::TurnStart { combatant_id, .. } => {
                let affordances = client.affordances(false);
                if affordances.actor.is_some() {
                    info!(
                        "[{}] Your turn ({}): {} cells reachable, targets {:?}",
                        seq,
                        combatant_id,
                        affordances.reachable.len(),
                        affordances.attack_targets
                    );
                } else {
                    info!("[{}] Turn: {}", seq, combatant_id);
                }
            }
            CombatEvent::RoundEnd { round, .. } => info!("[{}] --- Round {} ---", seq, round),
            CombatEvent::CombatEnd { reason, rewards } => {
                info!("[{}] Combat ended: {} (rewards: {:?})", seq, reason, rewards)
            }
            other => info!("[{}] {}", seq, other.type_name()),
        },
        ServerMessage::Error { rejection, .. } => {
            warn!("Error {}: {}", rejection.code.as_str(), rejection.message)
        }
        ServerMessage::Pong { .. } => {}
    }
}
