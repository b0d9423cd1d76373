//! Skirmish Combat Server
//!
//! `skirmish-server` serves combat sessions over WebSocket.
//! `skirmish-server demo` runs an NPC-only encounter locally and verifies
//! that a replay from the same seed reaches the same state hash.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use skirmish::{
    combat::{
        content::{ContentCatalog, ContentTable},
        engine::{CombatEngine, EngineOptions},
        events::CombatEvent,
        grid::{GridPos, GridSpec},
        roster::{EncounterSpec, RosterEntry},
        rules::{RulesConfig, StandardRules},
        state::CombatStats,
    },
    network::{AuthorityConfig, CombatServer, ServerConfig, SessionRegistry},
    VERSION,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;

    info!("Skirmish Server v{}", VERSION);

    match std::env::args().nth(1).as_deref() {
        Some("demo") => demo_encounter(),
        _ => serve().await,
    }
}

async fn serve() -> Result<()> {
    let server_config = ServerConfig::from_env();
    let authority_config = AuthorityConfig::from_env();
    info!(
        max_rounds = authority_config.max_rounds,
        turn_timeout = ?authority_config.turn_timeout,
        "Authority config loaded"
    );

    let content: Arc<dyn ContentCatalog> = match std::env::var("SKIRMISH_CONTENT") {
        Ok(path) => {
            let json = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            Arc::new(ContentTable::from_json(&json).with_context(|| format!("parsing {path}"))?)
        }
        Err(_) => Arc::new(ContentTable::starter()),
    };
    let registry = Arc::new(SessionRegistry::new(authority_config, content));

    if let Ok(path) = std::env::var("SKIRMISH_ENCOUNTER") {
        let json = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
        let spec: EncounterSpec = serde_json::from_str(&json).with_context(|| format!("parsing {path}"))?;
        let handle = registry.create_session(spec).await?;
        info!("Session {} ready at /combat/{}", handle.session_id(), handle.session_id());
    }

    // Reward delivery consumes archives; here they are only logged.
    let mut outcomes = registry.subscribe_outcomes();
    tokio::spawn(async move {
        while let Ok(archive) = outcomes.recv().await {
            let size = archive.to_bytes().map(|b| b.len()).unwrap_or_default();
            info!(
                session = %archive.session_id,
                reason = %archive.reason,
                rewards = ?archive.rewards,
                hash = %hex::encode(archive.final_hash),
                archive_bytes = size,
                "Session archived"
            );
        }
    });

    let server = CombatServer::new(server_config, registry.clone());
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            server.shutdown();
            registry.shutdown().await;
        }
    }

    Ok(())
}

/// Run a seeded NPC-only encounter twice and compare the results.
fn demo_encounter() -> Result<()> {
    info!("=== Starting Demo Encounter ===");

    let spec = demo_spec();
    let (events, hash) = run_to_end(spec.clone())?;

    for event in &events {
        match event {
            CombatEvent::InitiativeRolled { turn_order, .. } => {
                let order: Vec<&str> = turn_order.iter().map(|c| c.as_str()).collect();
                info!("Turn order: {}", order.join(" > "));
            }
            CombatEvent::ActionResolved(resolved) => {
                info!(
                    "#{} {}: {}",
                    resolved.entry.sequence, resolved.entry.actor_name, resolved.entry.result.message
                );
            }
            CombatEvent::RoundEnd { round, .. } => info!("--- Round {} ---", round),
            CombatEvent::CombatEnd { reason, rewards } => {
                info!("Combat ended: {} (rewards: {:?})", reason, rewards);
            }
            _ => {}
        }
    }

    info!("Total events: {}", events.len());
    info!("Final State Hash: {}", hex::encode(hash));

    // Verify determinism by replaying
    info!("=== Verifying Determinism ===");
    let (_, replay_hash) = run_to_end(spec)?;
    info!("Replay State Hash: {}", hex::encode(replay_hash));

    if hash == replay_hash {
        info!("DETERMINISM VERIFIED: Hashes match!");
    } else {
        warn!("DETERMINISM FAILURE: Hashes differ!");
    }
    Ok(())
}

fn run_to_end(spec: EncounterSpec) -> Result<(Vec<CombatEvent>, [u8; 32])> {
    let mut engine = CombatEngine::new(
        spec,
        Arc::new(StandardRules::new(RulesConfig::default())),
        Arc::new(ContentTable::starter()),
        EngineOptions::default(),
    )?;

    let mut events: Vec<CombatEvent> = engine.start()?.into_iter().map(|e| e.event).collect();
    while let Some(step) = engine.step_npc() {
        events.extend(step.into_iter().map(|e| e.event));
    }
    Ok((events, engine.state_hash()))
}

fn demo_spec() -> EncounterSpec {
    let knight = CombatStats {
        attack_power: 7,
        defense: 2,
        ..CombatStats::default()
    };
    let archer = CombatStats {
        attack_range: 4,
        accuracy: 2,
        ..CombatStats::default()
    };

    EncounterSpec::new(
        GridSpec::open(10, 10).with_blocked([GridPos::new(4, 4), GridPos::new(4, 5), GridPos::new(5, 4)]),
        vec![
            RosterEntry::new("knight", "Knight", 24, GridPos::new(1, 1)).ally().stats(knight),
            RosterEntry::new("archer", "Archer", 16, GridPos::new(0, 2)).ally().stats(archer),
            RosterEntry::new("orc-1", "Orc", 14, GridPos::new(8, 8)),
            RosterEntry::new("orc-2", "Orc Brute", 18, GridPos::new(9, 7)),
            RosterEntry::new("shaman", "Goblin Shaman", 10, GridPos::new(7, 9)),
        ],
    )
    .with_session_id("demo")
    .with_seed(12345)
}
