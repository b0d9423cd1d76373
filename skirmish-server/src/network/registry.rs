//! Session Registry
//!
//! Maps session ids to running authorities. Each session gets its own
//! authority task; the registry forgets it when the task finishes and
//! publishes the archive to outcome subscribers.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{error, info};

use crate::combat::content::ContentCatalog;
use crate::combat::engine::{CombatEngine, EngineOptions, SessionArchive};
use crate::combat::roster::EncounterSpec;
use crate::combat::rules::{CombatRules, StandardRules};
use crate::combat::state::SessionId;
use crate::network::session::{AuthorityConfig, AuthorityHandle, SessionAuthority, SessionError};

/// Running sessions, keyed by id.
pub struct SessionRegistry {
    sessions: Arc<RwLock<BTreeMap<SessionId, AuthorityHandle>>>,
    rules: Arc<dyn CombatRules>,
    content: Arc<dyn ContentCatalog>,
    config: AuthorityConfig,
    outcomes: broadcast::Sender<SessionArchive>,
}

impl SessionRegistry {
    /// Registry using [`StandardRules`] built from `config.rules`.
    pub fn new(config: AuthorityConfig, content: Arc<dyn ContentCatalog>) -> Self {
        let rules: Arc<dyn CombatRules> = Arc::new(StandardRules::new(config.rules.clone()));
        let (outcomes, _) = broadcast::channel(64);
        Self {
            sessions: Arc::new(RwLock::new(BTreeMap::new())),
            rules,
            content,
            config,
            outcomes,
        }
    }

    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    /// Validate the encounter, spawn its authority and register it.
    pub async fn create_session(&self, spec: EncounterSpec) -> Result<AuthorityHandle, SessionError> {
        let engine = CombatEngine::new(
            spec,
            Arc::clone(&self.rules),
            Arc::clone(&self.content),
            EngineOptions {
                max_rounds: self.config.max_rounds,
            },
        )?;
        let session_id = engine.session_id().clone();

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session_id) {
            return Err(SessionError::AlreadyExists(session_id));
        }

        let (handle, join) = SessionAuthority::spawn(engine, self.config.clone());
        sessions.insert(session_id.clone(), handle.clone());
        drop(sessions);

        let registry = Arc::clone(&self.sessions);
        let outcomes = self.outcomes.clone();
        tokio::spawn(async move {
            let archive = join.await;
            registry.write().await.remove(&session_id);
            match archive {
                Ok(archive) => {
                    info!(session = %session_id, reason = %archive.reason, "Session concluded");
                    let _ = outcomes.send(archive);
                }
                Err(e) => error!(session = %session_id, "Session authority failed: {}", e),
            }
        });

        info!(session = %handle.session_id(), "Session created");
        Ok(handle)
    }

    /// Get a session by id.
    pub async fn get(&self, id: &SessionId) -> Option<AuthorityHandle> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Abort and unregister a session.
    pub async fn remove(&self, id: &SessionId) -> Result<(), SessionError> {
        let handle = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        handle.abort().await
    }

    /// Get running session count.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Archives of concluded sessions, for reward delivery.
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<SessionArchive> {
        self.outcomes.subscribe()
    }

    /// Abort every running session.
    pub async fn shutdown(&self) {
        let handles: Vec<AuthorityHandle> = self.sessions.read().await.values().cloned().collect();
        for handle in handles {
            let _ = handle.abort().await;
        }
    }
}
