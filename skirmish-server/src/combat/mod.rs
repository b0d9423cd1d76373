//! Combat Logic Module
//!
//! Everything that decides what happens in a session. Synchronous and
//! deterministic given a seed; the network layer drives it.
//!
//! ## Module Structure
//!
//! - `state`: session aggregate, combatants, event application
//! - `phase`: phase state machine and end reasons
//! - `grid`: grid geometry and path costs
//! - `log`: append-only action log
//! - `events`: domain events and state deltas
//! - `action`: Action Resolver
//! - `turn`: Turn Resolver
//! - `rules`: pluggable hit/damage/initiative rules
//! - `content`: item and ability lookup
//! - `roster`: encounter input and validation
//! - `reward`: reward payload
//! - `npc`: built-in policy for uncontrolled combatants
//! - `engine`: transactional engine tying the above together

pub mod action;
pub mod content;
pub mod engine;
pub mod error;
pub mod events;
pub mod grid;
pub mod log;
pub mod npc;
pub mod phase;
pub mod reward;
pub mod roster;
pub mod rules;
pub mod state;
pub mod turn;

pub use action::ActionRequest;
pub use content::{ContentCatalog, ContentTable};
pub use engine::{CombatEngine, CombatSnapshot, EngineOptions, SessionArchive};
pub use error::{ActionError, CombatFault, ErrorCode, Rejection};
pub use events::{CombatEvent, SequencedEvent, StateDelta};
pub use grid::{GridPos, GridSpec};
pub use log::{ActionLogEntry, ActionType};
pub use phase::{CombatPhase, EndReason};
pub use reward::Reward;
pub use roster::{EncounterSpec, RosterEntry};
pub use rules::{CombatRules, RulesConfig, StandardRules};
pub use state::{CombatSession, Combatant, CombatantId, CombatantStatus, ObserverId, SessionId};
