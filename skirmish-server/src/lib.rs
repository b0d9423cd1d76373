//! # Skirmish Combat Server
//!
//! Authoritative engine for turn-based tactical combat sessions. A session
//! authority owns each encounter, resolves commands against deterministic
//! rules and streams sequenced events to every connected observer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    SKIRMISH SERVER                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── rng.rs      - Seeded Xorshift128+ PRNG                  │
//! │  └── hash.rs     - Canonical state hashing                   │
//! │                                                              │
//! │  combat/         - Combat rules (deterministic)              │
//! │  ├── state.rs    - Session, combatants, event application   │
//! │  ├── phase.rs    - Phase machine and end reasons             │
//! │  ├── turn.rs     - Initiative, turn order, end conditions    │
//! │  ├── action.rs   - Command validation and resolution         │
//! │  ├── engine.rs   - Transactional session engine              │
//! │  ├── npc.rs      - NPC turn policy                           │
//! │  └── ...         - grid, rules, content, roster, rewards     │
//! │                                                              │
//! │  network/        - Networking (non-deterministic)            │
//! │  ├── server.rs   - WebSocket server                          │
//! │  ├── session.rs  - Per-session authority actor               │
//! │  ├── registry.rs - Session registry                          │
//! │  └── protocol.rs - Wire envelope                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism Guarantee
//!
//! The `core/` and `combat/` modules are deterministic:
//! - No HashMap (BTreeMap for sorted iteration)
//! - No wall-clock input to rule decisions
//! - All randomness from the seeded session RNG
//!
//! Given the same encounter, seed and command sequence, a session reaches the
//! same state hash on every run.

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod combat;
pub mod core;
pub mod network;

// Re-export commonly used types
pub use combat::action::ActionRequest;
pub use combat::engine::{CombatEngine, CombatSnapshot, SessionArchive};
pub use combat::events::CombatEvent;
pub use combat::roster::{EncounterSpec, RosterEntry};
pub use combat::state::{CombatSession, Combatant, CombatantId, ObserverId, SessionId};
pub use core::rng::DeterministicRng;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
