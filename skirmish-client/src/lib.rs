//! # Skirmish Client
//!
//! Observer side of a skirmish combat session.
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                  CombatClient                  │
//! ├────────────────────────────────────────────────┤
//! │  network/  - Reconnecting WebSocket channel    │
//! │  mirror    - Sequenced replica of the session  │
//! │  targeting - Move/attack/effect affordances    │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! The mirror never decides outcomes. It applies the authority's events with
//! the same code the authority uses and resyncs from a snapshot whenever it
//! falls behind.

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod client;
pub mod mirror;
pub mod network;
pub mod targeting;

pub use client::{ClientError, CombatClient};
pub use mirror::{ClientMirror, CommandState, MirrorAction, MirrorError, MirrorUpdate};
pub use network::{ChannelConfig, ChannelError, ChannelEvent, ConnectionChannel, ConnectionStatus};
pub use targeting::Affordances;
