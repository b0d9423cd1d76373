//! Core deterministic primitives.
//!
//! Seeded randomness and canonical state hashing. Nothing here reads the
//! clock or iterates unordered collections, so a session replayed from the
//! same seed and commands hashes identically on every platform.

pub mod hash;
pub mod rng;

pub use hash::{digest, Canonical, StateHash, StateHasher};
pub use rng::{derive_session_seed, DeterministicRng};
