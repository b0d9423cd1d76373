//! Network Layer
//!
//! WebSocket transport, per-session authority actors and the session
//! registry. This layer is **non-deterministic**; all combat rules run
//! through `combat/`.

pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use registry::SessionRegistry;
pub use server::{CombatServer, CombatServerError, ServerConfig};
pub use session::{
    AuthorityConfig, AuthorityHandle, ConnectionToken, SessionAuthority, SessionError,
};

use std::str::FromStr;

use tracing::warn;

/// Parse an environment variable, falling back to `default` when it is
/// unset or malformed.
pub fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, ?default, "Invalid environment value, using default");
                default
            }
        },
        Err(_) => default,
    }
}
