//! Observer-side transport.

pub mod backoff;
pub mod channel;

pub use backoff::{Backoff, BackoffConfig};
pub use channel::{ChannelConfig, ChannelError, ChannelEvent, ConnectionChannel, ConnectionStatus};
