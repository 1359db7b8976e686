//! Single-instance coordination.
//!
//! The first launch owns a local rendezvous endpoint; later launches hand
//! their folder argument to it over a one-message channel and exit.

pub mod arbiter;
pub mod channel;
pub mod endpoint;

pub use arbiter::{try_become_primary, Arbitration, Handshake, PrimaryHandle, RendezvousError};
pub use channel::ChannelError;
pub use endpoint::Endpoint;
