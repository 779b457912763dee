//! Error types for rally sessions and the overlay they run on.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::key::Key;

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors delivered to session observers.
///
/// Observers each receive their own copy, so overlay failures are carried as their rendered
/// message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The overlay could not be joined.
    #[error("could not join the overlay: {0}")]
    Join(String),

    /// A single search for the rally point failed.
    #[error("search for the rally point failed: {0}")]
    Lookup(String),

    /// The overlay knows no other nodes at all.
    #[error("could not connect to any nodes on the DHT, are you connected to the internet?")]
    NoConnectivity,

    /// No identifier closer to the rally point than `competitor` could be built.
    #[error("no identifier closer to the rally point than {competitor} exists")]
    Synthesis { competitor: Key },

    /// Sessions need a non-empty rally name.
    #[error("rally name must not be empty")]
    EmptyRallyName,
}

/// Errors raised by an overlay implementation.
#[derive(Debug, Error)]
pub enum OverlayError {
    /// The socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Nodes were queried but none of them answered.
    #[error("none of the {0} queried nodes answered")]
    Unreachable(usize),

    /// A message could not be encoded.
    #[error("could not encode message: {0}")]
    Encode(#[from] bincode::Error),

    /// Any other socket failure.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}
