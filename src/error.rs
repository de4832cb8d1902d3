//! Typed errors: protocol/framing, engine-semantic, I/O, and fatal init.

use thiserror::Error;

/// Errors from the wire codec. Never propagated as a panic; either
/// silently dropped or mapped to an ack status code by the protocol handler.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("frame too short: have {have} bytes, need {need}")]
    TooShort { have: usize, need: usize },

    #[error("payload length mismatch: header says {declared}, type requires {expected}")]
    LengthMismatch { declared: u16, expected: u16 },

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("hmac verification failed")]
    InvalidHmac,
}

/// Engine-level semantic errors. Consumed by the protocol handler and
/// translated to in-band ack status codes; never returned to a network
/// caller as-is.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("order {0} not found")]
    UnknownOrder(u64),

    #[error("client {client} does not own order {order}")]
    NotOwner { client: u64, order: u64 },

    #[error("quantity must be positive")]
    InvalidQuantity,

    #[error("price must be positive")]
    InvalidPrice,
}

/// I/O errors that terminate a single session. Never unwinds past the
/// owning connection task.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("peer closed connection")]
    Closed,
}

/// Fatal startup failures. The supervisor (`main`) reports these and
/// exits before the reactor starts.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to bind TCP listener on {addr}: {source}")]
    TcpBind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open multicast socket: {0}")]
    Multicast(#[source] std::io::Error),

    #[error("failed to join multicast group {group}: {source}")]
    MulticastJoin {
        group: std::net::Ipv4Addr,
        #[source]
        source: std::io::Error,
    },
}
