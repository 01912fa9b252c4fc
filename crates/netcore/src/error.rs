//! Error taxonomy (§7 of the design).
//!
//! Transient conditions (would-block, in-progress, already-connected) never
//! reach here — the poll loop swallows them and retries next tick. Anything
//! that surfaces as a [`NetError`] is something the socket table turns into
//! either a `failed` state transition, a synthetic `nerr` event toward the
//! user callback, or both.

use std::io;

/// Numeric codes carried in the payload of a synthetic `nerr` event,
/// matching the sentinels the original core used so replay fixtures that
/// assert on these numbers keep working.
pub mod code {
    /// The socket the caller addressed is not in the `connected` state.
    pub const NET_NOT_CONNECTED: i32 = 11_002;
    /// The peer closed the connection.
    pub const NET_DISCONNECTED: i32 = 107;
}

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("socket index {0} is out of range")]
    InvalidSocket(usize),

    #[error("socket {0} is not connected")]
    NotConnected(usize),

    #[error("bind failed on {addr}: {source}")]
    Bind { addr: std::net::SocketAddr, #[source] source: io::Error },

    #[error("listen failed: {0}")]
    Listen(#[source] io::Error),

    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("TLS is not configured for this socket (no key/cert material)")]
    TlsNotConfigured,

    #[error(
        "declared event payload length {declared} exceeds safety cap {cap}, dropping connection"
    )]
    FrameTooLarge { declared: u32, cap: u32 },

    #[error("event get* read past the end of the attached payload ({pos} + {len} > {data_len})")]
    ShortRead { pos: u32, len: u32, data_len: u32 },

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("reconnect budget exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("pool allocation failed for {size} bytes")]
    AllocationFailed { size: usize },
}

impl NetError {
    /// The numeric code to stamp into a synthetic `nerr` event's payload,
    /// if this error has one of the source's well-known sentinel values.
    #[must_use]
    pub const fn as_error_code(&self) -> i32 {
        match self {
            Self::NotConnected(_) => code::NET_NOT_CONNECTED,
            Self::PeerClosed => code::NET_DISCONNECTED,
            _ => -1,
        }
    }

    /// True if this error should drop the socket to `failed` rather than
    /// being absorbed silently.
    #[must_use]
    pub const fn is_fatal_for_socket(&self) -> bool {
        !matches!(self, Self::InvalidSocket(_))
    }
}
