//! The network layer: framing, TLS, per-socket state, and the socket
//! table that drives them all from one non-blocking poll loop.

mod codec;
mod handshake;
mod socket;
mod table;
pub mod tls;

pub use codec::{xor_checksum, FrameReader};
pub use handshake::HandshakeOutcome;
pub use socket::{Role, SocketRecord, SocketState, StreamKind};
pub use table::{SocketEvent, SocketTable};
