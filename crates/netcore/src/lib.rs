//! A cross-platform, single-threaded cooperative TCP client/server runtime:
//! socket lifecycle and handshake state machine (plaintext and TLS,
//! reconnect), stream framing and event (de)serialization, and a pooled
//! event object with a FIFO delivery queue.
//!
//! [`system::NetworkSystem`] is the one object user code embeds; everything
//! else is implementation detail reachable through it or through
//! [`event`]/[`tags`] for building events to send.

pub mod config;
pub mod error;
pub mod event;
pub mod net;
pub mod system;
pub mod tags;

pub use config::{Config, Security, TlsPaths};
pub use error::NetError;
pub use event::{Event, EventPool, EventPoolCell, EventQueue, Vec4};
pub use system::{EventCallback, NetworkSystem};
pub use tags::{str_to_tag, tag_to_str, Tag};
