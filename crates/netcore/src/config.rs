//! Runtime configuration knobs (§4.1).
//!
//! Mirrors the setter API of the original core (`netSetSelectInterval`,
//! `netSetReconnectInterval`, ...) as a plain config struct plus builder
//! methods on [`NetworkSystem`](crate::system::NetworkSystem), rather than a
//! parsed file or environment variables — the core reads none of either.

use std::path::PathBuf;

use netcore_timing::Nanos;

bitflags::bitflags! {
    /// Security level bitmask (§6). `PLAIN | TLS` means: speak the
    /// [`TLS_UPGRADE_PREAMBLE`](crate::net::handshake::TLS_UPGRADE_PREAMBLE)
    /// literal first, then upgrade the same socket to TLS.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Security: u8 {
        const FAIL  = 1;
        const PLAIN = 2;
        const TLS   = 4;
    }
}

impl Default for Security {
    fn default() -> Self {
        Self::PLAIN
    }
}

/// TLS key/certificate material paths. Relative paths are resolved against
/// the process working directory, matching the source.
#[derive(Clone, Debug, Default)]
pub struct TlsPaths {
    pub public_key: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub cert_dir: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
}

/// Process-wide configuration for a [`NetworkSystem`](crate::system::NetworkSystem).
#[derive(Clone, Debug)]
pub struct Config {
    /// Minimum time between `processQueue` readiness polls.
    pub select_interval: Nanos,
    /// Time between reconnect attempts for a `failed` client socket.
    pub reconnect_interval: Nanos,
    /// Default reconnect budget assigned to new client sockets.
    pub reconnect_limit: u32,
    /// Default security level for sockets that don't override it.
    pub security_level: Security,
    pub tls: TlsPaths,
    /// Wall-clock deadline for an in-progress handshake before it is
    /// declared failed.
    pub handshake_timeout: Nanos,
    /// Safety cap on a declared frame `dataLen`; larger values are treated
    /// as a protocol violation rather than an oversized-but-valid event.
    pub max_frame_len: u32,
    /// Requests above this size bypass the event pool's bins and go
    /// straight to the general allocator (§4.4).
    pub max_pool_size: usize,
    pub verbose: bool,
    pub flow: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            select_interval: Nanos::from_millis(1),
            reconnect_interval: Nanos::from_millis(2_000),
            reconnect_limit: 5,
            security_level: Security::default(),
            tls: TlsPaths::default(),
            handshake_timeout: Nanos::from_secs(10),
            max_frame_len: 16 * 1024 * 1024,
            max_pool_size: 64 * 1024 * 1024,
            verbose: false,
            flow: false,
        }
    }
}
