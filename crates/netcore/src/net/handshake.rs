//! The handshake state machine (§4.2): drives plaintext and TLS negotiation
//! to completion or failure, independent of how the poll loop discovered
//! readiness.
//!
//! These functions are pure decision logic over a single [`SocketRecord`];
//! `table.rs` is responsible for calling the right one at the right time
//! (on accept, on writable-while-starting, on every tick while
//! handshaking) and for turning [`HandshakeOutcome`] into socket-table and
//! event-queue side effects.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::config::{Config, Security};
use crate::error::NetError;
use crate::net::socket::{SocketRecord, StreamKind};
use crate::net::tls::{self, TlsConn};

pub enum HandshakeOutcome {
    /// Still in progress; call again next tick.
    Pending,
    Connected,
    Failed(NetError),
}

fn timed_out(rec: &SocketRecord, cfg: &Config) -> bool {
    let out = rec.handshake_started.is_some_and(|start| start.elapsed() >= cfg.handshake_timeout);
    if out {
        debug!(token = ?rec.token, "handshake deadline exceeded");
    }
    out
}

/// Drives a server-side accepted socket (freshly `accept()`ed, state
/// `handshaking`) one step forward.
pub fn drive_server(rec: &mut SocketRecord, cfg: &Config, tls_cfg: Option<&Arc<rustls::ServerConfig>>) -> HandshakeOutcome {
    let plain = rec.security.contains(Security::PLAIN);
    let tls_on = rec.security.contains(Security::TLS);

    if plain && tls_on {
        return drive_both_server(rec, cfg, tls_cfg);
    }
    if tls_on {
        return drive_tls_only_server(rec, cfg, tls_cfg);
    }
    if plain {
        return HandshakeOutcome::Connected;
    }
    HandshakeOutcome::Failed(NetError::TlsNotConfigured)
}

fn drive_tls_only_server(rec: &mut SocketRecord, cfg: &Config, tls_cfg: Option<&Arc<rustls::ServerConfig>>) -> HandshakeOutcome {
    if matches!(rec.stream, StreamKind::Plain(_)) {
        let Some(tls_cfg) = tls_cfg else { return HandshakeOutcome::Failed(NetError::TlsNotConfigured) };
        match rustls::ServerConnection::new(Arc::clone(tls_cfg)) {
            Ok(conn) => rec.upgrade_to_tls(TlsConn::Server(conn)),
            Err(e) => return HandshakeOutcome::Failed(NetError::TlsHandshake(e.to_string())),
        }
    }
    step_tls(rec, cfg)
}

fn drive_both_server(rec: &mut SocketRecord, cfg: &Config, tls_cfg: Option<&Arc<rustls::ServerConfig>>) -> HandshakeOutcome {
    if matches!(rec.stream, StreamKind::Plain(_)) {
        match rec.pump_preamble_read() {
            Ok(true) => {
                if let Err(e) = rec.write_preamble() {
                    return HandshakeOutcome::Failed(NetError::Io(e));
                }
                let Some(tls_cfg) = tls_cfg else { return HandshakeOutcome::Failed(NetError::TlsNotConfigured) };
                match rustls::ServerConnection::new(Arc::clone(tls_cfg)) {
                    Ok(conn) => rec.upgrade_to_tls(TlsConn::Server(conn)),
                    Err(e) => return HandshakeOutcome::Failed(NetError::TlsHandshake(e.to_string())),
                }
            }
            Ok(false) => {
                return if timed_out(rec, cfg) {
                    HandshakeOutcome::Failed(NetError::TlsHandshake("preamble timeout".into()))
                } else {
                    HandshakeOutcome::Pending
                };
            }
            Err(e) => return HandshakeOutcome::Failed(NetError::Io(e)),
        }
    }
    step_tls(rec, cfg)
}

/// Drives a client-side socket that has just become writable (connect
/// completed) forward into security negotiation.
pub fn drive_client_start(rec: &mut SocketRecord, tls_cfg: Option<&Arc<rustls::ClientConfig>>, server_name: &str) -> HandshakeOutcome {
    let plain = rec.security.contains(Security::PLAIN);
    let tls_on = rec.security.contains(Security::TLS);

    if plain && !tls_on {
        return HandshakeOutcome::Connected;
    }
    if plain && tls_on {
        if let Err(e) = rec.write_preamble() {
            return HandshakeOutcome::Failed(NetError::Io(e));
        }
        return HandshakeOutcome::Pending;
    }
    if tls_on {
        return start_tls_client(rec, tls_cfg, server_name);
    }
    HandshakeOutcome::Failed(NetError::TlsNotConfigured)
}

/// Drives a client socket already in `handshaking` forward.
pub fn drive_client_continue(
    rec: &mut SocketRecord,
    cfg: &Config,
    tls_cfg: Option<&Arc<rustls::ClientConfig>>,
    server_name: &str,
) -> HandshakeOutcome {
    if matches!(rec.stream, StreamKind::Plain(_)) {
        // `plain | tls`: waiting for the server's preamble ack before we
        // upgrade our side.
        match rec.pump_preamble_read() {
            Ok(true) => start_tls_client(rec, tls_cfg, server_name),
            Ok(false) => {
                if timed_out(rec, cfg) {
                    HandshakeOutcome::Failed(NetError::TlsHandshake("preamble timeout".into()))
                } else {
                    HandshakeOutcome::Pending
                }
            }
            Err(e) => HandshakeOutcome::Failed(NetError::Io(e)),
        }
    } else {
        step_tls(rec, cfg)
    }
}

fn start_tls_client(rec: &mut SocketRecord, tls_cfg: Option<&Arc<rustls::ClientConfig>>, server_name: &str) -> HandshakeOutcome {
    let Some(tls_cfg) = tls_cfg else { return HandshakeOutcome::Failed(NetError::TlsNotConfigured) };
    let Ok(name) = rustls_pki_types::ServerName::try_from(server_name.to_string()) else {
        return HandshakeOutcome::Failed(NetError::TlsHandshake(format!("invalid server name {server_name}")));
    };
    match rustls::ClientConnection::new(Arc::clone(tls_cfg), name) {
        Ok(conn) => {
            trace!(token = ?rec.token, server_name, "starting TLS client handshake");
            rec.upgrade_to_tls(TlsConn::Client(conn));
            HandshakeOutcome::Pending
        }
        Err(e) => HandshakeOutcome::Failed(NetError::TlsHandshake(e.to_string())),
    }
}

fn step_tls(rec: &mut SocketRecord, cfg: &Config) -> HandshakeOutcome {
    match rec.step_tls_handshake() {
        tls::HandshakeStep::Done => {
            trace!(token = ?rec.token, "TLS handshake complete");
            HandshakeOutcome::Connected
        }
        tls::HandshakeStep::Failed(e) => HandshakeOutcome::Failed(e),
        tls::HandshakeStep::Handshaking => {
            if timed_out(rec, cfg) {
                HandshakeOutcome::Failed(NetError::TlsHandshake("handshake deadline exceeded".into()))
            } else {
                HandshakeOutcome::Pending
            }
        }
    }
}
