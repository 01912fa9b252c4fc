//! Non-blocking TLS handshake and data pump (§4.2, §3 "TLS context/session"
//! fields), built on `rustls`.
//!
//! Grounded on the same pump shape a blocking rustls wrapper would use
//! (`wants_write`/`write_tls`, `wants_read`/`read_tls`+`process_new_packets`)
//! but restructured as a single non-blocking [`step`] call invoked once per
//! poll tick rather than a sleep-and-retry loop — the core is cooperative
//! single-threaded and must never spin (§5).

use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use mio::net::TcpStream;

use crate::config::TlsPaths;
use crate::error::NetError;

/// The plaintext literal sent before upgrading a `plain | tls` socket to
/// TLS on the same fd (§6, §9 "TLS both-modes preamble"). Chosen as the
/// fixed magic the design notes call for.
pub const TLS_UPGRADE_PREAMBLE: &[u8] = b"NETX1\n";

/// Either half of a handshake, wrapping the two concrete rustls connection
/// types behind one set of method calls.
pub enum TlsConn {
    Client(rustls::ClientConnection),
    Server(rustls::ServerConnection),
}

/// Outcome of one [`step`] call.
pub enum HandshakeStep {
    Handshaking,
    Done,
    Failed(NetError),
}

impl TlsConn {
    fn is_handshaking(&self) -> bool {
        match self {
            Self::Client(c) => c.is_handshaking(),
            Self::Server(c) => c.is_handshaking(),
        }
    }

    fn wants_read(&self) -> bool {
        match self {
            Self::Client(c) => c.wants_read(),
            Self::Server(c) => c.wants_read(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Self::Client(c) => c.wants_write(),
            Self::Server(c) => c.wants_write(),
        }
    }

    fn read_tls(&mut self, io: &mut dyn Read) -> io::Result<usize> {
        match self {
            Self::Client(c) => c.read_tls(io),
            Self::Server(c) => c.read_tls(io),
        }
    }

    fn write_tls(&mut self, io: &mut dyn Write) -> io::Result<usize> {
        match self {
            Self::Client(c) => c.write_tls(io),
            Self::Server(c) => c.write_tls(io),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            Self::Client(c) => c.process_new_packets(),
            Self::Server(c) => c.process_new_packets(),
        }
    }

    /// Reads decrypted application bytes into `out`, returning how many
    /// were read. Call only once the handshake is done.
    pub fn read_plaintext(&mut self, out: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Client(c) => c.reader().read(out),
            Self::Server(c) => c.reader().read(out),
        }
    }

    /// Queues application bytes for encryption; does not itself touch the
    /// socket. Follow with [`pump_writes`] to flush ciphertext out.
    pub fn write_plaintext(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            Self::Client(c) => c.writer().write(data),
            Self::Server(c) => c.writer().write(data),
        }
    }

    pub fn send_close_notify(&mut self) {
        match self {
            Self::Client(c) => c.send_close_notify(),
            Self::Server(c) => c.send_close_notify(),
        }
    }
}

/// Drives one non-blocking step of the handshake: flush any pending
/// outbound TLS records, then pull and process any available inbound
/// ones. Returns without blocking either way — `WouldBlock` on either side
/// just means "try again next tick".
pub fn step(conn: &mut TlsConn, sock: &mut TcpStream) -> HandshakeStep {
    if conn.wants_write() {
        match conn.write_tls(sock) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return HandshakeStep::Failed(NetError::TlsHandshake(e.to_string())),
        }
    }
    if conn.wants_read() {
        match conn.read_tls(sock) {
            Ok(0) => {
                return HandshakeStep::Failed(NetError::TlsHandshake(
                    "peer closed during handshake".to_string(),
                ));
            }
            Ok(_) => {
                if let Err(e) = conn.process_new_packets() {
                    return HandshakeStep::Failed(NetError::TlsHandshake(e.to_string()));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return HandshakeStep::Failed(NetError::TlsHandshake(e.to_string())),
        }
    }
    if conn.is_handshaking() {
        HandshakeStep::Handshaking
    } else {
        HandshakeStep::Done
    }
}

/// Flushes any ciphertext rustls has queued for us after a `write_plaintext`
/// call. Non-blocking; a `WouldBlock` leaves bytes queued for next tick.
pub fn pump_writes(conn: &mut TlsConn, sock: &mut TcpStream) -> io::Result<()> {
    while conn.wants_write() {
        match conn.write_tls(sock) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Pulls and decrypts any ciphertext currently available on the socket
/// without blocking, so a subsequent `read_plaintext` has something to
/// return.
pub fn pump_reads(conn: &mut TlsConn, sock: &mut TcpStream) -> io::Result<()> {
    match conn.read_tls(sock) {
        Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed")),
        Ok(_) => {
            conn.process_new_packets()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(())
}

fn load_certs(path: &Path) -> Result<Vec<rustls_pki_types::CertificateDer<'static>>, NetError> {
    let file = std::fs::File::open(path).map_err(NetError::Io)?;
    rustls_pemfile::certs(&mut io::BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(NetError::Io)
}

fn load_private_key(path: &Path) -> Result<rustls_pki_types::PrivateKeyDer<'static>, NetError> {
    let file = std::fs::File::open(path).map_err(NetError::Io)?;
    rustls_pemfile::private_key(&mut io::BufReader::new(file))
        .map_err(NetError::Io)?
        .ok_or(NetError::TlsNotConfigured)
}

/// Builds a client config trusting either the caller-supplied CA material
/// (`cert_file`/`cert_dir`) or, absent that, the Mozilla root set bundled
/// via `webpki-roots`.
pub fn build_client_config(paths: &TlsPaths) -> Result<Arc<rustls::ClientConfig>, NetError> {
    let mut roots = rustls::RootCertStore::empty();
    if let Some(cert_file) = &paths.cert_file {
        for cert in load_certs(cert_file)? {
            roots.add(cert).map_err(|e| NetError::TlsHandshake(e.to_string()))?;
        }
    } else {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    let config = rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
    Ok(Arc::new(config))
}

/// Builds a server config from a certificate chain + private key on disk.
///
/// # Errors
/// [`NetError::TlsNotConfigured`] if `public_key`/`private_key` aren't set.
pub fn build_server_config(paths: &TlsPaths) -> Result<Arc<rustls::ServerConfig>, NetError> {
    let cert_path = paths.public_key.as_ref().ok_or(NetError::TlsNotConfigured)?;
    let key_path = paths.private_key.as_ref().ok_or(NetError::TlsNotConfigured)?;
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| NetError::TlsHandshake(e.to_string()))?;
    Ok(Arc::new(config))
}
