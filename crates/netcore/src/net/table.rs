//! The socket table and poll loop's I/O side (§4.1 socket table, §4.5 steps
//! 2–6). Owns the `mio::Poll` and every live [`SocketRecord`]; produces
//! [`SocketEvent`]s for `system.rs` to turn into queued `Event`s and
//! callback dispatch.
//!
//! Grounded on the accept/connect/broadcast/reconnect shape of a mio
//! `ConnectionManager`, adapted from a length-prefixed frame protocol to
//! this crate's fixed [`crate::event::HEADER_SIZE`] header, and extended
//! with the handshake engine's plaintext/TLS/both-modes branching.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, trace, warn};

use crate::config::{Config, Security};
use crate::error::NetError;
use crate::net::handshake::{self, HandshakeOutcome};
use crate::net::socket::{Role, SocketRecord, SocketState, StreamKind};
use crate::net::tls;

/// Something the poll loop observed this tick that the caller (`system.rs`)
/// needs to turn into a queued event and/or a state change of its own
/// bookkeeping.
pub enum SocketEvent {
    Accepted { index: usize, peer_addr: SocketAddr },
    Connected { index: usize },
    /// A client socket exhausted its reconnect budget and was removed.
    ReconnectExhausted { index: usize, attempts: u32 },
    Disconnected { index: usize, was_peer_initiated: bool, err: NetError },
    Frame { index: usize, bytes: Vec<u8> },
    HandshakeFailed { index: usize, err: NetError },
}

pub struct SocketTable {
    poll: Poll,
    events: Events,
    sockets: Vec<Option<SocketRecord>>,
    free_slots: Vec<usize>,
    client_tls: Option<Arc<rustls::ClientConfig>>,
    server_tls: Option<Arc<rustls::ServerConfig>>,
}

impl SocketTable {
    pub fn new(cfg: &Config) -> Result<Self, NetError> {
        let client_tls = if cfg.security_level.contains(Security::TLS) {
            Some(tls::build_client_config(&cfg.tls)?)
        } else {
            None
        };
        let server_tls = if cfg.security_level.contains(Security::TLS) && cfg.tls.public_key.is_some() {
            Some(tls::build_server_config(&cfg.tls)?)
        } else {
            None
        };
        Ok(Self {
            poll: Poll::new().map_err(NetError::Io)?,
            events: Events::with_capacity(256),
            sockets: Vec::new(),
            free_slots: Vec::new(),
            client_tls,
            server_tls,
        })
    }

    fn insert(&mut self, rec: SocketRecord) -> usize {
        if let Some(index) = self.free_slots.pop() {
            self.sockets[index] = Some(rec);
            index
        } else {
            self.sockets.push(Some(rec));
            self.sockets.len() - 1
        }
    }

    fn register(&mut self, index: usize, interest: Interest) -> Result<(), NetError> {
        let token = Token(index);
        let rec = self.sockets[index].as_mut().expect("register on live slot");
        let source = rec.stream.registration_source().expect("registrable stream");
        self.poll.registry().register(source, token, interest).map_err(NetError::Io)
    }

    pub fn get(&self, index: usize) -> Option<&SocketRecord> {
        self.sockets.get(index).and_then(Option::as_ref)
    }

    /// `startServer(port)` (§4.1): binds a non-blocking listener with a
    /// backlog and registers it for readability.
    pub fn listen(&mut self, addr: SocketAddr, security: Security) -> Result<usize, NetError> {
        let listener = TcpListener::bind(addr).map_err(|source| NetError::Bind { addr, source })?;
        let index = self.insert(SocketRecord::listener(Token(0), listener, security));
        self.sockets[index].as_mut().unwrap().token = Token(index);
        self.register(index, Interest::READABLE)?;
        Ok(index)
    }

    /// `connectToServer` (§4.1): issues a non-blocking `connect()` and
    /// records the socket in `starting`, returning the index the caller
    /// uses for subsequent sends.
    pub fn connect(&mut self, addr: SocketAddr, security: Security, reconnect_limit: u32) -> Result<usize, NetError> {
        let stream = TcpStream::connect(addr).map_err(NetError::Connect)?;
        let index = self.insert(SocketRecord::outbound(Token(0), stream, addr, security, reconnect_limit));
        self.sockets[index].as_mut().unwrap().token = Token(index);
        self.register(index, Interest::READABLE | Interest::WRITABLE)?;
        Ok(index)
    }

    fn accept_on(&mut self, listener_index: usize) -> Result<Vec<usize>, NetError> {
        let mut accepted = Vec::new();
        loop {
            let security = self.sockets[listener_index].as_ref().unwrap().security;
            let StreamKind::Listener(listener) = &self.sockets[listener_index].as_ref().unwrap().stream else {
                break;
            };
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    let index = self.insert(SocketRecord::accepted(Token(0), stream, peer_addr, security));
                    self.sockets[index].as_mut().unwrap().token = Token(index);
                    self.register(index, Interest::READABLE | Interest::WRITABLE)?;
                    trace!(socket = index, %peer_addr, "accepted raw connection, handshake pending");
                    accepted.push(index);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(NetError::Io(e)),
            }
        }
        Ok(accepted)
    }

    /// `send` (§4.1): serializes into the socket's tx backlog. Caller
    /// (`system.rs`) has already checked `connected` state.
    pub fn enqueue_frame(&mut self, index: usize, frame: Vec<u8>) -> Result<(), NetError> {
        let rec = self.sockets.get_mut(index).and_then(Option::as_mut).ok_or(NetError::InvalidSocket(index))?;
        if rec.state != SocketState::Connected {
            return Err(NetError::NotConnected(index));
        }
        rec.enqueue_frame(frame);
        Ok(())
    }

    /// The injected-buffer test hook (§6).
    pub fn inject_bytes(&mut self, index: usize, bytes: &[u8], max_frame_len: u32) -> Result<Vec<Vec<u8>>, NetError> {
        let rec = self.sockets.get_mut(index).and_then(Option::as_mut).ok_or(NetError::InvalidSocket(index))?;
        rec.inject_bytes(bytes, max_frame_len)
    }

    /// `closeConnection` (§4.1): tears the socket down at the next tick;
    /// in-flight tx bytes not yet written are discarded (§5). The FIN-style
    /// event to the peer is enqueued by the caller (`system.rs`) before this
    /// runs, while the socket is still connected.
    pub fn close(&mut self, index: usize) {
        if let Some(rec) = self.sockets.get_mut(index).and_then(Option::as_mut) {
            rec.transition(SocketState::Terminated);
        }
    }

    pub fn close_all(&mut self) {
        for slot in &mut self.sockets {
            if let Some(rec) = slot {
                rec.transition(SocketState::Terminated);
            }
        }
    }

    #[must_use]
    pub fn is_connected(&self, index: usize) -> bool {
        self.get(index).is_some_and(|r| r.state == SocketState::Connected)
    }

    #[must_use]
    pub fn is_server(&self, index: usize) -> bool {
        self.get(index).is_some_and(|r| matches!(r.role, Role::ServerListener | Role::ServerAccepted))
    }

    /// `getSockSrcIP` (§4.1): the locally bound address.
    #[must_use]
    pub fn local_addr(&self, index: usize) -> Option<SocketAddr> {
        self.get(index).and_then(|r| r.local_addr().ok())
    }

    /// `getSockDestIP`: the remote peer address (empty for outbound sockets
    /// still in `starting`/`handshaking`).
    #[must_use]
    pub fn peer_addr(&self, index: usize) -> Option<SocketAddr> {
        self.get(index).and_then(|r| r.peer_addr.or(r.connect_addr))
    }

    /// Tunes kernel socket buffer sizes on an existing socket (SPEC_FULL.md
    /// §B). Silently does nothing if `index` is not live.
    pub fn set_buffer_size(&self, index: usize, size: usize) {
        if let Some(rec) = self.get(index) {
            rec.set_buffer_size(size);
        }
    }

    /// One pass of readiness selection, handshake driving, and tx
    /// draining (§4.5 steps 2–6). Returns the I/O-level events observed;
    /// `system.rs` turns these into queued application events.
    pub fn poll_once(&mut self, cfg: &Config, timeout: Duration, server_name: &str) -> Result<Vec<SocketEvent>, NetError> {
        self.poll.poll(&mut self.events, Some(timeout)).map_err(NetError::Io)?;
        let mut out = Vec::new();

        let ready: Vec<(usize, bool, bool)> =
            self.events.iter().map(|e| (e.token().0, e.is_readable(), e.is_writable())).collect();

        for (index, readable, writable) in ready {
            let Some((role, state)) = self.sockets.get(index).and_then(Option::as_ref).map(|r| (r.role, r.state)) else {
                continue;
            };
            match role {
                Role::ServerListener if readable => {
                    for accepted in self.accept_on(index)? {
                        let peer_addr = self.sockets[accepted].as_ref().unwrap().peer_addr.unwrap();
                        out.push(SocketEvent::Accepted { index: accepted, peer_addr });
                    }
                }
                Role::ClientOutbound if state == SocketState::Starting && writable => {
                    self.advance_client_start(index, server_name, &mut out)?;
                }
                _ if state == SocketState::Handshaking => {
                    self.advance_handshake(index, cfg, server_name, &mut out)?;
                }
                _ if state == SocketState::Connected && readable => {
                    self.drain_readable(index, cfg, &mut out);
                }
                _ => {}
            }
        }

        // Every handshaking socket gets a chance to progress even without
        // fresh readiness (TLS records already buffered, or a preamble
        // deadline to evaluate).
        let handshaking: Vec<usize> = self
            .sockets
            .iter()
            .enumerate()
            .filter(|(_, s)| s.as_ref().is_some_and(|r| r.state == SocketState::Handshaking))
            .map(|(i, _)| i)
            .collect();
        for index in handshaking {
            self.advance_handshake(index, cfg, server_name, &mut out)?;
        }

        for index in 0..self.sockets.len() {
            if self.sockets[index].as_ref().is_some_and(|r| r.state == SocketState::Connected && r.has_pending_writes()) {
                if let Some(rec) = self.sockets[index].as_mut() {
                    if let Err(err) = rec.flush_tx() {
                        self.fail_socket(index, err, &mut out);
                    }
                }
            }
        }

        self.drive_reconnects(cfg, &mut out)?;
        self.reap_terminated();
        Ok(out)
    }

    fn advance_client_start(&mut self, index: usize, server_name: &str, out: &mut Vec<SocketEvent>) -> Result<(), NetError> {
        let rec = self.sockets[index].as_mut().unwrap();
        if let Some(tcp) = rec.plain_tcp() {
            if let Ok(Some(err)) = tcp.take_error() {
                self.fail_socket(index, NetError::Connect(err), out);
                return Ok(());
            }
        }
        let outcome = handshake::drive_client_start(rec, self.client_tls.as_ref(), server_name);
        self.apply_outcome(index, outcome, out);
        Ok(())
    }

    fn advance_handshake(&mut self, index: usize, cfg: &Config, server_name: &str, out: &mut Vec<SocketEvent>) -> Result<(), NetError> {
        let Some(rec) = self.sockets[index].as_mut() else { return Ok(()) };
        let outcome = match rec.role {
            Role::ClientOutbound => {
                let cfg_handle = self.client_tls.clone();
                handshake::drive_client_continue(rec, cfg, cfg_handle.as_ref(), server_name)
            }
            Role::ServerAccepted => {
                let cfg_handle = self.server_tls.clone();
                handshake::drive_server(rec, cfg, cfg_handle.as_ref())
            }
            Role::ServerListener => HandshakeOutcome::Connected,
        };
        self.apply_outcome(index, outcome, out);
        Ok(())
    }

    fn apply_outcome(&mut self, index: usize, outcome: HandshakeOutcome, out: &mut Vec<SocketEvent>) {
        match outcome {
            HandshakeOutcome::Pending => {
                let rec = self.sockets[index].as_mut().unwrap();
                if rec.state == SocketState::Starting {
                    rec.transition(SocketState::Handshaking);
                }
                if rec.handshake_started.is_none() {
                    rec.handshake_started = Some(netcore_timing::Instant::now());
                }
            }
            HandshakeOutcome::Connected => {
                self.sockets[index].as_mut().unwrap().transition(SocketState::Connected);
                out.push(SocketEvent::Connected { index });
            }
            HandshakeOutcome::Failed(err) => self.fail_socket(index, err, out),
        }
    }

    fn drain_readable(&mut self, index: usize, cfg: &Config, out: &mut Vec<SocketEvent>) {
        let rec = self.sockets[index].as_mut().unwrap();
        match rec.read_frames(cfg.max_frame_len) {
            Ok(frames) => {
                for bytes in frames {
                    out.push(SocketEvent::Frame { index, bytes });
                }
            }
            Err(err @ NetError::PeerClosed) => {
                out.push(SocketEvent::Disconnected { index, was_peer_initiated: true, err });
                self.sockets[index].as_mut().unwrap().transition(SocketState::Terminated);
            }
            Err(err) => self.fail_socket(index, err, out),
        }
    }

    fn fail_socket(&mut self, index: usize, err: NetError, out: &mut Vec<SocketEvent>) {
        if let Some(rec) = self.sockets[index].as_mut() {
            rec.transition(SocketState::Failed);
        }
        debug!(socket = index, error = %err, "socket failed");
        out.push(SocketEvent::HandshakeFailed { index, err });
    }

    fn drive_reconnects(&mut self, cfg: &Config, out: &mut Vec<SocketEvent>) -> Result<(), NetError> {
        let candidates: Vec<usize> = self
            .sockets
            .iter()
            .enumerate()
            .filter(|(_, s)| s.as_ref().is_some_and(|r| r.role == Role::ClientOutbound && r.state == SocketState::Failed))
            .map(|(i, _)| i)
            .collect();

        for index in candidates {
            let rec = self.sockets[index].as_mut().unwrap();
            if rec.reconnect_budget == 0 {
                warn!(socket = index, attempts = rec.reconnect_limit, "reconnect budget exhausted");
                out.push(SocketEvent::ReconnectExhausted { index, attempts: rec.reconnect_limit });
                rec.transition(SocketState::Terminated);
                continue;
            }
            if rec.last_state_change.elapsed() < cfg.reconnect_interval {
                continue;
            }
            let Some(addr) = rec.connect_addr else { continue };
            rec.reconnect_budget -= 1;
            debug!(socket = index, %addr, remaining_budget = rec.reconnect_budget, "attempting reconnect");
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    self.poll.registry().deregister(rec.stream.registration_source().unwrap()).ok();
                    rec.stream = StreamKind::Plain(stream);
                    rec.transition(SocketState::Starting);
                    // The old fd was just deregistered; the new one was never
                    // registered, so this must be `register`, not
                    // `reregister` (which requires a prior registration and
                    // fails with ENOENT on a fresh fd).
                    self.register(index, Interest::READABLE | Interest::WRITABLE)?;
                }
                Err(e) => {
                    debug!(socket = index, error = %e, "reconnect attempt failed");
                    out.push(SocketEvent::HandshakeFailed { index, err: NetError::Connect(e) });
                    // Reset the throttle clock even though the state doesn't
                    // change, or a synchronous connect() failure (e.g. fd
                    // exhaustion) would burn the whole reconnect_budget in
                    // one tick instead of waiting `reconnect_interval`
                    // between attempts.
                    rec.transition(SocketState::Failed);
                }
            }
        }
        Ok(())
    }

    fn reap_terminated(&mut self) {
        for index in 0..self.sockets.len() {
            if self.sockets[index].as_ref().is_some_and(|r| r.state == SocketState::Terminated) {
                if let Some(mut rec) = self.sockets[index].take() {
                    if let Some(source) = rec.stream.registration_source() {
                        self.poll.registry().deregister(source).ok();
                    }
                }
                trace!(socket = index, "slot reclaimed");
                self.free_slots.push(index);
            }
        }
    }
}
