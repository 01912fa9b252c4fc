//! The public contract (§4.1): [`NetworkSystem`], the single object user
//! code embeds. Wraps the socket table, the event pool and inbound queue,
//! and the `processQueue` cooperative tick.
//!
//! Grounded on the composition-over-inheritance redesign called for in §9:
//! the source's `Client`/`Server` subclasses of the runtime become this
//! struct plus a registered callback, with an explicit user-context value
//! (`Ctx`) standing in for the source's `this`-through-`void*` idiom.

use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::time::Duration;

use tracing::{error, info, warn};

use netcore_timing::{Nanos, Repeater};

use crate::config::{Config, Security, TlsPaths};
use crate::error::NetError;
use crate::event::{Event, EventPool, EventPoolCell, EventQueue};
use crate::net::{SocketEvent, SocketTable};
use crate::tags::{Tag, NAME_C_FIN, NAME_NET_ERR, NAME_S_FIN, NAME_S_OK, TARGET_NET};

/// User callback signature: `(event, user context) -> handled?`. A non-zero
/// return means "handled", matching the source's function-pointer contract;
/// this reimplementation does not currently branch on the return value, but
/// keeps the shape so a caller's existing callback logic ports unchanged.
pub type EventCallback<Ctx> = dyn FnMut(&mut Event, &mut Ctx) -> i32;

/// The event-driven network runtime (§2): socket table, handshake engine,
/// framing/codec, event pool and inbound queue, all reachable only through
/// `processQueue` and the methods below.
pub struct NetworkSystem<Ctx> {
    cfg: Config,
    table: SocketTable,
    pool: Rc<EventPoolCell>,
    inbound: EventQueue,
    callback: Option<Box<EventCallback<Ctx>>>,
    tick_gate: Repeater,
    /// SNI / peer name used when a client socket upgrades to TLS.
    server_name: String,
}

impl<Ctx> NetworkSystem<Ctx> {
    /// `initialize()` (§4.1): builds the socket table and, if configured,
    /// its TLS client/server configs. Unlike the source there is no
    /// process-wide socket-API init to repeat, so this is simply
    /// construction; callers that want idempotence just hold one instance.
    ///
    /// # Errors
    /// Propagates TLS config material errors (missing/unreadable key or
    /// certificate files) and the OS poller's own initialization failure.
    pub fn initialize(cfg: Config) -> Result<Self, NetError> {
        let table = SocketTable::new(&cfg)?;
        let pool = EventPool::new(cfg.max_pool_size);
        Ok(Self {
            tick_gate: Repeater::new(cfg.select_interval),
            pool,
            inbound: EventQueue::new(),
            callback: None,
            server_name: "localhost".to_string(),
            table,
            cfg,
        })
    }

    /// `setUserCallback(fn)` (§4.1).
    pub fn set_user_callback<F>(&mut self, f: F)
    where
        F: FnMut(&mut Event, &mut Ctx) -> i32 + 'static,
    {
        self.callback = Some(Box::new(f));
    }

    /// The SNI used for outbound TLS client connections. The source has no
    /// equivalent knob (it TLS-wraps by raw fd with no hostname
    /// verification hook documented); this reimplementation needs one
    /// because `rustls::ClientConnection::new` requires a `ServerName`.
    pub fn set_server_name(&mut self, name: impl Into<String>) {
        self.server_name = name.into();
    }

    pub fn set_select_interval(&mut self, interval: Nanos) {
        self.cfg.select_interval = interval;
        self.tick_gate.set_interval(interval);
    }

    pub fn set_reconnect_interval(&mut self, interval: Nanos) {
        self.cfg.reconnect_interval = interval;
    }

    pub fn set_reconnect_limit(&mut self, limit: u32) {
        self.cfg.reconnect_limit = limit;
    }

    pub fn set_security_level(&mut self, security: Security) {
        self.cfg.security_level = security;
    }

    pub fn set_tls_paths(&mut self, tls: TlsPaths) {
        self.cfg.tls = tls;
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.cfg.verbose = verbose;
    }

    pub fn set_flow(&mut self, flow: bool) {
        self.cfg.flow = flow;
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.cfg
    }

    /// `startServer(port, security)` (§4.1): binds `0.0.0.0:port`.
    ///
    /// # Errors
    /// [`NetError::Bind`] if the port is already in use or otherwise
    /// unavailable.
    pub fn start_server(&mut self, port: u16, security: Option<Security>) -> Result<usize, NetError> {
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let level = security.unwrap_or(self.cfg.security_level);
        let index = self.table.listen(addr, level)?;
        if self.cfg.flow {
            info!(socket = index, port, "listening");
        }
        Ok(index)
    }

    /// `connectToServer(name, port, ...) -> socketIndex` (§4.1). Name
    /// resolution is the one blocking call the runtime makes (§5); socket
    /// I/O afterward is non-blocking.
    ///
    /// # Errors
    /// [`NetError::Io`] if `name` does not resolve. [`NetError::Connect`]
    /// propagates from the non-blocking `connect()` syscall itself (rare —
    /// most connect failures only surface once the socket becomes writable,
    /// via a subsequent `nerr` event).
    pub fn connect_to_server(&mut self, name: &str, port: u16, security: Option<Security>) -> Result<usize, NetError> {
        let addr = resolve(name, port)?;
        self.server_name = name.to_string();
        let level = security.unwrap_or(self.cfg.security_level);
        let index = self.table.connect(addr, level, self.cfg.reconnect_limit)?;
        if self.cfg.flow {
            info!(socket = index, %addr, "connecting");
        }
        Ok(index)
    }

    /// `send(event, socket) -> bool` (§4.1). Returns `false` iff the socket
    /// is not `connected`, leaving `event` untouched for the caller to
    /// retry or discard.
    #[must_use]
    pub fn send(&mut self, event: &Event, socket: usize) -> bool {
        if !self.table.is_connected(socket) {
            return false;
        }
        self.table.enqueue_frame(socket, event.serialize()).is_ok()
    }

    /// `closeConnection(socket)` (§4.1): emits a FIN-style event to the peer
    /// if the socket is still connected, then tears the socket down at the
    /// next tick; in-flight tx bytes beyond that are discarded (§5).
    pub fn close_connection(&mut self, socket: usize) {
        if self.table.is_connected(socket) {
            let name = if self.table.is_server(socket) { NAME_S_FIN } else { NAME_C_FIN };
            let mut fin = self.new_event(TARGET_NET, name);
            fin.attach_i32(socket as i32);
            let _ = self.send(&fin, socket);
        }
        self.table.close(socket);
    }

    /// `closeAll()`.
    pub fn close_all(&mut self) {
        self.table.close_all();
    }

    #[must_use]
    pub fn is_connected(&self, socket: usize) -> bool {
        self.table.is_connected(socket)
    }

    /// Whether `socket` still has a live table slot. A reconnect-exhausted
    /// or peer-closed socket is reclaimed a tick after reaching `terminated`
    /// (§4.2), after which this returns `false` permanently.
    #[must_use]
    pub fn socket_exists(&self, socket: usize) -> bool {
        self.table.get(socket).is_some()
    }

    #[must_use]
    pub fn is_server(&self, socket: usize) -> bool {
        self.table.is_server(socket)
    }

    #[must_use]
    pub fn is_client(&self, socket: usize) -> bool {
        self.table.get(socket).is_some_and(|r| r.role == crate::net::Role::ClientOutbound)
    }

    /// `getSockSrcIP`.
    #[must_use]
    pub fn sock_src_addr(&self, socket: usize) -> Option<SocketAddr> {
        self.table.local_addr(socket)
    }

    /// `getSockDestIP`.
    #[must_use]
    pub fn sock_dest_addr(&self, socket: usize) -> Option<SocketAddr> {
        self.table.peer_addr(socket)
    }

    /// Tunes the kernel `SO_SNDBUF`/`SO_RCVBUF` on an already-open socket.
    /// No counterpart in spec.md's public contract; exposed because
    /// exercising a constrained transport window (spec.md §8 scenario 6)
    /// needs a way to shrink the kernel buffers under a real loopback
    /// socket rather than only under the injected-buffer test hook.
    pub fn set_socket_buffer_size(&self, socket: usize, size: usize) {
        self.table.set_buffer_size(socket, size);
    }

    #[must_use]
    pub fn pool(&self) -> &Rc<EventPoolCell> {
        &self.pool
    }

    /// `newEvent` equivalent: allocates an empty event from this system's
    /// pool, ready for `attach_*` calls.
    #[must_use]
    pub fn new_event(&self, target: Tag, name: Tag) -> Event {
        Event::new(&self.pool, target, name)
    }

    /// `netIsQueueEmpty`.
    #[must_use]
    pub fn queue_is_empty(&self) -> bool {
        self.inbound.is_empty()
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.inbound.len()
    }

    /// The injected-buffer test hook (§6): feeds `bytes` into `socket`'s
    /// receive path exactly as if they had arrived off the wire, then
    /// immediately deserializes and queues whatever complete frames result
    /// (does not wait for the next `processQueue` tick).
    ///
    /// # Errors
    /// [`NetError::InvalidSocket`] if `socket` does not exist;
    /// [`NetError::FrameTooLarge`] if a declared frame exceeds
    /// `max_frame_len`.
    pub fn inject_bytes(&mut self, socket: usize, bytes: &[u8]) -> Result<(), NetError> {
        let frames = self.table.inject_bytes(socket, bytes, self.cfg.max_frame_len)?;
        for frame in frames {
            self.deliver_frame(socket, &frame);
        }
        Ok(())
    }

    /// `processQueue()` (§4.5): one cooperative tick. Returns the number of
    /// events dispatched to the callback in step 7.
    pub fn process_queue(&mut self, user_ctx: &mut Ctx) -> usize {
        if !self.tick_gate.fire() {
            return 0;
        }

        let events = match self.table.poll_once(&self.cfg, Duration::from_millis(1), &self.server_name) {
            Ok(events) => events,
            Err(e) => {
                error!(error = %e, "poll_once failed");
                return 0;
            }
        };

        for ev in events {
            self.handle_socket_event(ev);
        }

        self.drain_inbound(user_ctx)
    }

    fn handle_socket_event(&mut self, ev: SocketEvent) {
        match ev {
            SocketEvent::Accepted { index, peer_addr } => {
                if self.cfg.verbose {
                    info!(socket = index, %peer_addr, "accepted connection");
                }
            }
            SocketEvent::Connected { index } => {
                if self.cfg.flow {
                    info!(socket = index, "handshake complete");
                }
                let mut ok = self.new_event(TARGET_NET, NAME_S_OK);
                ok.attach_i32(index as i32);
                self.inbound.push(ok);
            }
            SocketEvent::ReconnectExhausted { index, attempts } => {
                warn!(socket = index, attempts, "reconnect budget exhausted, socket removed");
                let mut nerr = self.new_event(TARGET_NET, NAME_NET_ERR);
                nerr.attach_i32(NetError::ReconnectExhausted { attempts }.as_error_code());
                self.inbound.push(nerr);
            }
            SocketEvent::Disconnected { index, was_peer_initiated, err } => {
                if self.cfg.verbose {
                    info!(socket = index, was_peer_initiated, error = %err, "disconnected");
                }
                let name = if self.table.is_server(index) { NAME_C_FIN } else { NAME_S_FIN };
                let mut fin = self.new_event(TARGET_NET, name);
                fin.attach_i32(index as i32);
                self.inbound.push(fin);
            }
            SocketEvent::Frame { index, bytes } => self.deliver_frame(index, &bytes),
            SocketEvent::HandshakeFailed { index, err } => {
                error!(socket = index, error = %err, "handshake/socket error");
                let mut nerr = self.new_event(TARGET_NET, NAME_NET_ERR);
                nerr.attach_i32(err.as_error_code());
                self.inbound.push(nerr);
            }
        }
    }

    fn deliver_frame(&mut self, socket: usize, frame: &[u8]) {
        match Event::deserialize(&self.pool, frame) {
            Ok(mut event) => {
                event.set_src_sock(socket as i32);
                self.inbound.push(event);
            }
            Err(e) => error!(socket, error = %e, "dropping malformed frame"),
        }
    }

    fn drain_inbound(&mut self, user_ctx: &mut Ctx) -> usize {
        let mut dispatched = 0;
        while let Some(mut event) = self.inbound.pop() {
            if let Some(cb) = self.callback.as_mut() {
                cb(&mut event, user_ctx);
            }
            dispatched += 1;
        }
        dispatched
    }
}

fn resolve(name: &str, port: u16) -> Result<SocketAddr, NetError> {
    (name, port)
        .to_socket_addrs()
        .map_err(NetError::Io)?
        .next()
        .ok_or_else(|| NetError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, format!("could not resolve {name}"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::str_to_tag;

    fn default_system() -> NetworkSystem<()> {
        NetworkSystem::initialize(Config::default()).unwrap()
    }

    #[test]
    fn send_to_unconnected_socket_returns_false() {
        let mut sys = default_system();
        let e = sys.new_event(TARGET_NET, str_to_tag("cTst"));
        assert!(!sys.send(&e, 0));
    }

    #[test]
    fn idle_tick_dispatches_nothing() {
        let mut sys = default_system();
        let mut ctx = ();
        sys.tick_gate.force_fire();
        assert_eq!(sys.process_queue(&mut ctx), 0);
    }

    #[test]
    fn loopback_server_and_client_complete_plaintext_handshake() {
        let mut server = NetworkSystem::<()>::initialize(Config::default()).unwrap();
        let server_index = server.start_server(0, Some(Security::PLAIN)).unwrap();
        let port = server.sock_src_addr(server_index).unwrap().port();

        let mut client = NetworkSystem::<()>::initialize(Config::default()).unwrap();
        let client_index = client.connect_to_server("127.0.0.1", port, Some(Security::PLAIN)).unwrap();

        let mut ctx = ();
        let mut connected = false;
        for _ in 0..200 {
            server.tick_gate.force_fire();
            client.tick_gate.force_fire();
            server.process_queue(&mut ctx);
            client.process_queue(&mut ctx);
            if client.is_connected(client_index) {
                connected = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(connected, "client never reached connected state");
    }
}
