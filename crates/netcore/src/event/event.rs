//! The event value type (§4.4): a move-only message with a fixed header and
//! a growable, pool-backed payload.
//!
//! Ownership transfer is split into two explicitly named operations rather
//! than overloading assignment the way the C++ source does:
//!
//! - [`Event::acquire`] — "move": takes the payload out of `self`, returns a
//!   new `Event` that owns it, and leaves `self` detached (no payload, safe
//!   to drop). Mirrors the source's move-assignment/`acquire()`.
//! - [`Event::deep_clone`] — "copy": allocates a fresh buffer and memcpys the
//!   payload. Mirrors the source's copy constructor/`copy()`.
//!
//! Because Rust's ownership system makes "detach the source" a real,
//! checked transfer rather than a runtime flag, the `own`/`destroy` bits
//! from the source are kept only for wire-format parity (they round-trip
//! through `serialize`/`deserialize`) — double-free is a compile-time
//! impossibility here, not a runtime invariant enforced by those bits. See
//! DESIGN.md.

use std::cell::Cell;
use std::rc::Rc;

use crate::error::NetError;
use crate::event::pool::{EventPool, PoolBuf};
use crate::tags::Tag;

/// Wire header size in bytes: `dataLen(4) + timestamp(8) + refs(4) +
/// srcSock(4) + targetID(4) + max(4) + scope(5) + target(4) + name(4) +
/// flags(2)`.
pub const HEADER_SIZE: usize = 4 + 8 + 4 + 4 + 4 + 4 + 5 + 4 + 4 + 2;

const FLAG_OWN: u16 = 1 << 0;
const FLAG_DESTROY: u16 = 1 << 1;

thread_local! {
    static NEXT_ALLOC_ID: Cell<u64> = const { Cell::new(1) };
}

fn next_alloc_id() -> u64 {
    NEXT_ALLOC_ID.with(|c| {
        let id = c.get();
        c.set(id + 1);
        id
    })
}

/// A simple four-float vector, the one structured type `attach`/`get` know
/// about natively (matches the source's `Vec4F`).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Vec4 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Header {
    data_len: u32,
    timestamp: i64,
    refs: u32,
    src_sock: i32,
    target_id: i32,
    max: u32,
    scope: [u8; 5],
    target: Tag,
    name: Tag,
    flags: u16,
}

impl Header {
    fn encode(&self, out: &mut [u8; HEADER_SIZE]) {
        let mut w = 0;
        macro_rules! put {
            ($bytes:expr) => {{
                let b = $bytes;
                out[w..w + b.len()].copy_from_slice(&b);
                w += b.len();
            }};
        }
        put!(self.data_len.to_ne_bytes());
        put!(self.timestamp.to_ne_bytes());
        put!(self.refs.to_ne_bytes());
        put!(self.src_sock.to_ne_bytes());
        put!(self.target_id.to_ne_bytes());
        put!(self.max.to_ne_bytes());
        put!(self.scope);
        put!(self.target.to_ne_bytes());
        put!(self.name.to_ne_bytes());
        put!(self.flags.to_ne_bytes());
        netcore_utils::safe_assert_eq!(w, HEADER_SIZE);
    }

    fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        let mut r = 0;
        macro_rules! take {
            ($ty:ty) => {{
                const N: usize = std::mem::size_of::<$ty>();
                let v = <$ty>::from_ne_bytes(buf[r..r + N].try_into().unwrap());
                r += N;
                v
            }};
        }
        let data_len = take!(u32);
        let timestamp = take!(i64);
        let refs = take!(u32);
        let src_sock = take!(i32);
        let target_id = take!(i32);
        let max = take!(u32);
        let mut scope = [0u8; 5];
        scope.copy_from_slice(&buf[r..r + 5]);
        r += 5;
        let target = take!(u32);
        let name = take!(u32);
        let flags = take!(u16);
        netcore_utils::safe_assert_eq!(r, HEADER_SIZE);
        Self { data_len, timestamp, refs, src_sock, target_id, max, scope, target, name, flags }
    }
}

/// A framed application message: a fixed header plus a pool-backed payload
/// buffer that `attach`/`get` read and write sequentially through a cursor.
pub struct Event {
    header: Header,
    payload: Option<PoolBuf>,
    /// Read/write cursor into `payload[..header.data_len]`.
    pos: usize,
    pool: Rc<EventPoolCell>,
    alloc_id: u64,
}

/// `Rc<RefCell<EventPool>>` is long and appears constantly in constructor
/// signatures; this alias just keeps them readable.
pub type EventPoolCell = std::cell::RefCell<EventPool>;

impl Event {
    /// Allocates an empty event with the given `target`/`name` tags and no
    /// payload capacity yet (grows on first `attach`).
    #[must_use]
    pub fn new(pool: &Rc<EventPoolCell>, target: Tag, name: Tag) -> Self {
        Self::with_capacity(pool, target, name, 0)
    }

    /// Allocates an event with at least `capacity` bytes of payload space
    /// reserved up front.
    #[must_use]
    pub fn with_capacity(pool: &Rc<EventPoolCell>, target: Tag, name: Tag, capacity: usize) -> Self {
        let buf = EventPool::alloc(pool, capacity.max(16));
        let max = buf.capacity() as u32;
        Self {
            header: Header { target, name, max, flags: FLAG_OWN | FLAG_DESTROY, ..Header::default() },
            payload: Some(buf),
            pos: 0,
            pool: Rc::clone(pool),
            alloc_id: next_alloc_id(),
        }
    }

    #[must_use]
    pub const fn target(&self) -> Tag {
        self.header.target
    }

    #[must_use]
    pub const fn name(&self) -> Tag {
        self.header.name
    }

    pub fn set_name(&mut self, target: Tag, name: Tag) {
        self.header.target = target;
        self.header.name = name;
    }

    #[must_use]
    pub const fn data_len(&self) -> u32 {
        self.header.data_len
    }

    #[must_use]
    pub const fn max(&self) -> u32 {
        self.header.max
    }

    #[must_use]
    pub const fn timestamp(&self) -> i64 {
        self.header.timestamp
    }

    pub fn set_timestamp(&mut self, ts: i64) {
        self.header.timestamp = ts;
    }

    #[must_use]
    pub const fn refs(&self) -> u32 {
        self.header.refs
    }

    pub(crate) fn inc_refs(&mut self) {
        self.header.refs += 1;
    }

    #[must_use]
    pub const fn src_sock(&self) -> i32 {
        self.header.src_sock
    }

    pub fn set_src_sock(&mut self, sock: i32) {
        self.header.src_sock = sock;
    }

    #[must_use]
    pub const fn target_id(&self) -> i32 {
        self.header.target_id
    }

    pub fn set_target_id(&mut self, id: i32) {
        self.header.target_id = id;
    }

    /// The owner identity tag (§3), a fixed 5-byte field distinct from the
    /// `target`/`name` tags — carried opaquely, not interpreted as ASCII.
    #[must_use]
    pub const fn scope(&self) -> [u8; 5] {
        self.header.scope
    }

    pub fn set_scope(&mut self, scope: [u8; 5]) {
        self.header.scope = scope;
    }

    #[must_use]
    pub const fn is_owned(&self) -> bool {
        self.header.flags & FLAG_OWN != 0
    }

    /// Clears the destroy-on-scope-exit bit so an owning scope's normal
    /// drop does not discard this event's payload. Wire-format/API parity
    /// only — see module docs; actual lifetime is governed by ownership.
    pub fn persist(&mut self) {
        self.header.flags &= !FLAG_DESTROY;
    }

    pub fn consume(&mut self) {
        self.header.flags |= FLAG_DESTROY;
    }

    #[must_use]
    pub const fn alloc_id(&self) -> u64 {
        self.alloc_id
    }

    /// Resets the cursor to the start for sequential `attach` calls.
    pub fn start_write(&mut self) {
        self.pos = 0;
    }

    /// Resets the cursor to the start for sequential `get` calls.
    pub fn start_read(&mut self) {
        self.pos = 0;
    }

    fn payload(&self) -> &PoolBuf {
        self.payload.as_ref().expect("event payload used after acquire()")
    }

    fn payload_mut(&mut self) -> &mut PoolBuf {
        self.payload.as_mut().expect("event payload used after acquire()")
    }

    #[must_use]
    pub fn payload_bytes(&self) -> &[u8] {
        &self.payload().as_slice()[..self.header.data_len as usize]
    }

    fn ensure_capacity(&mut self, additional: usize) {
        let needed = self.pos + additional;
        if needed <= self.payload().capacity() {
            return;
        }
        let mut new_cap = self.payload().capacity().max(16);
        while new_cap < needed {
            new_cap *= 2;
        }
        let mut new_buf = EventPool::alloc(&self.pool, new_cap);
        new_buf.as_mut_slice()[..self.header.data_len as usize]
            .copy_from_slice(&self.payload().as_slice()[..self.header.data_len as usize]);
        self.header.max = new_buf.capacity() as u32;
        self.payload = Some(new_buf);
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        self.ensure_capacity(bytes.len());
        let pos = self.pos;
        self.payload_mut().as_mut_slice()[pos..pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        self.header.data_len = self.header.data_len.max(self.pos as u32);
        netcore_utils::safe_assert!(self.header.data_len <= self.header.max, "event dataLen exceeded max capacity");
    }

    fn read_bytes(&mut self, len: usize) -> Result<&[u8], NetError> {
        if self.pos + len > self.header.data_len as usize {
            return Err(NetError::ShortRead {
                pos: self.pos as u32,
                len: len as u32,
                data_len: self.header.data_len,
            });
        }
        let pos = self.pos;
        self.pos += len;
        Ok(&self.payload().as_slice()[pos..pos + len])
    }

    pub fn attach_bool(&mut self, v: bool) {
        self.write_bytes(&[u8::from(v)]);
    }

    pub fn attach_i32(&mut self, v: i32) {
        self.write_bytes(&v.to_ne_bytes());
    }

    pub fn attach_u32(&mut self, v: u32) {
        self.write_bytes(&v.to_ne_bytes());
    }

    pub fn attach_i16(&mut self, v: i16) {
        self.write_bytes(&v.to_ne_bytes());
    }

    pub fn attach_i64(&mut self, v: i64) {
        self.write_bytes(&v.to_ne_bytes());
    }

    pub fn attach_f32(&mut self, v: f32) {
        self.write_bytes(&v.to_ne_bytes());
    }

    pub fn attach_f64(&mut self, v: f64) {
        self.write_bytes(&v.to_ne_bytes());
    }

    pub fn attach_vec4(&mut self, v: Vec4) {
        self.attach_f32(v.x);
        self.attach_f32(v.y);
        self.attach_f32(v.z);
        self.attach_f32(v.w);
    }

    /// Length-prefixed (u32) UTF-8 string.
    pub fn attach_str(&mut self, s: &str) {
        self.attach_u32(s.len() as u32);
        self.write_bytes(s.as_bytes());
    }

    /// Length-prefixed (u32) raw buffer.
    pub fn attach_buf(&mut self, buf: &[u8]) {
        self.attach_u32(buf.len() as u32);
        self.write_bytes(buf);
    }

    pub fn get_bool(&mut self) -> Result<bool, NetError> {
        Ok(self.read_bytes(1)?[0] != 0)
    }

    pub fn get_i32(&mut self) -> Result<i32, NetError> {
        Ok(i32::from_ne_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32, NetError> {
        Ok(u32::from_ne_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    pub fn get_i16(&mut self) -> Result<i16, NetError> {
        Ok(i16::from_ne_bytes(self.read_bytes(2)?.try_into().unwrap()))
    }

    pub fn get_i64(&mut self) -> Result<i64, NetError> {
        Ok(i64::from_ne_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }

    pub fn get_f32(&mut self) -> Result<f32, NetError> {
        Ok(f32::from_ne_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    pub fn get_f64(&mut self) -> Result<f64, NetError> {
        Ok(f64::from_ne_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }

    pub fn get_vec4(&mut self) -> Result<Vec4, NetError> {
        Ok(Vec4 { x: self.get_f32()?, y: self.get_f32()?, z: self.get_f32()?, w: self.get_f32()? })
    }

    pub fn get_str(&mut self) -> Result<String, NetError> {
        let len = self.get_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn get_buf(&mut self) -> Result<Vec<u8>, NetError> {
        let len = self.get_u32()? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }

    /// "Move": takes the payload out of `self` into a freshly returned
    /// `Event`, detaching `self` so it becomes a safely-droppable empty
    /// husk (no payload, not owning, destroy-on-scope-exit cleared).
    #[must_use]
    pub fn acquire(&mut self) -> Self {
        let taken = Self {
            header: self.header,
            payload: self.payload.take(),
            pos: self.pos,
            pool: Rc::clone(&self.pool),
            alloc_id: self.alloc_id,
        };
        self.header = Header { flags: 0, ..Header::default() };
        self.pos = 0;
        self.alloc_id = 0;
        taken
    }

    /// "Copy": a deep copy into a fresh pool allocation.
    #[must_use]
    pub fn deep_clone(&self) -> Self {
        let mut copy = Self::with_capacity(&self.pool, self.header.target, self.header.name, self.header.data_len as usize);
        copy.header = self.header;
        copy.header.max = copy.payload().capacity() as u32;
        copy.pos = self.pos;
        copy.alloc_id = next_alloc_id();
        copy.payload_mut().as_mut_slice()[..self.header.data_len as usize]
            .copy_from_slice(self.payload_bytes());
        copy
    }

    /// Returns `header ++ payload` as a single contiguous buffer, ready to
    /// write to the wire. The source core does this with a single memcpy
    /// out of a header prefix reserved immediately before the payload
    /// pointer; this reimplementation builds the same bytes by explicit
    /// field encoding rather than relying on that raw-pointer layout (see
    /// DESIGN.md) — functionally equivalent, still one allocation per call.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        self.header.encode(&mut header_bytes);
        let mut out = Vec::with_capacity(HEADER_SIZE + self.header.data_len as usize);
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(self.payload_bytes());
        out
    }

    /// Parses a `header ++ payload` buffer produced by [`Event::serialize`]
    /// into a freshly pool-allocated, owned `Event`.
    ///
    /// # Errors
    /// Returns [`NetError::FrameTooLarge`] if `buf` is shorter than the
    /// header declares (malformed caller input; the framing layer in
    /// `net::codec` is responsible for only calling this once a complete
    /// frame has been buffered).
    pub fn deserialize(pool: &Rc<EventPoolCell>, buf: &[u8]) -> Result<Self, NetError> {
        if buf.len() < HEADER_SIZE {
            return Err(NetError::FrameTooLarge { declared: HEADER_SIZE as u32, cap: buf.len() as u32 });
        }
        let header_bytes: [u8; HEADER_SIZE] = buf[..HEADER_SIZE].try_into().unwrap();
        let mut header = Header::decode(&header_bytes);
        let payload_bytes = &buf[HEADER_SIZE..];
        if payload_bytes.len() < header.data_len as usize {
            return Err(NetError::FrameTooLarge { declared: header.data_len, cap: payload_bytes.len() as u32 });
        }
        let mut event = Self::with_capacity(pool, header.target, header.name, header.data_len as usize);
        event.payload_mut().as_mut_slice()[..header.data_len as usize]
            .copy_from_slice(&payload_bytes[..header.data_len as usize]);
        header.max = event.payload().capacity() as u32;
        header.flags = FLAG_OWN | FLAG_DESTROY;
        event.header = header;
        event.pos = header.data_len as usize;
        Ok(event)
    }
}
