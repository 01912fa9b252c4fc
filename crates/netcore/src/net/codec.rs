//! Stream framing (§4.3): reassembling a byte stream whose packet
//! boundaries don't align with event boundaries into discrete
//! `header ++ payload` frames.
//!
//! [`FrameReader`] is transport-agnostic — it only knows how to accumulate
//! bytes and peel off complete frames — so the same code path serves both
//! a live socket's receive loop and the injected-buffer test hook (§6),
//! which feeds bytes directly into a `FrameReader` as if they'd arrived
//! off the wire.

use crate::error::NetError;
use crate::event::HEADER_SIZE;

/// Accumulates bytes off a stream (or an injected test buffer) and yields
/// complete `header ++ payload` frames as they become available.
///
/// Implemented as a simple growable buffer with `Vec::drain` popping
/// consumed prefixes; this favors clarity over the zero-copy ring-buffer
/// a sustained high-message-rate transport would want (see DESIGN.md).
#[derive(Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Pulls every complete frame currently buffered. `max_frame_len` is
    /// the safety cap on a declared `dataLen` (§7, protocol/framing
    /// violation); exceeding it is reported rather than silently
    /// desynchronizing the stream.
    ///
    /// # Errors
    /// Returns [`NetError::FrameTooLarge`] the first time a header declares
    /// a `dataLen` over `max_frame_len`. The caller should drop the
    /// connection to `failed` on this error per §7 — the reader's
    /// remaining buffer is no longer trustworthy framing state.
    pub fn drain_frames(&mut self, max_frame_len: u32) -> Result<Vec<Vec<u8>>, NetError> {
        let mut frames = Vec::new();
        loop {
            if self.buf.len() < HEADER_SIZE {
                break;
            }
            let data_len = u32::from_ne_bytes(self.buf[0..4].try_into().unwrap());
            if data_len > max_frame_len {
                return Err(NetError::FrameTooLarge { declared: data_len, cap: max_frame_len });
            }
            let total = HEADER_SIZE + data_len as usize;
            if self.buf.len() < total {
                break;
            }
            frames.push(self.buf.drain(..total).collect());
        }
        Ok(frames)
    }
}

/// XOR checksum over a payload, used only for diagnostics — never part of
/// the wire format itself (§4.3).
#[must_use]
pub fn xor_checksum(buf: &[u8]) -> u8 {
    buf.iter().fold(0u8, |acc, b| acc ^ b)
}
