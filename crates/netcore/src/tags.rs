//! Four-character event tags.
//!
//! The wire protocol inherited from the original C++ core packs event
//! target/name identifiers as four ASCII characters into a `u32` (the same
//! trick as a FourCC code). Multi-character literals are non-portable in
//! Rust, so each well-known tag is spelled out as a named constant built by
//! [`str_to_tag`] at compile time, and callers treat `Tag` as an opaque u32
//! for matching.

/// An opaque packed four-character identifier used for an event's `target`
/// and `name` fields.
pub type Tag = u32;

/// Packs up to four ASCII bytes of `s` into a [`Tag`], matching the
/// byte-reversed layout the original core used (`s.as_bytes()[0]` lands in
/// the most significant byte). Shorter strings are left-padded with NUL.
///
/// # Panics
/// Panics if `s` is longer than four bytes.
#[must_use]
pub const fn str_to_tag(s: &str) -> Tag {
    let bytes = s.as_bytes();
    assert!(bytes.len() <= 4, "tag must be at most four characters");
    let mut buf = [0u8; 4];
    let mut i = 0;
    while i < bytes.len() {
        buf[i] = bytes[i];
        i += 1;
    }
    u32::from_be_bytes(buf)
}

/// Inverse of [`str_to_tag`]: unpacks a [`Tag`] back into its four
/// characters, trimming trailing NUL padding.
#[must_use]
pub fn tag_to_str(tag: Tag) -> String {
    let bytes = tag.to_be_bytes();
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// The runtime's own subsystem target, used for synthetic events the core
/// itself generates (errors, connection lifecycle notifications).
pub const TARGET_NET: Tag = str_to_tag("net ");

/// Connection accepted / handshake complete (server and client).
pub const NAME_S_OK: Tag = str_to_tag("sOkT");
/// Client-side peer close.
pub const NAME_C_FIN: Tag = str_to_tag("cFIN");
/// Server-side peer close.
pub const NAME_S_FIN: Tag = str_to_tag("sFIN");
/// Network error; payload is a single `i32` error code.
pub const NAME_NET_ERR: Tag = str_to_tag("nerr");
/// Application request (demo/test verb).
pub const NAME_C_RQS: Tag = str_to_tag("cRqs");
/// Application result (demo/test verb).
pub const NAME_S_RST: Tag = str_to_tag("sRst");
/// Deserialization fixture verb used by framing-stress tests.
pub const NAME_C_TST: Tag = str_to_tag("cTst");

#[cfg(test)]
mod tests {
    use super::{str_to_tag, tag_to_str};

    #[test]
    fn round_trips_full_width_tag() {
        let tag = str_to_tag("cRqs");
        assert_eq!(tag_to_str(tag), "cRqs");
    }

    #[test]
    fn round_trips_short_tag_without_padding_garbage() {
        let tag = str_to_tag("ok");
        assert_eq!(tag_to_str(tag), "ok");
    }

    #[test]
    fn preserves_trailing_space_in_net_target() {
        assert_eq!(tag_to_str(super::TARGET_NET), "net ");
    }
}
