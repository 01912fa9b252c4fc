//! Monotonic time primitives used by the poll loop and the reconnect/handshake
//! timers.
//!
//! This is a deliberately small subset of a fuller timing crate: a
//! nanosecond duration newtype (`Nanos`), a monotonic point in time
//! (`Instant`), and a periodic-action helper (`Repeater`). Everything here is
//! backed by `std::time` rather than a hardware cycle counter — the runtime
//! only needs wall-clock-independent ordering and millisecond-ish
//! resolution, not cross-process clock synchronization.

mod instant;
mod nanos;
mod repeater;

pub use instant::Instant;
pub use nanos::Nanos;
pub use repeater::Repeater;
