//! Small assertion helpers shared across the runtime.
//!
//! `safe_assert!` and friends behave like the standard macros in debug
//! builds, but degrade to a `tracing::error!` plus a normal `return`/`None`
//! at the call site in release builds, rather than aborting the process.
//! They exist for invariants the runtime wants to police loudly in tests
//! without taking down a long-running server over a bug in, say, a
//! diagnostic path.

mod assert;

pub use assert::*;
