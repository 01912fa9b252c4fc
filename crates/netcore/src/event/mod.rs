//! Event object, pool allocator, and FIFO queue (§4.4).

#[allow(clippy::module_inception)]
mod event;
mod pool;
mod queue;

pub use event::{Event, EventPoolCell, Vec4, HEADER_SIZE};
pub use pool::EventPool;
pub use queue::EventQueue;
