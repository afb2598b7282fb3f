//! Cooperative single-thread event loop.
//!
//! One [`Reactor`] per process binds non-blocking I/O readiness, monotonic
//! timers, and Unix signal delivery into a single dispatch stream. All
//! callbacks for a process are strictly serialized by the loop; parallelism
//! comes from OS processes, never from in-process threads.
//!
//! The interface is deliberately narrow so components driven by the loop can
//! be exercised in tests against plain pipes, without forking.

pub mod error;
pub mod event;
pub mod reactor;
pub mod signal;
pub mod timer;

pub use error::{ReactorError, Result};
pub use event::{Event, Token};
pub use reactor::Reactor;
pub use timer::TimerId;
