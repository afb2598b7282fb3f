//! Multi-process worker orchestration over socketpairs.
//!
//! murmur lets a master process fork worker processes, exchange framed
//! messages with them over socketpairs, and supervise their lifecycle from a
//! single-threaded event loop.
//!
//! # Crate Structure
//!
//! - [`frame`] — Length-prefixed message framing and stream reassembly
//! - [`reactor`] — Single-threaded poll-based event loop (fds, timers, signals)
//! - [`proc`] — Fork, supervise, and message worker processes

/// Re-export frame types.
pub mod frame {
    pub use murmur_frame::*;
}

/// Re-export reactor types.
pub mod reactor {
    pub use murmur_reactor::*;
}

/// Re-export process-orchestration types.
pub mod proc {
    pub use murmur_proc::*;
}
