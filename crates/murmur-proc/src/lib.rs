//! Multi-process worker orchestration.
//!
//! The master side forks workers over socketpairs and supervises them from a
//! single-threaded event loop; the worker side runs its own loop over the one
//! channel back to its master. Exactly one exit notification comes out per
//! worker no matter how the master learns of the death (socket close or
//! SIGCHLD).

pub mod channel;
pub mod daemon;
pub mod error;
pub mod fork;
pub mod ident;
pub mod supervisor;
pub mod worker;

pub use channel::{Channel, ReadOutcome};
pub use daemon::daemonize;
pub use error::{ProcError, Result};
pub use fork::{fork, Forked};
pub use ident::{IdGenerator, UuidGenerator, WorkerId};
pub use supervisor::{SendObserver, Supervisor, SupervisorHandler, WorkerExit};
pub use worker::{WorkerFactory, WorkerHandler, WorkerMain, WorkerRuntime};
