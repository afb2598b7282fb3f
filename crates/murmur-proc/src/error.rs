use crate::ident::WorkerId;

/// Errors that can occur while supervising or running worker processes.
#[derive(Debug, thiserror::Error)]
pub enum ProcError {
    /// The OS failed to allocate the socket pair for a new worker.
    #[error("failed to create socket pair: {0}")]
    ChannelCreation(std::io::Error),

    /// fork(2) failed. The supervisor keeps operating.
    #[error("fork failed: {0}")]
    Fork(std::io::Error),

    /// An operation referenced a worker id not present in the table.
    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),

    /// A send was attempted on a closed or half-closed channel.
    #[error("channel is not writable")]
    NotWritable,

    /// The descriptor handed to a channel or runtime is not a valid open
    /// stream.
    #[error("descriptor is not a valid open stream")]
    InvalidChannel,

    /// The freshly forked child was already gone when the parent probed its
    /// channel right after fork.
    #[error("worker {0} unreachable after fork")]
    WorkerUnreachable(WorkerId),

    /// Frame-level error (desync, oversized payload).
    #[error("frame error: {0}")]
    Frame(#[from] murmur_frame::FrameError),

    /// Event-loop error.
    #[error("event loop error: {0}")]
    Reactor(#[from] murmur_reactor::ReactorError),

    /// An I/O error on a worker channel or process primitive.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProcError>;
