/// Errors that can occur while driving the event loop.
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    /// An I/O error from poll(2) or the signal pipe.
    #[error("reactor I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `run` was called while the loop is already running.
    #[error("event loop is already running")]
    AlreadyRunning,

    /// Another reactor in this process already owns signal dispatch.
    ///
    /// The relay handler writes to a process-global pipe, so only one live
    /// reactor per process may watch signals. A forked child regains the
    /// slot by dropping the loop it inherited from the parent image.
    #[error("signal dispatch already owned by another event loop")]
    SignalOwner,
}

pub type Result<T> = std::result::Result<T, ReactorError>;
