/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header does not start with the magic word. The stream is
    /// desynchronized; the owning channel should be disconnected.
    #[error("frame sync lost (bad magic word)")]
    SyncLost,

    /// The payload exceeds the maximum encodable size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, FrameError>;
