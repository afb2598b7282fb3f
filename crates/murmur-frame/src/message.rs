use bytes::Bytes;

use crate::error::{FrameError, Result};

/// Maximum payload size: the wire length field is 3 bytes, so 16 MiB − 1.
pub const MAX_PAYLOAD: usize = 0xFF_FFFF;

/// A typed, length-bounded message exchanged between master and worker.
///
/// The `kind` tag carries caller-defined semantics; the payload is opaque
/// bytes. Immutable after construction, cheap to clone (refcounted payload),
/// and safe to move across threads — it holds no OS handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: u8,
    payload: Bytes,
}

impl Message {
    /// Create a message, validating the payload length.
    ///
    /// Payloads above [`MAX_PAYLOAD`] are rejected here rather than silently
    /// truncated at encode time.
    pub fn new(kind: u8, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        Ok(Self { kind, payload })
    }

    /// The message kind tag.
    pub fn kind(&self) -> u8 {
        self.kind
    }

    /// The message payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload length in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Consume the message and return its payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructs_within_bounds() {
        let msg = Message::new(7, &b"hello"[..]).unwrap();
        assert_eq!(msg.kind(), 7);
        assert_eq!(msg.payload().as_ref(), b"hello");
        assert_eq!(msg.payload_len(), 5);
    }

    #[test]
    fn accepts_empty_payload() {
        let msg = Message::new(0, Bytes::new()).unwrap();
        assert_eq!(msg.payload_len(), 0);
    }

    #[test]
    fn accepts_payload_at_exact_ceiling() {
        let msg = Message::new(1, vec![0u8; MAX_PAYLOAD]).unwrap();
        assert_eq!(msg.payload_len(), MAX_PAYLOAD);
    }

    #[test]
    fn rejects_payload_above_ceiling() {
        let err = Message::new(1, vec![0u8; MAX_PAYLOAD + 1]).unwrap_err();
        assert!(matches!(
            err,
            FrameError::PayloadTooLarge {
                size,
                max: MAX_PAYLOAD,
            } if size == MAX_PAYLOAD + 1
        ));
    }
}
