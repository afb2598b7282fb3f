use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::codec::{decode_header, HEADER_SIZE};
use crate::error::Result;
use crate::message::Message;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Incremental parser turning an arbitrary stream of byte chunks into a
/// sequence of complete [`Message`]s.
///
/// The stream has no message boundaries, so a single [`feed`] may complete
/// zero, one, or many frames. Callers must drain with [`try_extract`] until
/// it returns `Ok(None)` before waiting for more I/O:
///
/// ```
/// # use murmur_frame::{Message, StreamReassembler};
/// # use bytes::BytesMut;
/// # let mut wire = BytesMut::new();
/// # murmur_frame::encode(&Message::new(1, &b"hi"[..]).unwrap(), &mut wire);
/// let mut reassembler = StreamReassembler::new();
/// reassembler.feed(&wire);
/// while let Some(msg) = reassembler.try_extract().unwrap() {
///     assert_eq!(msg.kind(), 1);
/// }
/// ```
///
/// [`feed`]: StreamReassembler::feed
/// [`try_extract`]: StreamReassembler::try_extract
#[derive(Debug)]
pub struct StreamReassembler {
    buf: BytesMut,
    phase: Phase,
    max_payload: usize,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    AwaitingHeader,
    AwaitingBody { kind: u8, length: usize },
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self::with_max_payload(crate::message::MAX_PAYLOAD)
    }

    /// Accept frames only up to `max_payload` bytes of payload.
    ///
    /// The wire format allows up to [`MAX_PAYLOAD`]; a lower cap lets a
    /// receiver bound its memory without trusting the sender's length field.
    ///
    /// [`MAX_PAYLOAD`]: crate::message::MAX_PAYLOAD
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            phase: Phase::AwaitingHeader,
            max_payload,
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Append a chunk to the accumulation buffer.
    ///
    /// Never produces messages by itself; extraction is pull-based.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Attempt to extract the next complete message.
    ///
    /// Returns `Ok(None)` when more data is needed. A [`SyncLost`] error is
    /// fatal for the stream: the buffer is misaligned and the owning channel
    /// should be disconnected rather than fed further.
    ///
    /// [`SyncLost`]: crate::FrameError::SyncLost
    pub fn try_extract(&mut self) -> Result<Option<Message>> {
        if let Phase::AwaitingHeader = self.phase {
            if self.buf.len() < HEADER_SIZE {
                return Ok(None);
            }

            let header: [u8; HEADER_SIZE] = self.buf[..HEADER_SIZE].try_into().unwrap();
            let (kind, length) = decode_header(&header)?;
            if length > self.max_payload {
                return Err(crate::error::FrameError::PayloadTooLarge {
                    size: length,
                    max: self.max_payload,
                });
            }
            self.buf.advance(HEADER_SIZE);
            self.phase = Phase::AwaitingBody { kind, length };
            trace!(kind, length, "frame header parsed");
        }

        if let Phase::AwaitingBody { kind, length } = self.phase {
            if self.buf.len() < length {
                return Ok(None);
            }

            let payload = self.buf.split_to(length).freeze();
            self.phase = Phase::AwaitingHeader;
            // Length came from a 3-byte field, always within Message bounds.
            return Ok(Some(Message::new(kind, payload)?));
        }

        Ok(None)
    }

    /// Bytes currently buffered but not yet consumed.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Whether a parsed header is being held while waiting for its body.
    pub fn awaiting_body(&self) -> bool {
        matches!(self.phase, Phase::AwaitingBody { .. })
    }
}

impl Default for StreamReassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::error::FrameError;

    fn wire_for(messages: &[Message]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for msg in messages {
            encode(msg, &mut buf);
        }
        buf.to_vec()
    }

    fn drain(r: &mut StreamReassembler) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(msg) = r.try_extract().unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn single_frame_in_one_chunk() {
        let msg = Message::new(4, &b"ping"[..]).unwrap();
        let mut r = StreamReassembler::new();
        r.feed(&wire_for(std::slice::from_ref(&msg)));

        assert_eq!(drain(&mut r), vec![msg]);
        assert_eq!(r.buffered_len(), 0);
    }

    #[test]
    fn one_feed_may_yield_many_messages() {
        let messages = vec![
            Message::new(1, &b"one"[..]).unwrap(),
            Message::new(2, &b""[..]).unwrap(),
            Message::new(3, &b"three"[..]).unwrap(),
        ];
        let mut r = StreamReassembler::new();
        r.feed(&wire_for(&messages));

        assert_eq!(drain(&mut r), messages);
    }

    #[test]
    fn arbitrary_split_points_preserve_messages() {
        let messages = vec![
            Message::new(10, &b"alpha"[..]).unwrap(),
            Message::new(11, vec![0xAB; 300]).unwrap(),
            Message::new(12, &b""[..]).unwrap(),
        ];
        let wire = wire_for(&messages);

        // Every split width, including splits inside the magic word, inside
        // the length field, and at exact frame boundaries.
        for chunk_size in 1..=wire.len() {
            let mut r = StreamReassembler::new();
            let mut received = Vec::new();
            for chunk in wire.chunks(chunk_size) {
                r.feed(chunk);
                received.extend(drain(&mut r));
            }
            assert_eq!(received, messages, "chunk_size={chunk_size}");
        }
    }

    #[test]
    fn header_split_from_body_keeps_parsed_header() {
        let msg = Message::new(5, &b"body"[..]).unwrap();
        let wire = wire_for(std::slice::from_ref(&msg));

        let mut r = StreamReassembler::new();
        r.feed(&wire[..HEADER_SIZE]);
        assert!(r.try_extract().unwrap().is_none());
        assert!(r.awaiting_body());

        r.feed(&wire[HEADER_SIZE..]);
        assert_eq!(r.try_extract().unwrap(), Some(msg));
        assert!(!r.awaiting_body());
    }

    #[test]
    fn incomplete_header_needs_more_data() {
        let mut r = StreamReassembler::new();
        r.feed(&crate::codec::MAGIC_WORD[..4]);
        assert!(r.try_extract().unwrap().is_none());
        assert_eq!(r.buffered_len(), 4);
    }

    #[test]
    fn corrupted_magic_reports_sync_loss() {
        let msg = Message::new(1, &b"payload"[..]).unwrap();
        let mut wire = wire_for(std::slice::from_ref(&msg));
        wire[0] ^= 0x01;

        let mut r = StreamReassembler::new();
        r.feed(&wire);
        assert!(matches!(r.try_extract(), Err(FrameError::SyncLost)));
    }

    #[test]
    fn sync_loss_on_second_frame_after_clean_first() {
        let first = Message::new(1, &b"ok"[..]).unwrap();
        let second = Message::new(2, &b"bad"[..]).unwrap();
        let mut wire = wire_for(&[first.clone(), second]);
        let corrupt_at = HEADER_SIZE + first.payload_len();
        wire[corrupt_at] = 0xFF;

        let mut r = StreamReassembler::new();
        r.feed(&wire);
        assert_eq!(r.try_extract().unwrap(), Some(first));
        assert!(matches!(r.try_extract(), Err(FrameError::SyncLost)));
    }

    #[test]
    fn lowered_payload_cap_rejects_large_frames() {
        let msg = Message::new(1, vec![0u8; 32]).unwrap();
        let mut r = StreamReassembler::with_max_payload(16);
        r.feed(&wire_for(std::slice::from_ref(&msg)));

        assert!(matches!(
            r.try_extract(),
            Err(FrameError::PayloadTooLarge { size: 32, max: 16 })
        ));
    }
}
