use bytes::{BufMut, BytesMut};

use crate::error::{FrameError, Result};
use crate::message::Message;

/// Frame header: magic (8) + kind (1) + length (3, LE) = 12 bytes.
pub const HEADER_SIZE: usize = 12;

/// Magic word marking the start of every frame.
pub const MAGIC_WORD: [u8; 8] = *b"\0\0arch\0\0";

const KIND_OFFSET: usize = MAGIC_WORD.len();
const LEN_OFFSET: usize = KIND_OFFSET + 1;

/// Encode a message into the wire format.
///
/// Wire format:
/// ```text
/// ┌───────────────┬───────────┬──────────────┬─────────────────┐
/// │ Magic (8B)    │ Kind (1B) │ Length       │ Payload          │
/// │ \0\0arch\0\0  │           │ (3B LE)      │ (Length bytes)   │
/// └───────────────┴───────────┴──────────────┴─────────────────┘
/// ```
///
/// The length bound is enforced at [`Message`] construction, so encoding a
/// validated message cannot fail.
pub fn encode(msg: &Message, dst: &mut BytesMut) {
    let len = msg.payload_len();
    dst.reserve(HEADER_SIZE + len);
    dst.put_slice(&MAGIC_WORD);
    dst.put_u8(msg.kind());
    dst.put_slice(&(len as u32).to_le_bytes()[..3]);
    dst.put_slice(msg.payload());
}

/// Decode a 12-byte frame header into `(kind, payload_length)`.
///
/// The magic word is validated first; a mismatch means the stream is
/// desynchronized and yields [`FrameError::SyncLost`]. The length field is
/// little-endian regardless of host byte order, zero-extended from 3 bytes.
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> Result<(u8, usize)> {
    if header[..MAGIC_WORD.len()] != MAGIC_WORD {
        return Err(FrameError::SyncLost);
    }

    let kind = header[KIND_OFFSET];
    let mut len_bytes = [0u8; 4];
    len_bytes[..3].copy_from_slice(&header[LEN_OFFSET..HEADER_SIZE]);
    let length = u32::from_le_bytes(len_bytes) as usize;

    Ok((kind, length))
}
