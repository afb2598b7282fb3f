//! Length-prefixed message framing for master/worker IPC.
//!
//! Every message on the wire is framed with:
//! - An 8-byte magic word (`\0\0arch\0\0`) for stream synchronization
//! - A 1-byte message kind
//! - A 3-byte little-endian payload length (16 MiB − 1 ceiling)
//!
//! The [`StreamReassembler`] turns arbitrarily chunked stream reads back
//! into complete [`Message`]s — no partial frames ever reach user code.

pub mod codec;
pub mod error;
pub mod message;
pub mod reassembler;

pub use codec::{decode_header, encode, HEADER_SIZE, MAGIC_WORD};
pub use error::{FrameError, Result};
pub use message::{Message, MAX_PAYLOAD};
pub use reassembler::StreamReassembler;
