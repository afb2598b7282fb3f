use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use bytes::{Buf, BytesMut};
use murmur_frame::{encode, FrameError, Message, StreamReassembler};
use murmur_reactor::{Reactor, Token};
use tracing::{debug, trace};

use crate::error::{ProcError, Result};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// One worker-facing end of a socketpair, bridged to message level.
///
/// Owns the non-blocking stream, a [`StreamReassembler`] for inbound bytes,
/// and an outbound buffer for writes the kernel would not take immediately.
/// The owning supervisor or runtime feeds it readiness events and receives
/// complete messages back.
pub struct Channel {
    stream: UnixStream,
    token: Token,
    reassembler: StreamReassembler,
    outbound: BytesMut,
    saw_eof: bool,
    write_closed: bool,
    closed: bool,
}

/// Everything one read-readiness turn produced.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    /// Complete messages, in arrival order.
    pub messages: Vec<Message>,
    /// The peer closed the stream.
    pub eof: bool,
    /// The inbound byte stream lost frame sync. Fatal: the owner is expected
    /// to disconnect rather than keep feeding a misaligned buffer.
    pub desync: bool,
}

impl Channel {
    /// Wrap a connected stream and register it with the reactor.
    ///
    /// Fails with [`ProcError::InvalidChannel`] if the descriptor is not a
    /// valid open stream.
    pub fn new(stream: UnixStream, token: Token, reactor: &Reactor) -> Result<Self> {
        let probe = probe_fd(stream.as_raw_fd());
        if probe.invalid {
            return Err(ProcError::InvalidChannel);
        }
        stream.set_nonblocking(true)?;
        reactor.watch_read(stream.as_raw_fd(), token);
        Ok(Self {
            stream,
            token,
            reassembler: StreamReassembler::new(),
            outbound: BytesMut::new(),
            saw_eof: false,
            write_closed: false,
            closed: false,
        })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Encode and hand a message to the write path.
    ///
    /// Returns once the bytes are queued with the OS or the outbound buffer,
    /// not once they reach the peer. Anything the kernel does not take
    /// immediately is flushed on the next writable-readiness event.
    pub fn send(&mut self, msg: &Message, reactor: &Reactor) -> Result<()> {
        if self.closed || self.write_closed {
            return Err(ProcError::NotWritable);
        }
        encode(msg, &mut self.outbound);
        trace!(kind = msg.kind(), len = msg.payload_len(), "message queued");
        self.flush_outbound(reactor)
    }

    /// Flush pending outbound bytes after a writable-readiness event.
    pub fn handle_writable(&mut self, reactor: &Reactor) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush_outbound(reactor)
    }

    /// Drain the stream after a read-readiness event.
    ///
    /// Reads until the kernel has nothing more, then extracts every complete
    /// frame. One event may therefore yield zero, one, or many messages.
    pub fn handle_readable(&mut self) -> Result<ReadOutcome> {
        let mut outcome = ReadOutcome::default();
        if self.closed {
            outcome.eof = true;
            return Ok(outcome);
        }

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.saw_eof = true;
                    outcome.eof = true;
                    break;
                }
                Ok(n) => self.reassembler.feed(&chunk[..n]),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::ConnectionReset => {
                    self.saw_eof = true;
                    outcome.eof = true;
                    break;
                }
                Err(err) => return Err(ProcError::Io(err)),
            }
        }

        loop {
            match self.reassembler.try_extract() {
                Ok(Some(msg)) => outcome.messages.push(msg),
                Ok(None) => break,
                Err(FrameError::SyncLost) => {
                    outcome.desync = true;
                    break;
                }
                Err(err) => return Err(ProcError::Frame(err)),
            }
        }

        Ok(outcome)
    }

    /// Live writability: polls the OS-level stream state rather than a cache,
    /// since the peer can disappear out-of-band.
    pub fn is_writable(&self) -> bool {
        if self.closed || self.write_closed {
            return false;
        }
        let probe = probe_fd(self.stream.as_raw_fd());
        probe.writable && !probe.hup && !probe.invalid
    }

    /// Live readability: open, no EOF observed, and the descriptor is still
    /// a valid stream.
    pub fn is_readable(&self) -> bool {
        if self.closed || self.saw_eof {
            return false;
        }
        let probe = probe_fd(self.stream.as_raw_fd());
        !probe.invalid && !(probe.hup && !probe.readable)
    }

    /// Shut down both directions and unregister from the reactor. Idempotent.
    pub fn close(&mut self, reactor: &Reactor) {
        if self.closed {
            return;
        }
        reactor.unwatch(self.stream.as_raw_fd());
        let _ = self.stream.shutdown(Shutdown::Both);
        self.closed = true;
        debug!(token = ?self.token, "channel closed");
    }

    fn flush_outbound(&mut self, reactor: &Reactor) -> Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    self.write_closed = true;
                    reactor.set_write_interest(self.stream.as_raw_fd(), false);
                    return Err(ProcError::NotWritable);
                }
                Ok(n) => self.outbound.advance(n),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    reactor.set_write_interest(self.stream.as_raw_fd(), true);
                    return Ok(());
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err)
                    if err.kind() == ErrorKind::BrokenPipe
                        || err.kind() == ErrorKind::ConnectionReset =>
                {
                    self.write_closed = true;
                    reactor.set_write_interest(self.stream.as_raw_fd(), false);
                    return Err(ProcError::NotWritable);
                }
                Err(err) => return Err(ProcError::Io(err)),
            }
        }
        reactor.set_write_interest(self.stream.as_raw_fd(), false);
        Ok(())
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("token", &self.token)
            .field("fd", &self.stream.as_raw_fd())
            .field("pending_out", &self.outbound.len())
            .field("closed", &self.closed)
            .finish()
    }
}

struct Probe {
    readable: bool,
    writable: bool,
    hup: bool,
    invalid: bool,
}

/// Zero-timeout poll(2) of a single descriptor.
fn probe_fd(fd: RawFd) -> Probe {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN | libc::POLLOUT,
        revents: 0,
    };
    // SAFETY: `pfd` is a valid pollfd for the count of 1; zero timeout means
    // the call cannot block.
    let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
    if rc < 0 {
        return Probe {
            readable: false,
            writable: false,
            hup: false,
            invalid: true,
        };
    }
    Probe {
        readable: pfd.revents & libc::POLLIN != 0,
        writable: pfd.revents & libc::POLLOUT != 0,
        hup: pfd.revents & (libc::POLLHUP | libc::POLLERR) != 0,
        invalid: pfd.revents & libc::POLLNVAL != 0,
    }
}
