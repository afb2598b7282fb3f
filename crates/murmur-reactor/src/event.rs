use crate::timer::TimerId;

/// Caller-chosen tag identifying a watched descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub u64);

/// A readiness notification delivered by [`Reactor::run`].
///
/// [`Reactor::run`]: crate::Reactor::run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The descriptor tagged with this token has data to read.
    Readable(Token),
    /// The descriptor tagged with this token accepts writes again.
    Writable(Token),
    /// The peer hung up and no data remains to read.
    Hangup(Token),
    /// A watched signal was delivered.
    Signal(i32),
    /// A timer came due.
    Timer(TimerId),
}
