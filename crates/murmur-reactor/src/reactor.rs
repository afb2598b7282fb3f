use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{ReactorError, Result};
use crate::event::{Event, Token};
use crate::signal::SignalPipe;
use crate::timer::{TimerId, TimerQueue};

#[derive(Debug, Clone, Copy)]
struct Watch {
    token: Token,
    write_interest: bool,
}

/// The per-process event loop.
///
/// Registration methods take `&self` (interior mutability) so that dispatch
/// callbacks can re-register watches, schedule timers, or stop the loop while
/// [`run`] is on the stack. No `RefCell` borrow is held across a dispatch.
///
/// [`run`]: Reactor::run
#[derive(Debug, Default)]
pub struct Reactor {
    inner: RefCell<Inner>,
    stop: Cell<bool>,
    running: Cell<bool>,
}

#[derive(Debug, Default)]
struct Inner {
    watches: HashMap<RawFd, Watch>,
    timers: TimerQueue,
    // Created lazily on the first watch_signal call; owning it claims the
    // process-global relay slot.
    signals: Option<SignalPipe>,
}

impl Reactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `fd` for read readiness, tagged with `token`.
    ///
    /// Re-watching an fd replaces its token and clears write interest.
    pub fn watch_read(&self, fd: RawFd, token: Token) {
        self.inner.borrow_mut().watches.insert(
            fd,
            Watch {
                token,
                write_interest: false,
            },
        );
    }

    /// Enable or disable write-readiness notification for a watched fd.
    pub fn set_write_interest(&self, fd: RawFd, interested: bool) {
        if let Some(watch) = self.inner.borrow_mut().watches.get_mut(&fd) {
            watch.write_interest = interested;
        }
    }

    /// Stop watching `fd`. Idempotent.
    pub fn unwatch(&self, fd: RawFd) {
        self.inner.borrow_mut().watches.remove(&fd);
    }

    /// Route deliveries of `sig` into the loop as [`Event::Signal`].
    pub fn watch_signal(&self, sig: i32) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.signals.is_none() {
            inner.signals = Some(SignalPipe::new()?);
        }
        inner.signals.as_mut().unwrap().watch(sig)
    }

    /// Schedule a timer. Periodic timers refire every `delay` until cancelled.
    pub fn add_timer(&self, delay: Duration, periodic: bool) -> TimerId {
        self.inner.borrow_mut().timers.schedule(delay, periodic)
    }

    /// Cancel a timer. Idempotent; a cancelled timer can never fire.
    pub fn cancel_timer(&self, id: TimerId) {
        self.inner.borrow_mut().timers.cancel(id);
    }

    /// Request loop exit after the current dispatch batch.
    pub fn stop(&self) {
        self.stop.set(true);
    }

    /// Discard all inherited state in a freshly forked child.
    ///
    /// A child starts its loop from scratch: parent-side fd watches and
    /// timers are meaningless in the new process image, and the inherited
    /// signal pipe must be torn down so the child can claim its own relay
    /// slot. Also requests a stop so any copy of [`run`] still on the
    /// inherited stack unwinds instead of polling stale descriptors.
    ///
    /// [`run`]: Reactor::run
    pub fn reset_after_fork(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.watches.clear();
        inner.timers = TimerQueue::default();
        inner.signals = None;
        self.stop.set(true);
        self.running.set(false);
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Run the loop, delivering every event to `on_event` in order.
    ///
    /// Returns normally when [`stop`] is called, or when nothing remains to
    /// wait on (no watched fds, no timers, no watched signals).
    ///
    /// [`stop`]: Reactor::stop
    pub fn run(&self, on_event: &mut dyn FnMut(Event)) -> Result<()> {
        if self.running.replace(true) {
            return Err(ReactorError::AlreadyRunning);
        }
        self.stop.set(false);
        let result = self.turn_until_done(on_event);
        self.running.set(false);
        result
    }

    fn turn_until_done(&self, on_event: &mut dyn FnMut(Event)) -> Result<()> {
        loop {
            if self.stop.get() {
                return Ok(());
            }

            let due = self.inner.borrow_mut().timers.pop_due(Instant::now());
            for id in due {
                on_event(Event::Timer(id));
                if self.stop.get() {
                    return Ok(());
                }
            }

            let (mut pollfds, tokens, deadline) = self.build_poll_set();
            if pollfds.is_empty() && deadline.is_none() {
                trace!("nothing left to wait on; leaving loop");
                return Ok(());
            }

            let timeout_ms = deadline.map_or(-1, |when| {
                let remaining = when.saturating_duration_since(Instant::now());
                // Round up so we never spin on a not-quite-due timer.
                remaining
                    .as_millis()
                    .saturating_add(1)
                    .min(i32::MAX as u128) as i32
            });

            // SAFETY: `pollfds` is a valid array of initialized pollfd records
            // for the length passed alongside it.
            let n = unsafe {
                libc::poll(
                    pollfds.as_mut_ptr(),
                    pollfds.len() as libc::nfds_t,
                    timeout_ms,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(ReactorError::Io(err));
            }

            let events = self.collect_events(&pollfds, &tokens);
            for event in events {
                on_event(event);
                if self.stop.get() {
                    return Ok(());
                }
            }
        }
    }

    fn build_poll_set(&self) -> (Vec<libc::pollfd>, Vec<Option<Token>>, Option<Instant>) {
        let mut inner = self.inner.borrow_mut();
        let mut pollfds = Vec::with_capacity(inner.watches.len() + 1);
        let mut tokens = Vec::with_capacity(inner.watches.len() + 1);

        if let Some(signals) = &inner.signals {
            pollfds.push(libc::pollfd {
                fd: signals.read_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
            tokens.push(None);
        }

        for (&fd, watch) in &inner.watches {
            let mut events = libc::POLLIN;
            if watch.write_interest {
                events |= libc::POLLOUT;
            }
            pollfds.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            });
            tokens.push(Some(watch.token));
        }

        let deadline = inner.timers.next_deadline();
        (pollfds, tokens, deadline)
    }

    fn collect_events(&self, pollfds: &[libc::pollfd], tokens: &[Option<Token>]) -> Vec<Event> {
        let mut events = Vec::new();
        for (pfd, slot) in pollfds.iter().zip(tokens) {
            if pfd.revents == 0 {
                continue;
            }
            match slot {
                None => {
                    let drained = {
                        let inner = self.inner.borrow();
                        inner
                            .signals
                            .as_ref()
                            .map(SignalPipe::drain)
                            .unwrap_or_default()
                    };
                    events.extend(drained.into_iter().map(Event::Signal));
                }
                Some(token) => {
                    let revents = pfd.revents;
                    if revents & libc::POLLIN != 0 {
                        events.push(Event::Readable(*token));
                    }
                    if revents & libc::POLLOUT != 0 {
                        events.push(Event::Writable(*token));
                    }
                    let gone = libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
                    if revents & gone != 0 && revents & libc::POLLIN == 0 {
                        events.push(Event::Hangup(*token));
                    }
                }
            }
        }
        events
    }
}
