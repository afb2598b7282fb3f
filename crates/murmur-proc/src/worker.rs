use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use murmur_frame::Message;
use murmur_reactor::{Event, Reactor, TimerId, Token};
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::error::Result;
use crate::ident::WorkerId;

const CHANNEL_TOKEN: Token = Token(0);

/// Application callbacks for a worker process.
pub trait WorkerHandler {
    /// A complete message arrived from the supervisor.
    fn on_message(&mut self, runtime: &mut WorkerRuntime, msg: Message) -> Result<()>;

    /// The supervisor side of the channel went away. The default stops the
    /// loop, which is the right call for workers that exist only to serve
    /// their master.
    fn on_disconnect(&mut self, runtime: &mut WorkerRuntime) -> Result<()> {
        runtime.stop();
        Ok(())
    }

    /// A watched signal was delivered.
    fn on_signal(&mut self, _runtime: &mut WorkerRuntime, _sig: i32) -> Result<()> {
        Ok(())
    }

    /// A timer scheduled through [`WorkerRuntime::add_timer`] fired.
    fn on_timer(&mut self, _runtime: &mut WorkerRuntime, _id: TimerId) -> Result<()> {
        Ok(())
    }
}

/// The child-process entry point; created by a [`WorkerFactory`] and driven
/// to completion in the forked child.
pub trait WorkerMain {
    fn run(&mut self) -> Result<()>;
}

/// Builds the worker object in the freshly forked child.
///
/// Called exactly once per child, with the worker's id and its end of the
/// socketpair. Runs in the parent's address-space copy, so it can capture
/// whatever configuration it needs by value.
pub trait WorkerFactory {
    fn make_worker(&self, id: WorkerId, stream: UnixStream) -> Result<Box<dyn WorkerMain>>;
}

impl<F> WorkerFactory for F
where
    F: Fn(WorkerId, UnixStream) -> Result<Box<dyn WorkerMain>>,
{
    fn make_worker(&self, id: WorkerId, stream: UnixStream) -> Result<Box<dyn WorkerMain>> {
        self(id, stream)
    }
}

/// Event loop and channel plumbing for one worker process.
///
/// Owns the worker's reactor and its single channel back to the supervisor,
/// and routes events to a [`WorkerHandler`]. The usual shape of a worker is
/// a struct holding a runtime and a handler whose [`WorkerMain::run`] is a
/// one-liner delegating here.
pub struct WorkerRuntime {
    id: WorkerId,
    reactor: Rc<Reactor>,
    channel: Channel,
}

impl WorkerRuntime {
    /// Wrap this process's end of the supervisor socketpair.
    pub fn new(id: WorkerId, stream: UnixStream) -> Result<Self> {
        let reactor = Rc::new(Reactor::new());
        let channel = Channel::new(stream, CHANNEL_TOKEN, &reactor)?;
        debug!(worker = %id, "worker runtime ready");
        Ok(Self {
            id,
            reactor,
            channel,
        })
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Queue a message to the supervisor.
    pub fn send(&mut self, msg: &Message) -> Result<()> {
        self.channel.send(msg, &self.reactor)
    }

    /// Live probe: can this worker still reach its supervisor?
    pub fn is_connected(&self) -> bool {
        self.channel.is_readable() || self.channel.is_writable()
    }

    pub fn add_timer(&self, delay: Duration, periodic: bool) -> TimerId {
        self.reactor.add_timer(delay, periodic)
    }

    pub fn cancel_timer(&self, id: TimerId) {
        self.reactor.cancel_timer(id);
    }

    /// Route deliveries of `sig` to [`WorkerHandler::on_signal`].
    pub fn watch_signal(&self, sig: i32) -> Result<()> {
        self.reactor.watch_signal(sig)?;
        Ok(())
    }

    /// Request loop exit after the current dispatch batch.
    pub fn stop(&self) {
        self.reactor.stop();
    }

    /// Close the supervisor channel. Idempotent; once closed the loop has
    /// nothing left to wait on (absent timers or signals) and falls out.
    pub fn disconnect(&mut self) {
        self.channel.close(&self.reactor);
    }

    /// Run the worker loop until stopped or out of things to wait on.
    pub fn run(&mut self, handler: &mut dyn WorkerHandler) -> Result<()> {
        let reactor = Rc::clone(&self.reactor);
        let mut failure = None;
        reactor.run(&mut |event| {
            if let Err(err) = self.dispatch(event, handler) {
                failure = Some(err);
                self.reactor.stop();
            }
        })?;
        failure.map_or(Ok(()), Err)
    }

    fn dispatch(&mut self, event: Event, handler: &mut dyn WorkerHandler) -> Result<()> {
        match event {
            Event::Readable(CHANNEL_TOKEN) => {
                let outcome = self.channel.handle_readable()?;
                for msg in outcome.messages {
                    handler.on_message(self, msg)?;
                }
                if outcome.desync {
                    warn!(worker = %self.id, "frame sync lost; dropping supervisor channel");
                    self.disconnect();
                    handler.on_disconnect(self)?;
                } else if outcome.eof {
                    self.disconnect();
                    handler.on_disconnect(self)?;
                }
                Ok(())
            }
            Event::Writable(CHANNEL_TOKEN) => self.channel.handle_writable(&self.reactor),
            Event::Hangup(CHANNEL_TOKEN) => {
                self.disconnect();
                handler.on_disconnect(self)
            }
            Event::Readable(_) | Event::Writable(_) | Event::Hangup(_) => Ok(()),
            Event::Signal(sig) => handler.on_signal(self, sig),
            Event::Timer(id) => handler.on_timer(self, id),
        }
    }
}

impl std::fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("id", &self.id)
            .finish()
    }
}
