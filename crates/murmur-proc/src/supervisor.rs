use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::process;
use std::rc::Rc;
use std::time::Duration;

use murmur_frame::Message;
use murmur_reactor::{Event, Reactor, TimerId, Token};
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::error::{ProcError, Result};
use crate::fork::{self, Forked};
use crate::ident::{IdGenerator, UuidGenerator, WorkerId};
use crate::worker::WorkerFactory;

/// Exit code a worker process reports when its run loop returns an error.
const CHILD_FAILURE_EXIT: i32 = 70;

/// Hook observing every outbound message just before it hits the wire.
pub type SendObserver = Box<dyn FnMut(&WorkerId, &Message)>;

/// Notification that a worker is gone, delivered exactly once per worker
/// regardless of whether the socket close or the SIGCHLD arrived first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub worker_id: WorkerId,
    pub pid: libc::pid_t,
}

/// Application callbacks for the supervising process.
///
/// Every method receives the supervisor itself, so a callback can send
/// messages, fork replacement workers, or stop the loop in direct response
/// to what it observed.
pub trait SupervisorHandler {
    /// A complete message arrived from `worker`.
    fn on_message(&mut self, sup: &mut Supervisor, worker: &WorkerId, msg: Message) -> Result<()>;

    /// A worker left the table. Fired once per worker.
    fn on_worker_exit(&mut self, _sup: &mut Supervisor, _exit: WorkerExit) -> Result<()> {
        Ok(())
    }

    /// A watched signal other than SIGCHLD was delivered.
    fn on_signal(&mut self, _sup: &mut Supervisor, _sig: i32) -> Result<()> {
        Ok(())
    }

    /// A timer scheduled through [`Supervisor::add_timer`] fired.
    fn on_timer(&mut self, _sup: &mut Supervisor, _id: TimerId) -> Result<()> {
        Ok(())
    }

    /// A dispatch turn failed. Returning `Err` stops the loop and surfaces
    /// the error from [`Supervisor::run`]; the default logs and carries on.
    fn on_error(&mut self, _sup: &mut Supervisor, err: ProcError) -> Result<()> {
        warn!(%err, "dispatch error");
        Ok(())
    }
}

struct WorkerHandle {
    pid: libc::pid_t,
    channel: Channel,
}

/// The master side of the process tree.
///
/// Forks workers, owns the parent end of every worker channel, and runs the
/// event loop that routes messages, timer fires, and exits to a
/// [`SupervisorHandler`]. A worker is tracked in three maps at once (by id,
/// by pid, by reactor token); `remove_worker` is the single place all three
/// are cleared, which is what makes the close-vs-SIGCHLD race harmless.
pub struct Supervisor {
    reactor: Rc<Reactor>,
    workers: HashMap<WorkerId, WorkerHandle>,
    pids: HashMap<libc::pid_t, WorkerId>,
    tokens: HashMap<Token, WorkerId>,
    next_token: u64,
    id_gen: Box<dyn IdGenerator>,
    send_observer: Option<SendObserver>,
    sigchld_watched: bool,
    deadline_timer: Option<TimerId>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self::with_id_generator(Box::new(UuidGenerator))
    }

    /// Use a caller-supplied id source instead of the default UUIDv4.
    pub fn with_id_generator(id_gen: Box<dyn IdGenerator>) -> Self {
        Self {
            reactor: Rc::new(Reactor::new()),
            workers: HashMap::new(),
            pids: HashMap::new(),
            tokens: HashMap::new(),
            next_token: 1,
            id_gen,
            send_observer: None,
            sigchld_watched: false,
            deadline_timer: None,
        }
    }

    /// Fork a new worker running whatever `factory` builds.
    ///
    /// In the parent this returns the new worker's id; the child never
    /// returns, it runs the worker to completion and exits. The child's
    /// liveness is probed immediately after the fork; a child that is
    /// already gone is removed on the spot and reported as
    /// [`ProcError::WorkerUnreachable`] with no exit notification, since the
    /// caller never learned the worker existed.
    pub fn create_worker(&mut self, factory: &dyn WorkerFactory) -> Result<WorkerId> {
        let (parent_end, child_end) = UnixStream::pair().map_err(ProcError::ChannelCreation)?;
        let id = self.id_gen.next_id();

        // Watched before the fork so an instantly-dying child still reaps.
        if !self.sigchld_watched {
            self.reactor.watch_signal(libc::SIGCHLD)?;
            self.sigchld_watched = true;
        }

        match fork::fork().map_err(ProcError::Fork)? {
            Forked::Child => {
                drop(parent_end);
                self.child_main(factory, id, child_end)
            }
            Forked::Parent { pid } => {
                drop(child_end);
                let token = Token(self.next_token);
                self.next_token += 1;
                let channel = Channel::new(parent_end, token, &self.reactor)?;
                self.workers.insert(id.clone(), WorkerHandle { pid, channel });
                self.pids.insert(pid, id.clone());
                self.tokens.insert(token, id.clone());
                info!(worker = %id, pid, "worker forked");

                if self.is_worker_disconnected(&id) {
                    self.remove_worker(&id);
                    return Err(ProcError::WorkerUnreachable(id));
                }
                Ok(id)
            }
        }
    }

    fn child_main(&mut self, factory: &dyn WorkerFactory, id: WorkerId, stream: UnixStream) -> ! {
        // The inherited loop state belongs to the parent image; start clean.
        self.reactor.reset_after_fork();
        // Dropping the sibling handles closes their inherited descriptors.
        self.workers.clear();
        self.pids.clear();
        self.tokens.clear();

        let code = match factory
            .make_worker(id.clone(), stream)
            .and_then(|mut worker| worker.run())
        {
            Ok(()) => 0,
            Err(err) => {
                warn!(worker = %id, %err, "worker run failed");
                CHILD_FAILURE_EXIT
            }
        };
        process::exit(code)
    }

    /// Queue a message to `worker`.
    ///
    /// Delivery is asynchronous: success means the bytes are with the OS or
    /// buffered for the next writable event, not that the worker read them.
    pub fn send_message(&mut self, worker: &WorkerId, msg: &Message) -> Result<()> {
        let handle = self
            .workers
            .get_mut(worker)
            .ok_or_else(|| ProcError::UnknownWorker(worker.clone()))?;
        if let Some(observer) = &mut self.send_observer {
            observer(worker, msg);
        }
        handle.channel.send(msg, &self.reactor)
    }

    /// Install a hook that sees every outbound message before it is sent.
    pub fn set_send_observer(&mut self, observer: impl FnMut(&WorkerId, &Message) + 'static) {
        self.send_observer = Some(Box::new(observer));
    }

    pub fn clear_send_observer(&mut self) {
        self.send_observer = None;
    }

    /// Deliver `signal` to a worker. The worker stays tracked; removal comes
    /// through the normal exit paths once the process actually dies.
    pub fn kill_worker(&mut self, worker: &WorkerId, signal: i32) -> Result<()> {
        let handle = self
            .workers
            .get(worker)
            .ok_or_else(|| ProcError::UnknownWorker(worker.clone()))?;
        fork::kill(handle.pid, signal)?;
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.keys().cloned().collect()
    }

    pub fn worker_pid(&self, worker: &WorkerId) -> Option<libc::pid_t> {
        self.workers.get(worker).map(|handle| handle.pid)
    }

    pub fn worker_id_for_pid(&self, pid: libc::pid_t) -> Option<&WorkerId> {
        self.pids.get(&pid)
    }

    /// Live probe of a worker's channel. Unknown workers count as
    /// disconnected.
    pub fn is_worker_disconnected(&self, worker: &WorkerId) -> bool {
        self.workers.get(worker).is_none_or(|handle| {
            !handle.channel.is_readable() && !handle.channel.is_writable()
        })
    }

    /// Schedule a timer; fires as [`SupervisorHandler::on_timer`].
    pub fn add_timer(&self, delay: Duration, periodic: bool) -> TimerId {
        self.reactor.add_timer(delay, periodic)
    }

    pub fn cancel_timer(&self, id: TimerId) {
        self.reactor.cancel_timer(id);
    }

    /// Route deliveries of `sig` to [`SupervisorHandler::on_signal`].
    pub fn watch_signal(&self, sig: i32) -> Result<()> {
        self.reactor.watch_signal(sig)?;
        Ok(())
    }

    /// Request loop exit after the current dispatch batch. Callable from any
    /// handler method.
    pub fn stop(&self) {
        self.reactor.stop();
    }

    /// Run the supervising loop.
    ///
    /// Returns when [`stop`] is called or when nothing remains to wait on
    /// (every worker gone, no timers, no watched signals). Dispatch errors
    /// are routed through [`SupervisorHandler::on_error`] rather than
    /// aborting the loop.
    ///
    /// [`stop`]: Supervisor::stop
    pub fn run(&mut self, handler: &mut dyn SupervisorHandler) -> Result<()> {
        let reactor = Rc::clone(&self.reactor);
        let mut failure = None;
        reactor.run(&mut |event| {
            if let Err(err) = self.dispatch(event, handler) {
                if let Err(fatal) = handler.on_error(self, err) {
                    failure = Some(fatal);
                    self.reactor.stop();
                }
            }
        })?;
        failure.map_or(Ok(()), Err)
    }

    /// Run the loop with a wall-clock cap.
    ///
    /// The deadline is an internal one-shot timer that stops the loop; it
    /// never reaches [`SupervisorHandler::on_timer`], and it is cancelled if
    /// the loop stops earlier for any other reason.
    pub fn run_with_timeout(
        &mut self,
        handler: &mut dyn SupervisorHandler,
        timeout: Duration,
    ) -> Result<()> {
        let timer = self.reactor.add_timer(timeout, false);
        self.deadline_timer = Some(timer);
        let result = self.run(handler);
        if self.deadline_timer.take().is_some() {
            self.reactor.cancel_timer(timer);
        }
        result
    }

    fn dispatch(&mut self, event: Event, handler: &mut dyn SupervisorHandler) -> Result<()> {
        match event {
            Event::Readable(token) => match self.tokens.get(&token).cloned() {
                Some(id) => self.pump_worker(&id, handler),
                // Stale token from a worker already removed by the other path.
                None => Ok(()),
            },
            Event::Writable(token) => {
                if let Some(id) = self.tokens.get(&token).cloned() {
                    if let Some(handle) = self.workers.get_mut(&id) {
                        handle.channel.handle_writable(&self.reactor)?;
                    }
                }
                Ok(())
            }
            Event::Hangup(token) => match self.tokens.get(&token).cloned() {
                Some(id) => self.finish_worker(&id, handler),
                None => Ok(()),
            },
            Event::Signal(libc::SIGCHLD) => self.reap_exited(handler),
            Event::Signal(sig) => handler.on_signal(self, sig),
            Event::Timer(id) if self.deadline_timer == Some(id) => {
                debug!("run deadline reached; stopping loop");
                self.deadline_timer = None;
                self.reactor.stop();
                Ok(())
            }
            Event::Timer(id) => handler.on_timer(self, id),
        }
    }

    /// Drain one worker's channel and deliver what came out.
    fn pump_worker(&mut self, id: &WorkerId, handler: &mut dyn SupervisorHandler) -> Result<()> {
        let outcome = match self.workers.get_mut(id) {
            Some(handle) => handle.channel.handle_readable()?,
            None => return Ok(()),
        };
        for msg in outcome.messages {
            handler.on_message(self, id, msg)?;
        }
        if outcome.desync {
            warn!(worker = %id, "frame sync lost; disconnecting worker");
            self.finish_worker(id, handler)?;
        } else if outcome.eof {
            self.finish_worker(id, handler)?;
        }
        Ok(())
    }

    /// Reap every currently-waitable child and retire the ones we track.
    ///
    /// Runs on SIGCHLD. Pending messages still buffered in a dead worker's
    /// socket are delivered before the exit notification.
    fn reap_exited(&mut self, handler: &mut dyn SupervisorHandler) -> Result<()> {
        while let Some((pid, status)) = fork::reap_any() {
            let Some(id) = self.pids.get(&pid).cloned() else {
                debug!(pid, "reaped untracked child");
                continue;
            };
            debug!(worker = %id, pid, status, "worker reaped");
            self.pump_worker(&id, handler)?;
            self.finish_worker(&id, handler)?;
        }
        Ok(())
    }

    /// Retire a worker and notify the handler. Idempotent: the second path
    /// to reach a worker finds it already gone and does nothing.
    fn finish_worker(&mut self, id: &WorkerId, handler: &mut dyn SupervisorHandler) -> Result<()> {
        let Some(pid) = self.remove_worker(id) else {
            return Ok(());
        };
        handler.on_worker_exit(
            self,
            WorkerExit {
                worker_id: id.clone(),
                pid,
            },
        )
    }

    /// Drop a worker from all three maps and close its channel. Returns the
    /// pid on the first call, `None` on any later one.
    fn remove_worker(&mut self, id: &WorkerId) -> Option<libc::pid_t> {
        let mut handle = self.workers.remove(id)?;
        self.pids.remove(&handle.pid);
        self.tokens.remove(&handle.channel.token());
        handle.channel.close(&self.reactor);
        debug!(worker = %id, pid = handle.pid, "worker removed");
        Some(handle.pid)
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("workers", &self.workers.len())
            .field("next_token", &self.next_token)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use bytes::BytesMut;
    use murmur_frame::encode;

    use super::*;

    #[derive(Default)]
    struct Recording {
        messages: Vec<(WorkerId, Message)>,
        exits: Vec<WorkerExit>,
    }

    impl SupervisorHandler for Recording {
        fn on_message(
            &mut self,
            _sup: &mut Supervisor,
            worker: &WorkerId,
            msg: Message,
        ) -> Result<()> {
            self.messages.push((worker.clone(), msg));
            Ok(())
        }

        fn on_worker_exit(&mut self, _sup: &mut Supervisor, exit: WorkerExit) -> Result<()> {
            self.exits.push(exit);
            Ok(())
        }
    }

    impl Supervisor {
        /// Register a fake worker backed by an in-process socket pair.
        fn insert_stub(&mut self, id: WorkerId, pid: libc::pid_t, stream: UnixStream) -> Token {
            let token = Token(self.next_token);
            self.next_token += 1;
            let channel = Channel::new(stream, token, &self.reactor).unwrap();
            self.workers.insert(id.clone(), WorkerHandle { pid, channel });
            self.pids.insert(pid, id.clone());
            self.tokens.insert(token, id);
            token
        }
    }

    fn wire_for(msg: &Message) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode(msg, &mut buf);
        buf.to_vec()
    }

    #[test]
    fn send_to_unknown_worker_fails() {
        let mut sup = Supervisor::new();
        let msg = Message::new(0, &b""[..]).unwrap();
        let err = sup.send_message(&WorkerId::from("ghost"), &msg).unwrap_err();
        assert!(matches!(err, ProcError::UnknownWorker(_)));
    }

    #[test]
    fn kill_unknown_worker_fails() {
        let mut sup = Supervisor::new();
        let err = sup
            .kill_worker(&WorkerId::from("ghost"), libc::SIGTERM)
            .unwrap_err();
        assert!(matches!(err, ProcError::UnknownWorker(_)));
    }

    #[test]
    fn empty_supervisor_reports_no_workers() {
        let sup = Supervisor::new();
        assert_eq!(sup.worker_count(), 0);
        assert!(sup.worker_ids().is_empty());
        assert!(sup.is_worker_disconnected(&WorkerId::from("ghost")));
    }

    #[test]
    fn readable_dispatch_delivers_messages_in_order() {
        let mut sup = Supervisor::new();
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let token = sup.insert_stub(WorkerId::from("w"), 100, ours);

        let first = Message::new(1, &b"a"[..]).unwrap();
        let second = Message::new(2, &b"b"[..]).unwrap();
        theirs.write_all(&wire_for(&first)).unwrap();
        theirs.write_all(&wire_for(&second)).unwrap();

        let mut handler = Recording::default();
        sup.dispatch(Event::Readable(token), &mut handler).unwrap();

        let kinds: Vec<u8> = handler.messages.iter().map(|(_, m)| m.kind()).collect();
        assert_eq!(kinds, vec![1, 2]);
        assert_eq!(sup.worker_count(), 1);
    }

    #[test]
    fn eof_then_hangup_notifies_exit_exactly_once() {
        let mut sup = Supervisor::new();
        let (ours, theirs) = UnixStream::pair().unwrap();
        let id = WorkerId::from("w");
        let token = sup.insert_stub(id.clone(), 200, ours);
        drop(theirs);

        let mut handler = Recording::default();
        // EOF surfaces through the readable path first, then the same worker
        // gets a (now stale) hangup event. Only one exit comes out.
        sup.dispatch(Event::Readable(token), &mut handler).unwrap();
        sup.dispatch(Event::Hangup(token), &mut handler).unwrap();

        assert_eq!(handler.exits.len(), 1);
        assert_eq!(handler.exits[0].worker_id, id);
        assert_eq!(handler.exits[0].pid, 200);
        assert_eq!(sup.worker_count(), 0);
    }

    #[test]
    fn final_messages_arrive_before_the_exit_notification() {
        let mut sup = Supervisor::new();
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let token = sup.insert_stub(WorkerId::from("w"), 300, ours);

        let last_words = Message::new(9, &b"bye"[..]).unwrap();
        theirs.write_all(&wire_for(&last_words)).unwrap();
        drop(theirs);

        let mut handler = Recording::default();
        sup.dispatch(Event::Readable(token), &mut handler).unwrap();

        assert_eq!(handler.messages.len(), 1);
        assert_eq!(handler.messages[0].1, last_words);
        assert_eq!(handler.exits.len(), 1);
    }

    #[test]
    fn desync_disconnects_the_worker() {
        let mut sup = Supervisor::new();
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let token = sup.insert_stub(WorkerId::from("w"), 400, ours);

        let mut garbage = wire_for(&Message::new(1, &b"x"[..]).unwrap());
        garbage[0] = 0xAA;
        theirs.write_all(&garbage).unwrap();

        let mut handler = Recording::default();
        sup.dispatch(Event::Readable(token), &mut handler).unwrap();

        assert!(handler.messages.is_empty());
        assert_eq!(handler.exits.len(), 1);
        assert_eq!(sup.worker_count(), 0);
    }

    #[test]
    fn send_observer_sees_outbound_messages() {
        let mut sup = Supervisor::new();
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let id = WorkerId::from("w");
        sup.insert_stub(id.clone(), 500, ours);

        let seen = Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        sup.set_send_observer(move |worker, msg| {
            sink.borrow_mut().push((worker.clone(), msg.kind()));
        });

        let msg = Message::new(7, &b"hi"[..]).unwrap();
        sup.send_message(&id, &msg).unwrap();

        assert_eq!(seen.borrow().as_slice(), &[(id, 7u8)]);
    }

    #[test]
    fn run_deadline_stops_an_otherwise_idle_loop() {
        let mut sup = Supervisor::new();
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let id = WorkerId::from("w");
        sup.insert_stub(id.clone(), 700, ours);

        let mut handler = Recording::default();
        sup.run_with_timeout(&mut handler, Duration::from_millis(10))
            .unwrap();

        // The worker produced no traffic; the deadline is what ended the
        // loop, and it never surfaced as an application timer.
        assert!(handler.messages.is_empty());
        assert!(handler.exits.is_empty());
        assert_eq!(sup.worker_count(), 1);
    }

    #[test]
    fn stub_worker_lookups_are_consistent() {
        let mut sup = Supervisor::new();
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let id = WorkerId::from("w");
        sup.insert_stub(id.clone(), 600, ours);

        assert_eq!(sup.worker_pid(&id), Some(600));
        assert_eq!(sup.worker_id_for_pid(600), Some(&id));
        assert!(!sup.is_worker_disconnected(&id));
    }
}
