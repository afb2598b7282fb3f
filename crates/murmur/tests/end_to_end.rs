#![cfg(unix)]

//! Full fork-and-supervise scenarios: a real master process forking real
//! worker processes and exchanging framed messages with them.

use std::collections::BTreeSet;
use std::os::unix::net::UnixStream;
use std::sync::{Mutex, MutexGuard};

use murmur::frame::Message;
use murmur::proc::{
    ProcError, Result, Supervisor, SupervisorHandler, WorkerExit, WorkerFactory, WorkerHandler,
    WorkerId, WorkerMain, WorkerRuntime,
};

// Message kinds used by the test protocol.
const PING: u8 = 0;
const PONG: u8 = 1;
const WHOAMI: u8 = 2;
const IDENTITY: u8 = 3;
const QUIT: u8 = 10;

// Forking from a threaded test harness and the process-global signal relay
// both require these scenarios to run one at a time.
static FORK_LOCK: Mutex<()> = Mutex::new(());

fn serialize() -> MutexGuard<'static, ()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    FORK_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Worker logic: answer pings and identity requests, quit on request.
struct EchoLogic;

impl WorkerHandler for EchoLogic {
    fn on_message(&mut self, runtime: &mut WorkerRuntime, msg: Message) -> Result<()> {
        match msg.kind() {
            PING => {
                let reply =
                    Message::new(PONG, msg.payload().clone()).map_err(ProcError::Frame)?;
                runtime.send(&reply)
            }
            WHOAMI => {
                let name = runtime.id().to_string().into_bytes();
                let reply = Message::new(IDENTITY, name).map_err(ProcError::Frame)?;
                runtime.send(&reply)
            }
            QUIT => {
                runtime.disconnect();
                runtime.stop();
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

struct EchoWorker {
    runtime: WorkerRuntime,
}

impl WorkerMain for EchoWorker {
    fn run(&mut self) -> Result<()> {
        self.runtime.run(&mut EchoLogic)
    }
}

struct EchoFactory;

impl WorkerFactory for EchoFactory {
    fn make_worker(&self, id: WorkerId, stream: UnixStream) -> Result<Box<dyn WorkerMain>> {
        Ok(Box::new(EchoWorker {
            runtime: WorkerRuntime::new(id, stream)?,
        }))
    }
}

/// Master logic: record replies, quit workers after their pong, stop the
/// loop once the last worker is gone.
#[derive(Default)]
struct Master {
    pongs: Vec<(WorkerId, Vec<u8>)>,
    identities: Vec<(WorkerId, Vec<u8>)>,
    exits: Vec<WorkerExit>,
}

impl SupervisorHandler for Master {
    fn on_message(&mut self, sup: &mut Supervisor, worker: &WorkerId, msg: Message) -> Result<()> {
        match msg.kind() {
            PONG => {
                self.pongs.push((worker.clone(), msg.payload().to_vec()));
                sup.send_message(worker, &Message::new(QUIT, &b""[..]).map_err(ProcError::Frame)?)
            }
            IDENTITY => {
                self.identities.push((worker.clone(), msg.payload().to_vec()));
                sup.send_message(worker, &Message::new(QUIT, &b""[..]).map_err(ProcError::Frame)?)
            }
            _ => Ok(()),
        }
    }

    fn on_worker_exit(&mut self, sup: &mut Supervisor, exit: WorkerExit) -> Result<()> {
        self.exits.push(exit);
        if sup.worker_count() == 0 {
            sup.stop();
        }
        Ok(())
    }
}

#[test]
fn ping_pong_then_clean_exit() {
    let _guard = serialize();

    let mut sup = Supervisor::new();
    let id = sup.create_worker(&EchoFactory).expect("fork should succeed");
    assert_eq!(sup.worker_count(), 1);
    assert!(!sup.is_worker_disconnected(&id));

    let ping = Message::new(PING, &b"hello"[..]).expect("small payload");
    sup.send_message(&id, &ping).expect("send should queue");

    let mut master = Master::default();
    sup.run(&mut master).expect("loop should finish cleanly");

    assert_eq!(master.pongs, vec![(id.clone(), b"hello".to_vec())]);
    assert_eq!(master.exits.len(), 1);
    assert_eq!(master.exits[0].worker_id, id);
    assert_eq!(sup.worker_count(), 0);
}

#[test]
fn worker_reports_the_id_the_master_assigned() {
    let _guard = serialize();

    let mut sup = Supervisor::new();
    let id = sup.create_worker(&EchoFactory).expect("fork should succeed");

    let ask = Message::new(WHOAMI, &b""[..]).expect("empty payload");
    sup.send_message(&id, &ask).expect("send should queue");

    let mut master = Master::default();
    sup.run(&mut master).expect("loop should finish cleanly");

    assert_eq!(
        master.identities,
        vec![(id.clone(), id.as_str().as_bytes().to_vec())]
    );
}

#[test]
fn killed_worker_produces_exactly_one_exit() {
    let _guard = serialize();

    let mut sup = Supervisor::new();
    let id = sup.create_worker(&EchoFactory).expect("fork should succeed");
    let pid = sup.worker_pid(&id).expect("tracked worker has a pid");

    sup.kill_worker(&id, libc::SIGKILL).expect("kill should reach the child");

    let mut master = Master::default();
    sup.run(&mut master).expect("loop should finish cleanly");

    assert!(master.pongs.is_empty());
    assert_eq!(master.exits.len(), 1);
    assert_eq!(master.exits[0].worker_id, id);
    assert_eq!(master.exits[0].pid, pid);
    assert_eq!(sup.worker_count(), 0);
}

#[test]
fn several_workers_run_and_retire_independently() {
    let _guard = serialize();

    let mut sup = Supervisor::new();
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(sup.create_worker(&EchoFactory).expect("fork should succeed"));
    }
    assert_eq!(sup.worker_count(), 3);

    for id in &ids {
        let ping = Message::new(PING, id.as_str().as_bytes().to_vec()).expect("small payload");
        sup.send_message(id, &ping).expect("send should queue");
    }

    let mut master = Master::default();
    sup.run(&mut master).expect("loop should finish cleanly");

    // Each worker echoed its own ping payload back, in whatever order the
    // scheduler produced.
    let expected: BTreeSet<_> = ids
        .iter()
        .map(|id| (id.clone(), id.as_str().as_bytes().to_vec()))
        .collect();
    let got: BTreeSet<_> = master.pongs.into_iter().collect();
    assert_eq!(got, expected);

    let exited: BTreeSet<_> = master.exits.iter().map(|e| e.worker_id.clone()).collect();
    assert_eq!(exited, ids.iter().cloned().collect::<BTreeSet<_>>());
    assert_eq!(sup.worker_count(), 0);
}

#[test]
fn sending_to_a_retired_worker_is_an_error() {
    let _guard = serialize();

    let mut sup = Supervisor::new();
    let id = sup.create_worker(&EchoFactory).expect("fork should succeed");

    sup.send_message(&id, &Message::new(QUIT, &b""[..]).expect("empty payload"))
        .expect("send should queue");

    let mut master = Master::default();
    sup.run(&mut master).expect("loop should finish cleanly");
    assert_eq!(master.exits.len(), 1);

    let err = sup
        .send_message(&id, &Message::new(PING, &b""[..]).expect("empty payload"))
        .expect_err("retired worker must be unknown");
    assert!(matches!(err, ProcError::UnknownWorker(gone) if gone == id));
}
