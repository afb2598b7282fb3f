//! Minimal master/worker round trip — forks two workers, pings each, and
//! retires them after the reply comes back.
//!
//! Run with:
//!   cargo run --example ping-pong

use std::os::unix::net::UnixStream;

use murmur::frame::Message;
use murmur::proc::{
    ProcError, Result, Supervisor, SupervisorHandler, WorkerExit, WorkerFactory, WorkerHandler,
    WorkerId, WorkerMain, WorkerRuntime,
};

const PING: u8 = 0;
const PONG: u8 = 1;
const QUIT: u8 = 2;

struct Upcase;

impl WorkerHandler for Upcase {
    fn on_message(&mut self, runtime: &mut WorkerRuntime, msg: Message) -> Result<()> {
        match msg.kind() {
            PING => {
                let shouted = msg.payload().to_ascii_uppercase();
                let reply = Message::new(PONG, shouted).map_err(ProcError::Frame)?;
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

struct UpcaseWorker {
    runtime: WorkerRuntime,
}

impl WorkerMain for UpcaseWorker {
    fn run(&mut self) -> Result<()> {
        self.runtime.run(&mut Upcase)
    }
}

struct UpcaseFactory;

impl WorkerFactory for UpcaseFactory {
    fn make_worker(&self, id: WorkerId, stream: UnixStream) -> Result<Box<dyn WorkerMain>> {
        Ok(Box::new(UpcaseWorker {
            runtime: WorkerRuntime::new(id, stream)?,
        }))
    }
}

struct Master;

impl SupervisorHandler for Master {
    fn on_message(&mut self, sup: &mut Supervisor, worker: &WorkerId, msg: Message) -> Result<()> {
        eprintln!(
            "worker {worker} replied: {}",
            String::from_utf8_lossy(msg.payload())
        );
        let quit = Message::new(QUIT, &b""[..]).map_err(ProcError::Frame)?;
        sup.send_message(worker, &quit)
    }

    fn on_worker_exit(&mut self, sup: &mut Supervisor, exit: WorkerExit) -> Result<()> {
        eprintln!("worker {} (pid {}) retired", exit.worker_id, exit.pid);
        if sup.worker_count() == 0 {
            sup.stop();
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let mut sup = Supervisor::new();

    for greeting in ["hello from one", "hello from two"] {
        let id = sup.create_worker(&UpcaseFactory)?;
        eprintln!("forked worker {id} (pid {:?})", sup.worker_pid(&id));
        let ping = Message::new(PING, greeting.as_bytes().to_vec()).map_err(ProcError::Frame)?;
        sup.send_message(&id, &ping)?;
    }

    sup.run(&mut Master)
}
