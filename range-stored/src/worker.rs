use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use range::error::{CResult, Error};

/// How long a worker blocks on its queue or socket before rechecking the
/// shutdown flag.
pub const POLL_INTERVAL_MS: u64 = 100;

/// A long-running role thread. `event_task` is invoked repeatedly until
/// shutdown; each call should block at most briefly (bounded waits only) so
/// the shutdown flag is honored promptly.
pub trait Worker: Send {
    fn title(&self) -> &'static str;

    /// One-time setup on the worker's own thread.
    fn event_loop_init(&mut self) -> CResult<()> {
        Ok(())
    }

    /// One scheduling quantum of work.
    fn event_task(&mut self) -> CResult<()>;
}

/// A spawned worker thread, joined on shutdown.
pub struct WorkerHandle {
    title: &'static str,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn join(self) {
        if self.thread.join().is_err() {
            log::error!("worker {} panicked", self.title);
        }
    }

    pub fn title(&self) -> &'static str {
        self.title
    }
}

/// Spawns a worker. An error propagated out of the worker is stored in the
/// shared error vector and signals process termination; the supervisor
/// drains the vector on shutdown.
pub fn spawn(
    mut worker: Box<dyn Worker>,
    shutdown: Arc<AtomicBool>,
    errors: Arc<Mutex<Vec<Error>>>,
) -> WorkerHandle {
    let title = worker.title();
    let thread = std::thread::spawn(move || {
        if let Err(err) = worker.event_loop_init() {
            log::error!("{}: init failed: {}", title, err);
            errors.lock().expect("errors mutex poisoned").push(err);
            shutdown.store(true, Ordering::SeqCst);
            return;
        }
        log::info!("{}: running", title);
        while !shutdown.load(Ordering::SeqCst) {
            match worker.event_task() {
                Ok(()) => {}
                Err(Error::Cancelled) => break,
                Err(err) => {
                    log::error!("{}: {}", title, err);
                    errors.lock().expect("errors mutex poisoned").push(err);
                    shutdown.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }
        log::info!("{}: stopped", title);
    });
    WorkerHandle { title, thread }
}
