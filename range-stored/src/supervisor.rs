use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use range::config::StoreDaemonConfig;
use range::error::{CResult, Error};
use range::store::Store;

use crate::heartbeat::Heartbeat;
use crate::listen::ListenServer;
use crate::mqserv::MQServer;
use crate::paxos::{Accepter, Learner, Proposer, Queues};
use crate::replay;
use crate::signal;
use crate::worker::{self, WorkerHandle};

/// Owns the store, the role queues, and every worker thread. Runs until a
/// signal or a worker failure sets the shutdown flag, then joins the
/// workers and drains the error vector.
pub struct Supervisor {
    cfg: Arc<StoreDaemonConfig>,
    shutdown: Arc<AtomicBool>,
    errors: Arc<Mutex<Vec<Error>>>,
}

impl Supervisor {
    pub fn new(cfg: StoreDaemonConfig) -> Supervisor {
        Supervisor {
            cfg: Arc::new(cfg),
            shutdown: Arc::new(AtomicBool::new(false)),
            errors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Opens the store, catches up from a peer, spawns the role threads,
    /// and supervises until shutdown.
    pub fn run(&self) -> CResult<()> {
        let store = Arc::new(Store::open(&self.cfg.db_home)?);
        signal::install(&self.shutdown)?;

        let (queues, receivers) = Queues::new();

        // Catch up (or bootstrap) before accepting any consensus traffic.
        replay::initialize_from_range(&self.cfg, &store, &queues)?;

        let mut handles: Vec<WorkerHandle> = Vec::new();
        let spawn = |w: Box<dyn worker::Worker>, handles: &mut Vec<WorkerHandle>| {
            handles.push(worker::spawn(
                w,
                Arc::clone(&self.shutdown),
                Arc::clone(&self.errors),
            ));
        };

        spawn(
            Box::new(ListenServer::new(
                Arc::clone(&self.cfg),
                Arc::clone(&store),
                queues.clone(),
            )?),
            &mut handles,
        );
        spawn(
            Box::new(Proposer::new(
                Arc::clone(&self.cfg),
                Arc::clone(&store),
                receivers.proposer,
                Arc::clone(&self.shutdown),
            )),
            &mut handles,
        );
        spawn(
            Box::new(Accepter::new(
                Arc::clone(&self.cfg),
                Arc::clone(&store),
                receivers.accepter,
                queues.clone(),
            )?),
            &mut handles,
        );
        spawn(
            Box::new(Learner::new(
                Arc::clone(&self.cfg),
                Arc::clone(&store),
                receivers.learner,
            )),
            &mut handles,
        );
        spawn(Box::new(MQServer::new(Arc::clone(&self.cfg), Arc::clone(&store))), &mut handles);
        spawn(
            Box::new(Heartbeat::new(Arc::clone(&self.cfg), Arc::clone(&store))),
            &mut handles,
        );

        log::info!("range-stored running as {}", self.cfg.node_id);
        while !self.shutdown.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(200));
        }
        log::info!("shutting down");

        for handle in handles {
            handle.join();
        }

        let errors = std::mem::take(&mut *self.errors.lock().expect("errors mutex poisoned"));
        if let Some(first) = errors.first() {
            for err in &errors {
                log::error!("worker failure: {}", err);
            }
            return Err(first.clone());
        }
        Ok(())
    }
}
