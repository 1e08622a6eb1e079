mod accepter;
mod learner;
mod proposer;

pub use accepter::Accepter;
pub use learner::Learner;
pub use proposer::Proposer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use range::error::{CResult, Error};
use range::msg::Request;

/// Capacity of each role's inbound queue. Overflow blocks the producer,
/// which is a configuration problem, not a runtime one.
pub const QUEUE_CAPACITY: usize = 1024;

/// The consensus quorum: ⌈0.60 × n⌉ of the accepters.
pub fn quorum(accepters: usize) -> usize {
    (accepters as f64 * 0.60).ceil() as usize
}

/// Triangular backoff delay for the nth failed prepare round, in
/// milliseconds.
pub fn backoff_ms(round: u32) -> u64 {
    ((round as u64) * (round as u64 + 1) / 2) * 10
}

/// How many prepare rounds a proposer attempts before dropping a request.
pub const MAX_PREPARE_ROUNDS: u32 = 42;

/// The senders feeding the role threads, owned by the supervisor and passed
/// by handle. The replay flag stalls the accepter while the learner is
/// catching up from a peer.
#[derive(Clone)]
pub struct Queues {
    pub proposer: Sender<Request>,
    pub accepter: Sender<Request>,
    pub learner: Sender<Request>,
    replaying: Arc<AtomicBool>,
}

/// The matching receive sides, handed to the role constructors.
pub struct QueueReceivers {
    pub proposer: Receiver<Request>,
    pub accepter: Receiver<Request>,
    pub learner: Receiver<Request>,
}

impl Queues {
    pub fn new() -> (Queues, QueueReceivers) {
        let (proposer_tx, proposer_rx) = bounded(QUEUE_CAPACITY);
        let (accepter_tx, accepter_rx) = bounded(QUEUE_CAPACITY);
        let (learner_tx, learner_rx) = bounded(QUEUE_CAPACITY);
        (
            Queues {
                proposer: proposer_tx,
                accepter: accepter_tx,
                learner: learner_tx,
                replaying: Arc::new(AtomicBool::new(false)),
            },
            QueueReceivers { proposer: proposer_rx, accepter: accepter_rx, learner: learner_rx },
        )
    }

    /// Enqueues without blocking the caller; a full queue is reported as
    /// resource exhaustion.
    pub fn submit(&self, queue: &Sender<Request>, req: Request) -> CResult<()> {
        match queue.try_send(req) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::ResourceExhausted),
            Err(TrySendError::Disconnected(_)) => Err(Error::Cancelled),
        }
    }

    pub fn set_replaying(&self, replaying: bool) {
        self.replaying.store(replaying, Ordering::SeqCst);
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying.load(Ordering::SeqCst)
    }
}
