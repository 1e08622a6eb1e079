use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use range::config::StoreDaemonConfig;
use range::error::{CResult, Error};
use range::msg::{AckType, Request, RequestType};
use range::store::Store;

use crate::client::RangePaxosClient;
use crate::network::UdpMultiClient;
use crate::paxos::{backoff_ms, quorum, MAX_PREPARE_ROUNDS};
use crate::worker::{Worker, POLL_INTERVAL_MS};

/// The proposer role: one worker draining a queue of pending write
/// requests, running single-decree prepare/propose rounds against the
/// accepters with a monotonic proposal-number high-water mark.
pub struct Proposer {
    cfg: Arc<StoreDaemonConfig>,
    store: Arc<Store>,
    rx: Receiver<Request>,
    shutdown: Arc<AtomicBool>,
    proposal_number: u64,
    accepters: Vec<String>,
}

impl Proposer {
    pub fn new(
        cfg: Arc<StoreDaemonConfig>,
        store: Arc<Store>,
        rx: Receiver<Request>,
        shutdown: Arc<AtomicBool>,
    ) -> Proposer {
        Proposer { cfg, store, rx, shutdown, proposal_number: 1, accepters: Vec::new() }
    }

    /// The node currently empowered to propose: the head of the proposers
    /// cluster, or the second entry while handling a failover request.
    fn distinguished_proposer(&self, secondary: bool) -> CResult<String> {
        let rcl = RangePaxosClient::new(Arc::clone(&self.cfg), Arc::clone(&self.store));
        let proposers = rcl.proposers()?;
        if secondary && proposers.len() > 1 {
            return Ok(proposers[1].clone());
        }
        Ok(proposers.first().cloned().unwrap_or_default())
    }

    fn refresh_accepters(&mut self) -> CResult<()> {
        let rcl = RangePaxosClient::new(Arc::clone(&self.cfg), Arc::clone(&self.store));
        self.accepters = rcl.accepters()?;
        Ok(())
    }

    /// One prepare round. True on quorum of promises; on rejection the
    /// proposal number is advanced past the highest number seen.
    fn prepare(&mut self, req: &Request) -> CResult<bool> {
        self.refresh_accepters()?;
        if self.accepters.is_empty() {
            return Err(Error::QuorumUnreachable);
        }
        let needed = quorum(self.accepters.len());

        let mut prepare = req.clone();
        prepare.rtype = RequestType::Prepare;
        prepare.proposal_num = self.proposal_number;
        prepare.proposer_id = crc32fast::hash(self.cfg.node_id.as_bytes());
        let payload = prepare.seal()?;

        let mut client = UdpMultiClient::new(&self.accepters, self.cfg.port);
        let results = client.timed_send(
            &payload,
            self.cfg.stored_request_timeout / 3,
            Some(needed),
            AckType::Promise.bit() | AckType::Nack.bit(),
        )?;

        let mut promises = 0usize;
        let mut highest_seen = self.proposal_number;
        for ack in results.values() {
            match ack.atype {
                AckType::Nack => {
                    log::debug!("prepare nack at {}", ack.proposal_num);
                    highest_seen = highest_seen.max(ack.proposal_num);
                }
                AckType::Promise => promises += 1,
                other => log::error!("unexpected ack type {:?} during prepare", other),
            }
        }

        if promises >= needed {
            return Ok(true);
        }
        log::debug!("prepare quorum missed: {} promises, wanted {}", promises, needed);
        self.proposal_number = highest_seen + 1;
        Ok(false)
    }

    /// One propose round under the prepared number. True on quorum of
    /// acceptances.
    fn propose(&mut self, req: &Request) -> CResult<bool> {
        let needed = quorum(self.accepters.len());

        let mut propose = req.clone();
        propose.rtype = RequestType::Propose;
        propose.proposal_num = self.proposal_number;
        propose.proposer_id = crc32fast::hash(self.cfg.node_id.as_bytes());
        propose.timestamp = chrono::Utc::now().timestamp_millis() as u64;
        let payload = propose.seal()?;

        let mut client = UdpMultiClient::new(&self.accepters, self.cfg.port);
        let results = client.timed_send(
            &payload,
            self.cfg.stored_request_timeout / 3,
            Some(needed),
            AckType::Accepted.bit() | AckType::Nack.bit(),
        )?;

        let mut accepted = 0usize;
        let mut highest_seen = self.proposal_number;
        for ack in results.values() {
            match ack.atype {
                AckType::Nack => highest_seen = highest_seen.max(ack.proposal_num),
                AckType::Accepted => accepted += 1,
                _ => {}
            }
        }
        self.proposal_number = highest_seen + 1;
        Ok(accepted >= needed)
    }

    /// Runs a request to consensus or gives up. A request that cannot reach
    /// a prepare quorum within the round limit is dropped; the client will
    /// retry.
    pub fn process(&mut self, req: &Request) -> CResult<()> {
        let secondary = req.rtype == RequestType::Failover;
        let distinguished = self.distinguished_proposer(secondary)?;
        if self.cfg.node_id != distinguished {
            log::debug!(
                "not the distinguished proposer ({} is), dropping {}",
                distinguished,
                req.method
            );
            return Ok(());
        }
        log::debug!("proposing {} for {}", req.method, req.client_id);

        let mut rounds: u32 = 1;
        while rounds < MAX_PREPARE_ROUNDS && !self.shutdown.load(Ordering::SeqCst) {
            while !self.prepare(req)? {
                rounds += 1;
                if rounds >= MAX_PREPARE_ROUNDS || self.shutdown.load(Ordering::SeqCst) {
                    return Err(Error::QuorumUnreachable);
                }
                std::thread::sleep(Duration::from_millis(backoff_ms(rounds)));
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            if self.propose(req)? {
                log::info!("proposed {} at {}", req.method, self.proposal_number);
                return Ok(());
            }
            rounds += 1;
        }
        Err(Error::QuorumUnreachable)
    }
}

impl Worker for Proposer {
    fn title(&self) -> &'static str {
        "Proposer"
    }

    fn event_task(&mut self) -> CResult<()> {
        let req = match self.rx.recv_timeout(Duration::from_millis(POLL_INTERVAL_MS)) {
            Ok(req) => req,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => return Ok(()),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                return Err(Error::Cancelled)
            }
        };
        match self.process(&req) {
            Ok(()) => Ok(()),
            // An unreachable quorum drops the request; the proposer itself
            // stays up for the client's retry.
            Err(Error::QuorumUnreachable) => {
                log::warn!("dropping {} after exhausting prepare rounds", req.method);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use range::api::RangeAPI;

    fn setup(node_id: &str, timeout_ms: u64) -> (Proposer, crossbeam_channel::Sender<Request>) {
        let cfg = Arc::new(StoreDaemonConfig {
            node_id: node_id.to_string(),
            stored_request_timeout: timeout_ms,
            ..Default::default()
        });
        let store = Arc::new(Store::in_memory());
        let (tx, rx) = crossbeam_channel::bounded(16);
        let shutdown = Arc::new(AtomicBool::new(false));
        (Proposer::new(cfg, store, rx, shutdown), tx)
    }

    fn seed_proposers(proposer: &Proposer, nodes: &[&str]) {
        let api = RangeAPI::new(Arc::clone(&proposer.store));
        api.create_env("_local_").unwrap();
        api.add_cluster_to_env("_local_", "range_cell.proposers").unwrap();
        for node in nodes {
            api.add_host_to_cluster("_local_", "range_cell.proposers", node).unwrap();
        }
    }

    #[test]
    fn non_distinguished_proposers_drop_requests() -> CResult<()> {
        let (mut proposer, _tx) = setup("node2", 300);
        seed_proposers(&proposer, &["node1", "node2"]);

        // node2 is not the head, so the request is quietly dropped.
        let req = Request::new(RequestType::Request, "create_env");
        proposer.process(&req)?;

        // But a failover request promotes the second entry.
        let req = Request::new(RequestType::Failover, "remove_host_from_cluster");
        assert_eq!(proposer.distinguished_proposer(true)?, "node2");
        // With no accepters configured no round can reach quorum.
        assert!(matches!(proposer.process(&req), Err(Error::QuorumUnreachable)));
        Ok(())
    }

    #[test]
    fn no_accepters_means_no_quorum() {
        let (mut proposer, _tx) = setup("node1", 300);
        seed_proposers(&proposer, &["node1"]);
        let req = Request::new(RequestType::Request, "create_env");
        assert!(matches!(proposer.process(&req), Err(Error::QuorumUnreachable)));
    }

    #[test]
    fn nack_advances_the_proposal_number() -> CResult<()> {
        use range::msg::{Ack, MAX_PAYLOAD};
        use std::net::UdpSocket;

        let (mut proposer, _tx) = setup("node1", 2_000);
        seed_proposers(&proposer, &["node1"]);

        // One accepter that always nacks with a high promised number.
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = sock.local_addr().unwrap();
        let nacker = std::thread::spawn(move || {
            let mut buf = [0u8; MAX_PAYLOAD];
            let (_, from) = sock.recv_from(&mut buf).unwrap();
            let mut ack = Ack::new(AckType::Nack, false);
            ack.proposal_num = 41;
            let payload = ack.seal().unwrap();
            sock.send_to(&payload, from).unwrap();
        });

        let api = RangeAPI::new(Arc::clone(&proposer.store));
        api.add_cluster_to_env("_local_", "range_cell.accepters")?;
        api.add_host_to_cluster("_local_", "range_cell.accepters", &addr.to_string())?;

        let req = Request::new(RequestType::Request, "create_env");
        assert!(!proposer.prepare(&req)?);
        assert_eq!(proposer.proposal_number, 42);
        nacker.join().unwrap();
        Ok(())
    }
}
