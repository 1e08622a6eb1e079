use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use range::api::RangeAPI;
use range::config::StoreDaemonConfig;
use range::error::{CResult, Error};
use range::msg::{Ack, AckType, Request};
use range::store::Store;

use crate::client::RangePaxosClient;
use crate::network::reply_to;
use crate::paxos::quorum;
use crate::queue;
use crate::worker::{Worker, POLL_INTERVAL_MS};

/// A request waiting for enough accepters to echo it.
struct PendingLearn {
    req: Request,
    seen_count: usize,
    needed_count: usize,
    last_seen: Instant,
}

/// The learner role: counts matching LEARN messages per proposal number,
/// applies completed requests through the write-API symbol table in strict
/// ascending proposal order, and answers local clients on the
/// acknowledgment channel.
pub struct Learner {
    cfg: Arc<StoreDaemonConfig>,
    store: Arc<Store>,
    rx: Receiver<Request>,
    api: RangeAPI,
    pending: BTreeMap<u64, PendingLearn>,
}

impl Learner {
    pub fn new(
        cfg: Arc<StoreDaemonConfig>,
        store: Arc<Store>,
        rx: Receiver<Request>,
    ) -> Learner {
        let api = RangeAPI::new(Arc::clone(&store));
        Learner { cfg, store, rx, api, pending: BTreeMap::new() }
    }

    /// Registers one LEARN message: ack the sending accepter, then count it
    /// toward its proposal's quorum when the body matches.
    pub fn handle(&mut self, req: Request) -> CResult<()> {
        let mut ack = Ack::new(AckType::Ack, true);
        ack.request_id = req.request_id;
        ack.proposer_id = req.proposer_id;
        ack.proposal_num = req.proposal_num;
        ack.client_id = req.client_id.clone();
        reply_to(req.sender_addr, req.sender_port, &mut ack)?;

        log::debug!("learn received for proposal {}", req.proposal_num);
        if !self.pending.contains_key(&req.proposal_num) {
            let rcl = RangePaxosClient::new(Arc::clone(&self.cfg), Arc::clone(&self.store));
            let needed_count = quorum(rcl.accepters()?.len());
            self.pending.insert(
                req.proposal_num,
                PendingLearn {
                    req: req.clone(),
                    seen_count: 0,
                    needed_count,
                    last_seen: Instant::now(),
                },
            );
        }
        let entry = self.pending.get_mut(&req.proposal_num).expect("just inserted");
        if req.crc == entry.req.crc {
            entry.seen_count += 1;
            entry.last_seen = Instant::now();
        }
        Ok(())
    }

    /// Applies every leading completed proposal, lowest number first. A
    /// lower proposal that has not reached quorum blocks everything above
    /// it until it completes or ages out.
    pub fn learn_completed_requests(&mut self) -> CResult<()> {
        loop {
            let proposal = match self.pending.iter().next() {
                Some((&proposal, entry)) if entry.seen_count >= entry.needed_count => proposal,
                _ => return Ok(()),
            };
            let entry = self.pending.remove(&proposal).expect("leading entry exists");
            self.learn(&entry.req)?;
        }
    }

    /// Drops pending proposals that never reached quorum within the request
    /// timeout.
    pub fn cleanup_dead_requests(&mut self) {
        let timeout = Duration::from_millis(self.cfg.stored_request_timeout);
        let now = Instant::now();
        self.pending.retain(|proposal, entry| {
            let keep = entry.seen_count >= entry.needed_count
                || now.duration_since(entry.last_seen) <= timeout;
            if !keep {
                log::debug!("flushing dead proposal {}", proposal);
            }
            keep
        });
    }

    /// Applies one learned request and, when the request originated on this
    /// box, acknowledges the local client.
    fn learn(&mut self, req: &Request) -> CResult<()> {
        log::debug!("learning proposal {}: {}", req.proposal_num, req.method);

        let (status, code, reason) = match self.api.apply_request(req) {
            Ok(success) => (success, range::error::ErrorCode::Ok as u32, String::new()),
            Err(err) => {
                log::info!("transaction failed: {}", err);
                (false, err.code(), err.to_string())
            }
        };

        let local_prefix = format!("{}|", self.cfg.node_id);
        if req.client_id.starts_with(&local_prefix) {
            let mut ack = Ack::new(AckType::Ack, status);
            ack.code = code;
            ack.reason = reason;
            ack.client_id = req.client_id.clone();
            ack.request_id = req.request_id;
            queue::send_ack(&self.cfg, &req.client_id, &mut ack)?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Worker for Learner {
    fn title(&self) -> &'static str {
        "Learner"
    }

    fn event_task(&mut self) -> CResult<()> {
        match self.rx.recv_timeout(Duration::from_millis(POLL_INTERVAL_MS)) {
            Ok(req) => {
                self.handle(req)?;
                // Drain whatever else arrived in the meantime.
                while let Ok(req) = self.rx.try_recv() {
                    self.handle(req)?;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                return Err(Error::Cancelled)
            }
        }
        self.cleanup_dead_requests();
        self.learn_completed_requests()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use range::msg::RequestType;

    fn setup(timeout_ms: u64) -> Learner {
        let cfg = Arc::new(StoreDaemonConfig {
            node_id: "node1".to_string(),
            stored_request_timeout: timeout_ms,
            stored_mq_name: format!("learner-test-{}", rand::random::<u32>()),
            ..Default::default()
        });
        let store = Arc::new(Store::in_memory());
        let (_tx, rx) = crossbeam_channel::bounded(16);
        let learner = Learner::new(cfg, store, rx);

        // Three accepters: quorum is two.
        let api = RangeAPI::new(Arc::clone(&learner.store));
        api.create_env("_local_").unwrap();
        api.add_cluster_to_env("_local_", "range_cell.accepters").unwrap();
        for node in ["a1", "a2", "a3"] {
            api.add_host_to_cluster("_local_", "range_cell.accepters", node).unwrap();
        }
        learner
    }

    fn learn_req(proposal: u64, method: &str, args: &[&str]) -> Request {
        let mut req = Request::new(RequestType::Learn, method);
        req.args = args.iter().map(|a| a.to_string()).collect();
        req.proposal_num = proposal;
        req.client_id = "elsewhere|1|aa".to_string();
        req.seal().unwrap();
        req
    }

    #[test]
    fn applies_on_quorum_only() -> CResult<()> {
        let mut learner = setup(30_000);
        let req = learn_req(1, "create_env", &["env1"]);

        learner.handle(req.clone())?;
        learner.learn_completed_requests()?;
        // One sighting of three accepters is not a quorum.
        assert_eq!(learner.api.all_environments()?.as_strings().unwrap().len(), 1); // _local_

        learner.handle(req)?;
        learner.learn_completed_requests()?;
        let envs = learner.api.all_environments()?.as_strings().unwrap();
        assert!(envs.contains(&"env1".to_string()));
        assert_eq!(learner.pending_len(), 0);
        Ok(())
    }

    #[test]
    fn mismatched_bodies_do_not_count() -> CResult<()> {
        let mut learner = setup(30_000);
        let req = learn_req(1, "create_env", &["env1"]);
        let imposter = learn_req(1, "create_env", &["evil"]);

        learner.handle(req.clone())?;
        learner.handle(imposter)?;
        learner.learn_completed_requests()?;
        let envs = learner.api.all_environments()?.as_strings().unwrap();
        assert!(!envs.contains(&"env1".to_string()));
        assert!(!envs.contains(&"evil".to_string()));
        Ok(())
    }

    #[test]
    fn applies_in_ascending_proposal_order() -> CResult<()> {
        let mut learner = setup(30_000);
        let low = learn_req(5, "create_env", &["low"]);
        let high = learn_req(6, "create_env", &["high"]);

        // The higher proposal completes first, but must wait for the lower.
        learner.handle(high.clone())?;
        learner.handle(high)?;
        learner.learn_completed_requests()?;
        assert!(!learner
            .api
            .all_environments()?
            .as_strings()
            .unwrap()
            .contains(&"high".to_string()));

        learner.handle(low.clone())?;
        learner.handle(low)?;
        learner.learn_completed_requests()?;

        // Both applied, in order: the transaction log shows low first.
        let entries = learner.store.txlog().scan_from(1)?;
        let args: Vec<&str> = entries
            .iter()
            .filter(|(_, r)| r.method == "create_env" && r.args[0] != "_local_")
            .map(|(_, r)| r.args[0].as_str())
            .collect();
        assert_eq!(args, vec!["low", "high"]);
        Ok(())
    }

    #[test]
    fn dead_proposals_unblock_their_successors() -> CResult<()> {
        let mut learner = setup(10);
        let stuck = learn_req(1, "create_env", &["stuck"]);
        let ready = learn_req(2, "create_env", &["ready"]);

        learner.handle(stuck)?;
        learner.handle(ready.clone())?;
        learner.handle(ready)?;
        learner.learn_completed_requests()?;
        assert_eq!(learner.pending_len(), 2);

        std::thread::sleep(Duration::from_millis(30));
        learner.cleanup_dead_requests();
        learner.learn_completed_requests()?;

        let envs = learner.api.all_environments()?.as_strings().unwrap();
        assert!(envs.contains(&"ready".to_string()));
        assert!(!envs.contains(&"stuck".to_string()));
        Ok(())
    }

    #[test]
    fn local_clients_get_result_codes() -> CResult<()> {
        let mut learner = setup(30_000);
        let listener = queue::AckListener::bind(&learner.cfg, "node1|9|zz")?;

        // Applying against a missing environment fails with a stable code.
        let mut req = learn_req(1, "add_cluster_to_env", &["ghost", "web"]);
        req.client_id = "node1|9|zz".to_string();
        req.request_id = 44;
        req.seal().unwrap();
        learner.handle(req.clone())?;
        learner.handle(req)?;
        learner.learn_completed_requests()?;

        let ack = listener.await_ack(44, 1_000)?;
        assert!(!ack.status);
        assert_eq!(ack.code, Error::InvalidEnvironment(String::new()).code());
        assert!(!ack.reason.is_empty());
        Ok(())
    }
}
