use std::sync::Arc;
use std::time::{Duration, Instant};

use range::config::StoreDaemonConfig;
use range::error::CResult;
use range::msg::{AckType, Request, RequestType};
use range::store::Store;

use crate::client::{RangePaxosClient, WriteRequest};
use crate::network::UdpMultiClient;
use crate::worker::Worker;

/// Proposer liveness detection. Every interval, this node heartbeats its
/// predecessor in the proposers list (the head heartbeats nobody). A dead
/// predecessor is rotated to the tail of the proposers cluster; when this
/// node is second in line, the rotation is issued as a FAILOVER write so
/// the promotion can be decided without the dead head.
pub struct Heartbeat {
    cfg: Arc<StoreDaemonConfig>,
    store: Arc<Store>,
}

impl Heartbeat {
    pub fn new(cfg: Arc<StoreDaemonConfig>, store: Arc<Store>) -> Heartbeat {
        Heartbeat { cfg, store }
    }

    /// Sends one heartbeat to the predecessor. Returns whether it answered;
    /// None when this node has no predecessor to watch.
    fn beat(&self, predecessor: &str) -> CResult<bool> {
        log::debug!("heartbeating {}", predecessor);
        let mut req = Request::new(RequestType::Heartbeat, "none");
        req.client_id = format!("{}|heartbeat", self.cfg.node_id);
        let payload = req.seal()?;

        let mut client = UdpMultiClient::new(&[predecessor.to_string()], self.cfg.port);
        let replies = client.timed_send(
            &payload,
            self.cfg.heartbeat_timeout,
            Some(1),
            AckType::Ack.bit(),
        )?;
        Ok(replies.values().any(|ack| ack.status))
    }

    /// Rotates a failed proposer to the tail of the proposers cluster: one
    /// write removing it, one re-adding it. Both are plain writes unless we
    /// are next in line, in which case they are failover-typed so the
    /// secondary proposer may handle them.
    fn reorder_proposer(&self, failed: &str, failover: bool) -> CResult<()> {
        log::warn!(
            "heartbeat failure with {}{}",
            failed,
            if failover { ", taking over as distinguished proposer" } else { "" }
        );
        let rtype = if failover { RequestType::Failover } else { RequestType::Request };
        let rcl = RangePaxosClient::new(Arc::clone(&self.cfg), Arc::clone(&self.store));
        let cluster = rcl.cluster_name("proposers");

        let mut remove = WriteRequest::new(Arc::clone(&self.cfg), "remove_host_from_cluster");
        remove.set_type(rtype);
        remove.add_arg(rcl.env_name());
        remove.add_arg(&cluster);
        remove.add_arg(failed);
        remove.send()?;

        let mut add = WriteRequest::new(Arc::clone(&self.cfg), "add_host_to_cluster");
        add.set_type(rtype);
        add.add_arg(rcl.env_name());
        add.add_arg(&cluster);
        add.add_arg(failed);
        add.send()
    }
}

impl Worker for Heartbeat {
    fn title(&self) -> &'static str {
        "Heartbeat"
    }

    fn event_task(&mut self) -> CResult<()> {
        let interval = Duration::from_millis(self.cfg.heartbeat_timeout);
        let rcl = RangePaxosClient::new(Arc::clone(&self.cfg), Arc::clone(&self.store));
        let proposers = rcl.proposers()?;

        let position = proposers.iter().position(|p| *p == self.cfg.node_id);
        let predecessor = match position {
            // The head watches nobody; nodes outside the list have nothing
            // to watch either.
            Some(0) | None => {
                std::thread::sleep(interval);
                return Ok(());
            }
            Some(idx) => proposers[idx - 1].clone(),
        };

        let started = Instant::now();
        if self.beat(&predecessor)? {
            if let Some(remaining) = interval.checked_sub(started.elapsed()) {
                std::thread::sleep(remaining);
            }
            return Ok(());
        }

        let failover = proposers.len() > 1 && proposers[1] == self.cfg.node_id;
        if let Err(err) = self.reorder_proposer(&predecessor, failover) {
            // The request queue may not be up yet; the next interval retries.
            log::error!("proposer rotation failed: {}", err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use range::api::RangeAPI;

    #[test]
    fn predecessor_selection_follows_list_order() -> CResult<()> {
        // Indirectly covered through event_task's arithmetic: the second
        // node watches the head, later nodes watch their left neighbor.
        let proposers = vec!["n1".to_string(), "n2".to_string(), "n3".to_string()];
        for (me, expected) in [("n2", Some("n1")), ("n3", Some("n2")), ("n1", None)] {
            let position = proposers.iter().position(|p| p == me);
            let predecessor = match position {
                Some(0) | None => None,
                Some(idx) => Some(proposers[idx - 1].as_str()),
            };
            assert_eq!(predecessor, expected);
        }
        Ok(())
    }

    #[test]
    fn dead_predecessor_triggers_failover_when_second() -> CResult<()> {
        let cfg = Arc::new(StoreDaemonConfig {
            node_id: "n2".to_string(),
            heartbeat_timeout: 50,
            stored_mq_name: format!("hb-test-{}", rand::random::<u32>()),
            ..Default::default()
        });
        let store = Arc::new(Store::in_memory());
        let api = RangeAPI::new(Arc::clone(&store));
        api.create_env("_local_")?;
        api.add_cluster_to_env("_local_", "range_cell.proposers")?;
        // n1 is an unroutable address, so the heartbeat will fail.
        api.add_host_to_cluster("_local_", "range_cell.proposers", "127.0.0.1:1")?;
        api.add_host_to_cluster("_local_", "range_cell.proposers", "n2")?;

        // A bound request queue to capture the rotation writes.
        let listener = crate::queue::RequestQueueListener::bind(&cfg)?;

        let mut heartbeat = Heartbeat::new(Arc::clone(&cfg), store);
        heartbeat.event_task()?;

        let remove = listener.receive(1_000)?.expect("rotation write expected");
        assert_eq!(remove.method, "remove_host_from_cluster");
        assert_eq!(remove.rtype, RequestType::Failover);
        assert_eq!(remove.args, vec!["_local_", "range_cell.proposers", "127.0.0.1:1"]);

        let add = listener.receive(1_000)?.expect("re-add write expected");
        assert_eq!(add.method, "add_host_to_cluster");
        assert_eq!(add.rtype, RequestType::Failover);
        Ok(())
    }
}
