use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use range::api::RangeAPI;
use range::config::StoreDaemonConfig;
use range::error::{CResult, Error};
use range::msg::{client_id, Ack, Request, RequestType};
use range::store::Store;

use crate::queue;

/// The environment holding the cell's role clusters.
pub const LOCAL_ENV: &str = "_local_";

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Reads the paxos-role membership out of the range itself: the clusters
/// `<cell>.proposers`, `<cell>.accepters`, and `<cell>.learners` under the
/// `_local_` environment.
pub struct RangePaxosClient {
    cfg: Arc<StoreDaemonConfig>,
    store: Arc<Store>,
}

impl RangePaxosClient {
    pub fn new(cfg: Arc<StoreDaemonConfig>, store: Arc<Store>) -> RangePaxosClient {
        RangePaxosClient { cfg, store }
    }

    pub fn proposers(&self) -> CResult<Vec<String>> {
        self.hosts("proposers")
    }

    pub fn accepters(&self) -> CResult<Vec<String>> {
        self.hosts("accepters")
    }

    pub fn learners(&self) -> CResult<Vec<String>> {
        self.hosts("learners")
    }

    pub fn env_name(&self) -> &'static str {
        LOCAL_ENV
    }

    pub fn cluster_name(&self, role: &str) -> String {
        self.cfg.cell_cluster(role)
    }

    fn hosts(&self, role: &str) -> CResult<Vec<String>> {
        let api = RangeAPI::new(Arc::clone(&self.store));
        let cluster = self.cluster_name(role);
        match api.simple_expand_cluster(LOCAL_ENV, &cluster) {
            Ok(value) => value.as_strings().ok_or_else(|| {
                Error::Value(format!("unexpected expansion shape for {}", cluster))
            }),
            Err(Error::NodeNotFound(_)) | Err(Error::InvalidEnvironment(_)) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }
}

/// A write request bound for the replication pipeline: built here, submitted
/// onto the local request queue, and (optionally) awaited on the
/// acknowledgment channel.
pub struct WriteRequest {
    cfg: Arc<StoreDaemonConfig>,
    req: Request,
}

impl WriteRequest {
    pub fn new(cfg: Arc<StoreDaemonConfig>, method: &str) -> WriteRequest {
        let mut req = Request::new(RequestType::Request, method);
        req.client_id = client_id(&cfg.node_id);
        req.request_id = NEXT_REQUEST_ID.fetch_add(1, Ordering::SeqCst);
        WriteRequest { cfg, req }
    }

    pub fn set_type(&mut self, rtype: RequestType) {
        self.req.rtype = rtype;
    }

    pub fn add_arg(&mut self, arg: &str) {
        self.req.args.push(arg.to_string());
    }

    pub fn request_id(&self) -> u64 {
        self.req.request_id
    }

    pub fn client_id(&self) -> &str {
        &self.req.client_id
    }

    /// Enqueues the request on the local request queue.
    pub fn send(&mut self) -> CResult<()> {
        queue::submit(&self.cfg, &mut self.req)
    }

    /// Enqueues and waits for the correlated acknowledgment.
    pub fn send_and_wait(&mut self) -> CResult<Ack> {
        let listener = queue::AckListener::bind(&self.cfg, &self.req.client_id)?;
        queue::submit(&self.cfg, &mut self.req)?;
        listener.await_ack(self.req.request_id, self.cfg.reader_ack_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use range::record::NodeType;

    fn cfg() -> Arc<StoreDaemonConfig> {
        Arc::new(StoreDaemonConfig { node_id: "node1".to_string(), ..Default::default() })
    }

    #[test]
    fn role_clusters_resolve_to_hosts() -> CResult<()> {
        let cfg = cfg();
        let store = Arc::new(Store::in_memory());
        let api = RangeAPI::new(Arc::clone(&store));
        api.create_env(LOCAL_ENV)?;
        api.add_cluster_to_env(LOCAL_ENV, "range_cell.proposers")?;
        api.add_host_to_cluster(LOCAL_ENV, "range_cell.proposers", "node1")?;
        api.add_host_to_cluster(LOCAL_ENV, "range_cell.proposers", "node2")?;

        let rcl = RangePaxosClient::new(cfg, store);
        assert_eq!(rcl.proposers()?, vec!["node1", "node2"]);
        // Clusters that do not exist yet read as empty, not as errors.
        assert_eq!(rcl.accepters()?, Vec::<String>::new());
        Ok(())
    }

    #[test]
    fn missing_local_env_reads_as_empty() -> CResult<()> {
        let rcl = RangePaxosClient::new(cfg(), Arc::new(Store::in_memory()));
        assert_eq!(rcl.proposers()?, Vec::<String>::new());
        Ok(())
    }

    #[test]
    fn write_requests_carry_identity() {
        let cfg = cfg();
        let mut wr = WriteRequest::new(Arc::clone(&cfg), "add_host_to_cluster");
        wr.add_arg(LOCAL_ENV);
        wr.add_arg("range_cell.proposers");
        wr.add_arg("node3");
        wr.set_type(RequestType::Failover);

        assert!(wr.client_id().starts_with("node1|"));
        assert!(wr.request_id() > 0);
        assert_eq!(wr.req.args.len(), 3);
        assert_eq!(wr.req.rtype, RequestType::Failover);

        let second = WriteRequest::new(cfg, "create_env");
        assert_ne!(wr.request_id(), second.request_id());
    }

    #[test]
    fn send_and_wait_correlates_the_reply() -> CResult<()> {
        let cfg = Arc::new(StoreDaemonConfig {
            node_id: "node1".to_string(),
            stored_mq_name: format!("client-test-{}", rand::random::<u32>()),
            reader_ack_timeout: 2_000,
            ..Default::default()
        });
        let listener = queue::RequestQueueListener::bind(&cfg)?;

        let mut wr = WriteRequest::new(Arc::clone(&cfg), "create_env");
        wr.add_arg("env1");

        // A stand-in daemon: drain the request, acknowledge it.
        let responder_cfg = Arc::clone(&cfg);
        let responder = std::thread::spawn(move || {
            let req = listener.receive(2_000).unwrap().expect("request expected");
            let mut ack = Ack::new(range::msg::AckType::Ack, true);
            ack.client_id = req.client_id.clone();
            ack.request_id = req.request_id;
            queue::send_ack(&responder_cfg, &req.client_id, &mut ack).unwrap();
        });

        // Give the responder a moment to start draining.
        std::thread::sleep(std::time::Duration::from_millis(50));
        let ack = wr.send_and_wait()?;
        assert!(ack.status);
        assert_eq!(ack.request_id, wr.request_id());
        responder.join().unwrap();
        Ok(())
    }

    #[test]
    fn role_membership_orders_by_insertion() -> CResult<()> {
        // The proposers list orders failover: the head is distinguished.
        let cfg = cfg();
        let store = Arc::new(Store::in_memory());
        let api = RangeAPI::new(Arc::clone(&store));
        api.create_env(LOCAL_ENV)?;
        api.add_cluster_to_env(LOCAL_ENV, "range_cell.proposers")?;
        for node in ["node2", "node1", "node3"] {
            api.add_host_to_cluster(LOCAL_ENV, "range_cell.proposers", node)?;
        }
        {
            let primary = api.primary()?;
            assert_eq!(
                primary.get_node("_local_#range_cell.proposers")?.unwrap().node_type(),
                NodeType::Cluster
            );
        }

        let rcl = RangePaxosClient::new(cfg, store);
        assert_eq!(rcl.proposers()?, vec!["node2", "node1", "node3"]);
        Ok(())
    }
}
