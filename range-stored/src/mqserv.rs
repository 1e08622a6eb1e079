use std::sync::Arc;

use range::config::StoreDaemonConfig;
use range::error::CResult;
use range::msg::ACK_ANY;
use range::store::Store;

use crate::client::RangePaxosClient;
use crate::network::UdpMultiClient;
use crate::queue::{self, RequestQueueListener};
use crate::worker::{Worker, POLL_INTERVAL_MS};

/// How long the forwarder waits for an immediate UDP acknowledgment before
/// moving on; the authoritative reply arrives later via the learner.
const FORWARD_TIMEOUT_MS: u64 = 500;

/// The message-queue forwarder: drains the local request queue and fans
/// each request out to the current proposers over UDP. Any acknowledgment
/// that comes straight back is copied onto the client's reply channel.
pub struct MQServer {
    cfg: Arc<StoreDaemonConfig>,
    store: Arc<Store>,
    listener: Option<RequestQueueListener>,
}

impl MQServer {
    pub fn new(cfg: Arc<StoreDaemonConfig>, store: Arc<Store>) -> MQServer {
        MQServer { cfg, store, listener: None }
    }
}

impl Worker for MQServer {
    fn title(&self) -> &'static str {
        "MQServer"
    }

    fn event_loop_init(&mut self) -> CResult<()> {
        self.listener = Some(RequestQueueListener::bind(&self.cfg)?);
        Ok(())
    }

    fn event_task(&mut self) -> CResult<()> {
        let listener = self.listener.as_ref().expect("listener bound in init");
        let mut req = match listener.receive(POLL_INTERVAL_MS)? {
            Some(req) => req,
            None => return Ok(()),
        };
        log::debug!("forwarding {} for {}", req.method, req.client_id);

        let rcl = RangePaxosClient::new(Arc::clone(&self.cfg), Arc::clone(&self.store));
        let proposers = rcl.proposers()?;
        if proposers.is_empty() {
            log::error!("no proposers known, dropping {}", req.method);
            return Ok(());
        }

        let payload = req.seal()?;
        let mut client = UdpMultiClient::new(&proposers, self.cfg.port);
        let replies = client.timed_send(&payload, FORWARD_TIMEOUT_MS, Some(1), ACK_ANY)?;
        for ack in replies.values() {
            if ack.client_id == req.client_id && ack.request_id == req.request_id {
                let mut ack = ack.clone();
                queue::send_ack(&self.cfg, &req.client_id, &mut ack)?;
            }
        }
        Ok(())
    }
}
