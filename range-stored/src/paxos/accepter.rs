use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use range::config::StoreDaemonConfig;
use range::error::{CResult, Error};
use range::msg::{Ack, AckType, Request, RequestType};
use range::store::Store;

use crate::client::RangePaxosClient;
use crate::network::{reply_to, UdpMultiClient};
use crate::paxos::Queues;
use crate::worker::{Worker, POLL_INTERVAL_MS};

const PROMISED_KEY: &str = "paxos.promised_proposal_num";
const ACCEPTED_KEY: &str = "paxos.accepted_proposal_num";

/// The accepter role of the synod: promises proposal numbers, accepts
/// bodies under promised numbers, and fans accepted requests out to the
/// learners. Promise state is persisted so a restarted accepter honors the
/// promises it made.
pub struct Accepter {
    cfg: Arc<StoreDaemonConfig>,
    store: Arc<Store>,
    rx: Receiver<Request>,
    queues: Queues,
    promised_proposal_num: u64,
    accepted_proposal_num: u64,
    /// Local monotonic sequence stamped onto forwarded LEARN messages.
    accepter_seq: u64,
}

fn load_meta(store: &Store, key: &str) -> CResult<u64> {
    match store.meta_get(key)? {
        Some(bytes) => Ok(bincode::deserialize(&bytes)?),
        None => Ok(0),
    }
}

impl Accepter {
    pub fn new(
        cfg: Arc<StoreDaemonConfig>,
        store: Arc<Store>,
        rx: Receiver<Request>,
        queues: Queues,
    ) -> CResult<Accepter> {
        let promised_proposal_num = load_meta(&store, PROMISED_KEY)?;
        let accepted_proposal_num = load_meta(&store, ACCEPTED_KEY)?;
        Ok(Accepter {
            cfg,
            store,
            rx,
            queues,
            promised_proposal_num,
            accepted_proposal_num,
            accepter_seq: 1,
        })
    }

    fn ack(&self, req: &Request, atype: AckType, status: bool, proposal_num: u64) -> CResult<()> {
        let mut ack = Ack::new(atype, status);
        ack.request_id = req.request_id;
        ack.proposer_id = req.proposer_id;
        ack.proposal_num = proposal_num;
        ack.client_id = req.client_id.clone();
        reply_to(req.sender_addr, req.sender_port, &mut ack)
    }

    fn nack(&self, req: &Request) -> CResult<()> {
        log::debug!(
            "nack {}: promised {} accepted {}",
            req.proposal_num,
            self.promised_proposal_num,
            self.accepted_proposal_num
        );
        self.ack(req, AckType::Nack, false, self.promised_proposal_num)
    }

    /// PREPARE: promise the number if it is higher than anything promised
    /// before, otherwise nack with the standing promise.
    pub fn promise(&mut self, req: &Request) -> CResult<()> {
        if req.proposal_num <= self.promised_proposal_num {
            return self.nack(req);
        }
        self.promised_proposal_num = req.proposal_num;
        self.store.meta_put(PROMISED_KEY, bincode::serialize(&self.promised_proposal_num)?)?;
        log::debug!("promise {}", self.promised_proposal_num);
        self.ack(req, AckType::Promise, true, self.promised_proposal_num)
    }

    /// PROPOSE: accept a body exactly under the promised number, then
    /// forward it to every learner with a dense local sequence number.
    pub fn accept(&mut self, req: &Request) -> CResult<()> {
        if req.proposal_num != self.promised_proposal_num
            || req.proposal_num <= self.accepted_proposal_num
        {
            return self.nack(req);
        }
        self.accepted_proposal_num = self.promised_proposal_num;
        self.store.meta_put(ACCEPTED_KEY, bincode::serialize(&self.accepted_proposal_num)?)?;
        log::debug!("accept {}", self.accepted_proposal_num);
        self.ack(req, AckType::Accepted, true, self.accepted_proposal_num)?;

        // Now that we've accepted, send the body to the learners. The sender
        // stamp is cleared: every accepter received the propose from a
        // different proposer socket, and the learner counts its quorum by
        // comparing message checksums.
        let mut learn = req.clone();
        learn.rtype = RequestType::Learn;
        learn.sequence_num = self.accepter_seq;
        learn.sender_addr = 0;
        learn.sender_port = 0;
        self.accepter_seq += 1;
        let payload = learn.seal()?;

        let rcl = RangePaxosClient::new(Arc::clone(&self.cfg), Arc::clone(&self.store));
        let learners = rcl.learners()?;
        if learners.is_empty() {
            log::warn!("no learners configured, accepted request goes nowhere");
            return Ok(());
        }
        let mut client = UdpMultiClient::new(&learners, self.cfg.port);
        client.timed_send(
            &payload,
            self.cfg.stored_request_timeout / 3,
            Some(1),
            AckType::Ack.bit(),
        )?;
        Ok(())
    }

    pub fn promised(&self) -> u64 {
        self.promised_proposal_num
    }

    pub fn accepted(&self) -> u64 {
        self.accepted_proposal_num
    }
}

impl Worker for Accepter {
    fn title(&self) -> &'static str {
        "Accepter"
    }

    fn event_task(&mut self) -> CResult<()> {
        // While the learner replays from a peer, this node must not promise
        // or accept state it has not caught up to yet.
        if self.queues.is_replaying() {
            std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
            return Ok(());
        }
        let req = match self.rx.recv_timeout(Duration::from_millis(POLL_INTERVAL_MS)) {
            Ok(req) => req,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => return Ok(()),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                return Err(Error::Cancelled)
            }
        };
        match req.rtype {
            RequestType::Prepare => self.promise(&req),
            RequestType::Propose => self.accept(&req),
            other => {
                log::error!("accepter ignoring {:?} message", other);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use range::msg::MAX_PAYLOAD;
    use std::net::UdpSocket;

    struct Fixture {
        accepter: Accepter,
        sock: UdpSocket,
        addr: std::net::SocketAddr,
    }

    fn fixture() -> Fixture {
        let cfg = Arc::new(StoreDaemonConfig {
            node_id: "node1".to_string(),
            stored_request_timeout: 300,
            ..Default::default()
        });
        let store = Arc::new(Store::in_memory());
        let (_tx, rx) = crossbeam_channel::bounded(16);
        let (queues, _receivers) = Queues::new();
        let accepter = Accepter::new(cfg, store, rx, queues).unwrap();

        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.set_read_timeout(Some(Duration::from_millis(2_000))).unwrap();
        let addr = sock.local_addr().unwrap();
        Fixture { accepter, sock, addr }
    }

    fn prepare(fx: &Fixture, n: u64) -> Request {
        let mut req = Request::new(RequestType::Prepare, "create_env");
        req.proposal_num = n;
        req.request_id = n;
        match fx.addr.ip() {
            std::net::IpAddr::V4(ip) => req.sender_addr = u32::from(ip),
            _ => unreachable!(),
        }
        req.sender_port = fx.addr.port() as u32;
        req
    }

    fn recv_ack(fx: &Fixture) -> Ack {
        let mut buf = [0u8; MAX_PAYLOAD];
        let (len, _) = fx.sock.recv_from(&mut buf).unwrap();
        Ack::unseal(&buf[..len]).unwrap()
    }

    #[test]
    fn promises_are_monotonic() -> CResult<()> {
        let mut fx = fixture();

        fx.accepter.promise(&prepare(&fx, 5))?;
        let ack = recv_ack(&fx);
        assert_eq!(ack.atype, AckType::Promise);
        assert_eq!(ack.proposal_num, 5);

        // An equal or lower number is nacked with the standing promise.
        fx.accepter.promise(&prepare(&fx, 5))?;
        let ack = recv_ack(&fx);
        assert_eq!(ack.atype, AckType::Nack);
        assert_eq!(ack.proposal_num, 5);

        fx.accepter.promise(&prepare(&fx, 3))?;
        assert_eq!(recv_ack(&fx).atype, AckType::Nack);

        // A higher number supersedes.
        fx.accepter.promise(&prepare(&fx, 9))?;
        let ack = recv_ack(&fx);
        assert_eq!(ack.atype, AckType::Promise);
        assert_eq!(ack.proposal_num, 9);
        Ok(())
    }

    #[test]
    fn accepts_only_the_promised_number() -> CResult<()> {
        let mut fx = fixture();
        fx.accepter.promise(&prepare(&fx, 7))?;
        recv_ack(&fx);

        // A different number than promised is rejected.
        let mut wrong = prepare(&fx, 6);
        wrong.rtype = RequestType::Propose;
        fx.accepter.accept(&wrong)?;
        assert_eq!(recv_ack(&fx).atype, AckType::Nack);

        let mut right = prepare(&fx, 7);
        right.rtype = RequestType::Propose;
        fx.accepter.accept(&right)?;
        let ack = recv_ack(&fx);
        assert_eq!(ack.atype, AckType::Accepted);
        assert_eq!(ack.proposal_num, 7);

        // Re-proposing an already accepted number is rejected.
        fx.accepter.accept(&right)?;
        assert_eq!(recv_ack(&fx).atype, AckType::Nack);
        Ok(())
    }

    #[test]
    fn promise_state_survives_restart() -> CResult<()> {
        let mut fx = fixture();
        fx.accepter.promise(&prepare(&fx, 11))?;
        recv_ack(&fx);

        // A new accepter over the same store starts from the persisted
        // promise.
        let (_tx, rx) = crossbeam_channel::bounded(16);
        let (queues, _receivers) = Queues::new();
        let reborn = Accepter::new(
            Arc::clone(&fx.accepter.cfg),
            Arc::clone(&fx.accepter.store),
            rx,
            queues,
        )?;
        assert_eq!(reborn.promised(), 11);
        Ok(())
    }
}
