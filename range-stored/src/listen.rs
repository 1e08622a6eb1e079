use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use range::config::StoreDaemonConfig;
use range::error::CResult;
use range::msg::{Ack, AckType, Request, RequestType, MAX_PAYLOAD};
use range::store::Store;

use crate::network::reply_to;
use crate::paxos::Queues;
use crate::worker::{Worker, POLL_INTERVAL_MS};

/// The inbound datagram server: validates each message, stamps the sender's
/// address onto it, and dispatches to the right role queue. Heartbeats and
/// replay lookups are answered in place.
pub struct ListenServer {
    cfg: Arc<StoreDaemonConfig>,
    store: Arc<Store>,
    queues: Queues,
    sock: UdpSocket,
}

impl ListenServer {
    pub fn new(
        cfg: Arc<StoreDaemonConfig>,
        store: Arc<Store>,
        queues: Queues,
    ) -> CResult<ListenServer> {
        let sock = UdpSocket::bind(("0.0.0.0", cfg.port))?;
        sock.set_read_timeout(Some(Duration::from_millis(POLL_INTERVAL_MS)))?;
        log::info!("listening on {}", sock.local_addr()?);
        Ok(ListenServer { cfg, store, queues, sock })
    }

    /// The bound port; useful when configured with port 0.
    pub fn port(&self) -> CResult<u16> {
        Ok(self.sock.local_addr()?.port())
    }

    /// Handles one validated message.
    pub fn dispatch(&self, req: Request) -> CResult<()> {
        match req.rtype {
            RequestType::Request | RequestType::Failover => {
                self.queues.submit(&self.queues.proposer, req)
            }
            RequestType::Prepare | RequestType::Propose => {
                self.queues.submit(&self.queues.accepter, req)
            }
            RequestType::Learn => self.queues.submit(&self.queues.learner, req),
            RequestType::Heartbeat => {
                let mut ack = Ack::new(AckType::Ack, true);
                ack.request_id = req.request_id;
                ack.client_id = req.client_id.clone();
                reply_to(req.sender_addr, req.sender_port, &mut ack)
            }
            RequestType::Replay => self.serve_replay(&req),
        }
    }

    /// Replay protocol, one datagram per exchange:
    ///
    /// - sequence 0 probes: the reply is an Ack carrying our last log
    ///   sequence.
    /// - sequence n asks for entry n: the logged request comes back typed
    ///   REPLAY. A missing (pruned) entry comes back as a REPLAY request
    ///   with method "none" and the first retained sequence, so the fetch
    ///   path only ever parses requests.
    fn serve_replay(&self, req: &Request) -> CResult<()> {
        if req.sequence_num == 0 {
            let last = self.store.txlog().last()?.map(|(seq, _)| seq).unwrap_or(0);
            let mut ack = Ack::new(AckType::Ack, true);
            ack.request_id = req.request_id;
            ack.client_id = req.client_id.clone();
            ack.proposal_num = last;
            return reply_to(req.sender_addr, req.sender_port, &mut ack);
        }

        let mut entry = match self.store.txlog().find(req.sequence_num)? {
            Some(entry) => entry,
            None => {
                let first = self.store.txlog().first()?.map(|(seq, _)| seq).unwrap_or(0);
                let mut missing = Request::new(RequestType::Replay, "none");
                missing.proposal_num = first;
                missing
            }
        };
        entry.rtype = RequestType::Replay;
        entry.sequence_num = req.sequence_num;
        let payload = entry.seal()?;
        if req.sender_addr != 0 {
            let ip = std::net::Ipv4Addr::from(req.sender_addr);
            let sock = UdpSocket::bind("0.0.0.0:0")?;
            sock.send_to(&payload, SocketAddr::new(IpAddr::V4(ip), req.sender_port as u16))?;
        }
        Ok(())
    }
}

impl Worker for ListenServer {
    fn title(&self) -> &'static str {
        "ListenServer"
    }

    fn event_task(&mut self) -> CResult<()> {
        let mut buf = [0u8; MAX_PAYLOAD];
        let (len, from) = match self.sock.recv_from(&mut buf) {
            Ok(received) => received,
            Err(ref err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Ok(())
            }
            Err(err) => return Err(err.into()),
        };

        let mut req = match Request::unseal(&buf[..len]) {
            Ok(req) => req,
            Err(err) => {
                log::error!("dropping invalid datagram from {}: {}", from, err);
                return Ok(());
            }
        };

        match from {
            SocketAddr::V4(addr) => {
                req.sender_addr = u32::from(*addr.ip());
                req.sender_port = addr.port() as u32;
            }
            SocketAddr::V6(_) => {
                log::error!("dropping datagram from unsupported v6 source {}", from);
                return Ok(());
            }
        }

        log::debug!(
            "received {:?} {} from {} ({})",
            req.rtype,
            req.method,
            from,
            req.client_id
        );
        self.dispatch(req)
    }
}
