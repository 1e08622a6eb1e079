use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use range::api::RangeAPI;
use range::config::StoreDaemonConfig;
use range::error::{CResult, Error};
use range::msg::{client_id, Ack, AckType, Request, RequestType, MAX_PAYLOAD};
use range::store::Store;

use crate::client::{RangePaxosClient, LOCAL_ENV};
use crate::network::UdpMultiClient;
use crate::paxos::Queues;

const PROBE_TIMEOUT_MS: u64 = 500;
const FETCH_TIMEOUT_MS: u64 = 1_000;
const FETCH_RETRIES: u32 = 3;

/// Startup catch-up: probe the known peers with a REPLAY request, stream
/// the transaction log from a random responder, and fall back to
/// bootstrapping the cell clusters when nobody answers and the range has
/// no peers recorded yet.
pub fn initialize_from_range(
    cfg: &Arc<StoreDaemonConfig>,
    store: &Arc<Store>,
    queues: &Queues,
) -> CResult<()> {
    let rcl = RangePaxosClient::new(Arc::clone(cfg), Arc::clone(store));
    let range_peers = rcl.accepters()?;
    let have_range_peers = !range_peers.is_empty();

    let mut peers = range_peers;
    peers.extend(cfg.initial_peers.iter().cloned());
    peers.sort();
    peers.dedup();

    if peers.is_empty() {
        return Err(Error::Value(
            "no peers found in range or in configuration; \
             if you are running a solo instance, just disable stored"
                .to_string(),
        ));
    }

    // Never replay from ourselves.
    let targets: Vec<String> = peers.iter().filter(|p| **p != cfg.node_id).cloned().collect();

    let responders = probe_peers(cfg, &targets)?;
    if responders.is_empty() {
        if !have_range_peers {
            log::info!("no replay peers answered; bootstrapping the cell clusters");
            initialize_range_cluster(cfg, store, &peers)?;
        }
        return Ok(());
    }

    let peer = responders
        .choose(&mut rand::thread_rng())
        .expect("responders is non-empty")
        .clone();
    log::info!("replaying transaction log from {}", peer);
    let applied = ReplayClient::new(Arc::clone(cfg), Arc::clone(store), queues.clone(), peer)
        .start()?;
    log::info!("replay complete, {} entries applied", applied);
    Ok(())
}

/// Sends a REPLAY probe to every peer and returns those that answered.
fn probe_peers(cfg: &StoreDaemonConfig, peers: &[String]) -> CResult<Vec<String>> {
    if peers.is_empty() {
        return Ok(Vec::new());
    }
    let mut probe = Request::new(RequestType::Replay, "none");
    probe.client_id = client_id(&cfg.node_id);
    let payload = probe.seal()?;

    let mut client = UdpMultiClient::new(peers, cfg.port);
    let replies = client.timed_send(&payload, PROBE_TIMEOUT_MS, None, AckType::Ack.bit())?;
    Ok(replies.into_keys().collect())
}

/// First-boot path: record the `_local_` environment and the three cell
/// role clusters directly, paxos short-circuited, so the daemons have a
/// membership to agree with.
pub fn initialize_range_cluster(
    cfg: &Arc<StoreDaemonConfig>,
    store: &Arc<Store>,
    hosts: &[String],
) -> CResult<()> {
    let api = RangeAPI::new(Arc::clone(store));

    if let Err(err) = api.create_env(LOCAL_ENV) {
        ignore_exists(err)?;
    }
    for role in ["accepters", "proposers", "learners"] {
        let cluster = cfg.cell_cluster(role);
        if let Err(err) = api.add_cluster_to_env(LOCAL_ENV, &cluster) {
            ignore_exists(err)?;
        }
        for host in hosts {
            if let Err(err) = api.add_host_to_cluster(LOCAL_ENV, &cluster, host) {
                ignore_exists(err)?;
            }
        }
    }
    Ok(())
}

fn ignore_exists(err: Error) -> CResult<()> {
    match err {
        Error::NodeExists(_) => Ok(()),
        other => Err(other),
    }
}

/// Streams a peer's transaction log entry by entry and applies each one
/// through the local write path. The accepter stalls while this runs so
/// the replica does not acknowledge state it has not applied yet.
pub struct ReplayClient {
    cfg: Arc<StoreDaemonConfig>,
    store: Arc<Store>,
    queues: Queues,
    peer: String,
}

impl ReplayClient {
    pub fn new(
        cfg: Arc<StoreDaemonConfig>,
        store: Arc<Store>,
        queues: Queues,
        peer: String,
    ) -> ReplayClient {
        ReplayClient { cfg, store, queues, peer }
    }

    pub fn start(&self) -> CResult<u64> {
        self.queues.set_replaying(true);
        let result = self.run();
        self.queues.set_replaying(false);
        result
    }

    fn run(&self) -> CResult<u64> {
        let api = RangeAPI::new(Arc::clone(&self.store));
        let sock = UdpSocket::bind("0.0.0.0:0")?;
        sock.set_read_timeout(Some(Duration::from_millis(FETCH_TIMEOUT_MS)))?;
        let peer_addr = crate::network::resolve(&self.peer, self.cfg.port)?;
        let identity = client_id(&self.cfg.node_id);

        // Probe for the peer's high-water sequence.
        let mut probe = Request::new(RequestType::Replay, "none");
        probe.client_id = identity.clone();
        let payload = probe.seal()?;
        sock.send_to(&payload, peer_addr)?;
        let mut buf = [0u8; MAX_PAYLOAD];
        let (len, _) = sock.recv_from(&mut buf)?;
        let last = Ack::unseal(&buf[..len])?.proposal_num;

        let mut applied = 0u64;
        let mut seq = 1u64;
        while seq <= last {
            let entry = match self.fetch(&sock, peer_addr, &identity, seq)? {
                Some(entry) => entry,
                None => break,
            };
            if entry.method == "none" {
                // Pruned below our position: jump forward, or stop if the
                // peer has nothing more to offer.
                if entry.proposal_num > seq {
                    log::warn!("log pruned below {}, resuming at {}", seq, entry.proposal_num);
                    seq = entry.proposal_num;
                    continue;
                }
                break;
            }
            match api.apply_request(&entry) {
                Ok(_) => applied += 1,
                Err(err) => log::error!("replayed entry {} failed to apply: {}", seq, err),
            }
            seq += 1;
        }
        Ok(applied)
    }

    fn fetch(
        &self,
        sock: &UdpSocket,
        peer_addr: std::net::SocketAddr,
        identity: &str,
        seq: u64,
    ) -> CResult<Option<Request>> {
        let mut fetch = Request::new(RequestType::Replay, "none");
        fetch.client_id = identity.to_string();
        fetch.sequence_num = seq;
        let payload = fetch.seal()?;

        let mut buf = [0u8; MAX_PAYLOAD];
        for attempt in 0..FETCH_RETRIES {
            sock.send_to(&payload, peer_addr)?;
            match sock.recv_from(&mut buf) {
                Ok((len, _)) => match Request::unseal(&buf[..len]) {
                    Ok(entry) => return Ok(Some(entry)),
                    Err(err) => log::error!("bad replay entry for {}: {}", seq, err),
                },
                Err(ref err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    log::warn!("replay fetch {} timed out (attempt {})", seq, attempt + 1);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(None)
    }
}
