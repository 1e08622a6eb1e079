use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use range::config::StoreDaemonConfig;
use range::error::{CResult, Error};
use range::msg::{Ack, Request, MAX_PAYLOAD};

/// The named local request queue, carried over unix datagram sockets: one
/// request socket the daemon drains, plus one acknowledgment socket per
/// client, correlated by `(client_id, request_id)`.
///
/// Unix datagrams give ordered, reliable local delivery with message
/// boundaries, which is all the queue contract asks for.
fn socket_dir(cfg: &StoreDaemonConfig) -> PathBuf {
    std::env::temp_dir().join(format!("range-mq-{}", cfg.stored_mq_name))
}

fn request_path(cfg: &StoreDaemonConfig) -> PathBuf {
    socket_dir(cfg).join("requests.sock")
}

/// Ack socket path for one client identity. The identity is hashed so the
/// `|`-separated id never meets the filesystem.
fn ack_path(cfg: &StoreDaemonConfig, client_id: &str) -> PathBuf {
    socket_dir(cfg).join(format!("{:08x}.ack", crc32fast::hash(client_id.as_bytes())))
}

/// The daemon's receive side of the request queue.
pub struct RequestQueueListener {
    sock: UnixDatagram,
    path: PathBuf,
}

impl RequestQueueListener {
    pub fn bind(cfg: &StoreDaemonConfig) -> CResult<RequestQueueListener> {
        let path = request_path(cfg);
        std::fs::create_dir_all(socket_dir(cfg))?;
        // A stale socket file from a dead daemon would block the bind.
        let _ = std::fs::remove_file(&path);
        let sock = UnixDatagram::bind(&path)?;
        Ok(RequestQueueListener { sock, path })
    }

    /// Receives the next request, waiting at most `timeout_ms`. Undecodable
    /// datagrams are logged and dropped.
    pub fn receive(&self, timeout_ms: u64) -> CResult<Option<Request>> {
        self.sock.set_read_timeout(Some(Duration::from_millis(timeout_ms)))?;
        let mut buf = vec![0u8; MAX_PAYLOAD];
        match self.sock.recv(&mut buf) {
            Ok(len) => match Request::unseal(&buf[..len]) {
                Ok(req) => Ok(Some(req)),
                Err(err) => {
                    log::error!("dropping invalid queue message: {}", err);
                    Ok(None)
                }
            },
            Err(ref err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for RequestQueueListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Seals and enqueues a request for the local daemon.
pub fn submit(cfg: &StoreDaemonConfig, req: &mut Request) -> CResult<()> {
    let payload = req.seal()?;
    let sock = UnixDatagram::unbound()?;
    sock.send_to(&payload, request_path(cfg))?;
    Ok(())
}

/// Sends an acknowledgment onto a client's reply channel. A missing channel
/// means the client stopped waiting; that is not an error.
pub fn send_ack(cfg: &StoreDaemonConfig, client_id: &str, ack: &mut Ack) -> CResult<()> {
    let payload = ack.seal()?;
    let sock = UnixDatagram::unbound()?;
    match sock.send_to(&payload, ack_path(cfg, client_id)) {
        Ok(_) => Ok(()),
        Err(err)
            if err.kind() == std::io::ErrorKind::NotFound
                || err.kind() == std::io::ErrorKind::ConnectionRefused =>
        {
            log::debug!("ack channel for {} is gone", client_id);
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// A client's receive side of the acknowledgment channel.
pub struct AckListener {
    sock: UnixDatagram,
    path: PathBuf,
}

impl AckListener {
    pub fn bind(cfg: &StoreDaemonConfig, client_id: &str) -> CResult<AckListener> {
        let path = ack_path(cfg, client_id);
        std::fs::create_dir_all(socket_dir(cfg))?;
        let _ = std::fs::remove_file(&path);
        let sock = UnixDatagram::bind(&path)?;
        Ok(AckListener { sock, path })
    }

    /// Waits for the acknowledgment matching a request id, discarding any
    /// stale replies addressed to earlier requests.
    pub fn await_ack(&self, request_id: u64, timeout_ms: u64) -> CResult<Ack> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut buf = vec![0u8; MAX_PAYLOAD];
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            self.sock.set_read_timeout(Some(deadline - now))?;
            match self.sock.recv(&mut buf) {
                Ok(len) => match Ack::unseal(&buf[..len]) {
                    Ok(ack) if ack.request_id == request_id => return Ok(ack),
                    Ok(stale) => {
                        log::debug!("discarding stale ack for request {}", stale.request_id)
                    }
                    Err(err) => log::error!("dropping invalid ack: {}", err),
                },
                Err(ref err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return Err(Error::Timeout);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Drop for AckListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use range::msg::{AckType, RequestType};

    fn cfg(mq: &str) -> StoreDaemonConfig {
        StoreDaemonConfig {
            stored_mq_name: mq.to_string(),
            node_id: "node1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn request_round_trip() -> CResult<()> {
        let cfg = cfg("test-req-round-trip");
        let listener = RequestQueueListener::bind(&cfg)?;

        let mut req = Request::new(RequestType::Request, "create_env");
        req.args = vec!["env1".to_string()];
        req.client_id = "node1|1|aa".to_string();
        req.request_id = 99;
        submit(&cfg, &mut req)?;

        let got = listener.receive(1_000)?.expect("request expected");
        assert_eq!(got.method, "create_env");
        assert_eq!(got.request_id, 99);
        assert_eq!(got, req);

        // Nothing else queued.
        assert_eq!(listener.receive(10)?, None);
        Ok(())
    }

    #[test]
    fn ack_correlation_skips_stale_replies() -> CResult<()> {
        let cfg = cfg("test-ack-correlation");
        let client = "node1|1|bb";
        let listener = AckListener::bind(&cfg, client)?;

        let mut stale = Ack::new(AckType::Ack, true);
        stale.client_id = client.to_string();
        stale.request_id = 1;
        send_ack(&cfg, client, &mut stale)?;

        let mut wanted = Ack::new(AckType::Ack, true);
        wanted.client_id = client.to_string();
        wanted.request_id = 2;
        wanted.code = 0;
        send_ack(&cfg, client, &mut wanted)?;

        let got = listener.await_ack(2, 1_000)?;
        assert_eq!(got.request_id, 2);
        Ok(())
    }

    #[test]
    fn await_ack_times_out() {
        let cfg = cfg("test-ack-timeout");
        let listener = AckListener::bind(&cfg, "node1|1|cc").unwrap();
        assert!(matches!(listener.await_ack(1, 50), Err(Error::Timeout)));
    }

    #[test]
    fn acks_to_absent_clients_are_dropped() -> CResult<()> {
        let cfg = cfg("test-ack-absent");
        std::fs::create_dir_all(socket_dir(&cfg))?;
        let mut ack = Ack::new(AckType::Ack, false);
        ack.client_id = "node1|1|dd".to_string();
        send_ack(&cfg, "node1|1|dd", &mut ack)
    }
}
