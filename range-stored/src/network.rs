use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use range::error::{CResult, Error};
use range::msg::{Ack, MAX_PAYLOAD};

/// One resolved destination with its own sending socket, so replies can be
/// correlated per destination.
struct Endpoint {
    hostname: String,
    addr: SocketAddr,
    sock: UdpSocket,
    reply: Option<Ack>,
}

/// A multi-destination UDP client: one send and at most one validated reply
/// per destination, under a shared deadline.
pub struct UdpMultiClient {
    endpoints: Vec<Endpoint>,
}

/// Resolves a hostname against a default port. The hostname may carry its
/// own `host:port` suffix; a bare IP literal is accepted without DNS.
pub(crate) fn resolve(host: &str, default_port: u16) -> CResult<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    let target: String = if host.contains(':') {
        host.to_string()
    } else {
        format!("{}:{}", host, default_port)
    };
    target.to_socket_addrs()
        .map_err(|e| Error::ResolveFailed(format!("{}: {}", host, e)))?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| Error::ResolveFailed(host.to_string()))
}

impl UdpMultiClient {
    /// Sets up one socket per resolvable destination. Unresolvable hosts are
    /// logged and skipped, matching the fire-and-forget nature of the
    /// datagram fan-out.
    pub fn new(hostnames: &[String], port: u16) -> UdpMultiClient {
        let mut endpoints = Vec::new();
        for host in hostnames {
            let addr = match resolve(host, port) {
                Ok(addr) => addr,
                Err(err) => {
                    log::warn!("skipping endpoint {}: {}", host, err);
                    continue;
                }
            };
            let sock = match UdpSocket::bind("0.0.0.0:0") {
                Ok(sock) => sock,
                Err(err) => {
                    log::warn!("skipping endpoint {}: {}", host, err);
                    continue;
                }
            };
            endpoints.push(Endpoint { hostname: host.clone(), addr, sock, reply: None });
        }
        UdpMultiClient { endpoints }
    }

    /// Sends to the first destination only, with no reply expected.
    pub fn send_one(&self, payload: &[u8]) -> CResult<()> {
        if let Some(ep) = self.endpoints.first() {
            ep.sock.send_to(payload, ep.addr)?;
        }
        Ok(())
    }

    /// Fans the payload out to every destination and collects replies until
    /// `break_after_n` acks matching `accepted_ack_bits` arrive, every
    /// destination has replied, or the deadline expires. Returns the replies
    /// by hostname.
    pub fn timed_send(
        &mut self,
        payload: &[u8],
        timeout_ms: u64,
        break_after_n: Option<usize>,
        accepted_ack_bits: u32,
    ) -> CResult<HashMap<String, Ack>> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::Value(format!("datagram of {} bytes too large", payload.len())));
        }
        for ep in &mut self.endpoints {
            ep.reply = None;
            if let Err(err) = ep.sock.send_to(payload, ep.addr) {
                log::warn!("send to {} failed: {}", ep.hostname, err);
            }
        }

        let break_after = break_after_n.unwrap_or(self.endpoints.len());
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let poll = Duration::from_millis(5);
        let mut buf = [0u8; MAX_PAYLOAD];
        let mut wanted = 0usize;
        let mut received = 0usize;

        while wanted < break_after
            && received < self.endpoints.len()
            && Instant::now() < deadline
        {
            for ep in &mut self.endpoints {
                if ep.reply.is_some() {
                    continue;
                }
                ep.sock.set_read_timeout(Some(poll))?;
                match ep.sock.recv_from(&mut buf) {
                    Ok((len, _)) => match Ack::unseal(&buf[..len]) {
                        Ok(ack) => {
                            if ack.atype.bit() & accepted_ack_bits != 0 {
                                wanted += 1;
                            }
                            received += 1;
                            ep.reply = Some(ack);
                        }
                        Err(err) => {
                            log::debug!("dropping bad ack from {}: {}", ep.hostname, err)
                        }
                    },
                    Err(ref err)
                        if err.kind() == std::io::ErrorKind::WouldBlock
                            || err.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }

        let mut responses = HashMap::new();
        for ep in &mut self.endpoints {
            if let Some(ack) = ep.reply.take() {
                responses.insert(ep.hostname.clone(), ack);
            }
        }
        Ok(responses)
    }
}

/// Sends an ack back to the address a request was stamped with. Unstamped
/// requests (locally constructed, never on the wire) get no reply.
pub fn reply_to(sender_addr: u32, sender_port: u32, ack: &mut Ack) -> CResult<()> {
    if sender_addr == 0 {
        return Ok(());
    }
    let ip = std::net::Ipv4Addr::from(sender_addr);
    let client = UdpMultiClient::new(&[ip.to_string()], sender_port as u16);
    client.send_one(&ack.seal()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use range::msg::AckType;

    /// A little responder that acks every datagram it sees.
    fn spawn_acker(atype: AckType) -> (SocketAddr, std::thread::JoinHandle<()>) {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = sock.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; MAX_PAYLOAD];
            if let Ok((_, from)) = sock.recv_from(&mut buf) {
                let mut ack = Ack::new(atype, true);
                ack.proposal_num = 7;
                let payload = ack.seal().unwrap();
                sock.send_to(&payload, from).unwrap();
            }
        });
        (addr, handle)
    }

    #[test]
    fn resolve_accepts_ip_literals_and_host_ports() {
        assert_eq!(
            resolve("127.0.0.1", 5444).unwrap(),
            "127.0.0.1:5444".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            resolve("127.0.0.1:9000", 5444).unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert!(resolve("no-such-host.invalid.", 5444).is_err());
    }

    #[test]
    fn timed_send_collects_matching_acks() -> CResult<()> {
        let (a1, h1) = spawn_acker(AckType::Promise);
        let (a2, h2) = spawn_acker(AckType::Promise);

        let hosts = vec![a1.to_string(), a2.to_string()];
        let mut client = UdpMultiClient::new(&hosts, 0);
        let replies =
            client.timed_send(b"ping", 2_000, Some(2), AckType::Promise.bit())?;

        assert_eq!(replies.len(), 2);
        for ack in replies.values() {
            assert_eq!(ack.atype, AckType::Promise);
            assert_eq!(ack.proposal_num, 7);
        }
        h1.join().unwrap();
        h2.join().unwrap();
        Ok(())
    }

    #[test]
    fn break_after_one_returns_early() -> CResult<()> {
        let (a1, h1) = spawn_acker(AckType::Ack);
        // The second destination never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let hosts = vec![a1.to_string(), silent.local_addr().unwrap().to_string()];

        let mut client = UdpMultiClient::new(&hosts, 0);
        let started = Instant::now();
        let replies = client.timed_send(b"ping", 5_000, Some(1), AckType::Ack.bit())?;
        assert_eq!(replies.len(), 1);
        // Returned on the matching ack, well before the deadline.
        assert!(started.elapsed() < Duration::from_millis(4_000));
        h1.join().unwrap();
        Ok(())
    }

    #[test]
    fn deadline_bounds_the_wait() -> CResult<()> {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let hosts = vec![silent.local_addr().unwrap().to_string()];
        let mut client = UdpMultiClient::new(&hosts, 0);

        let started = Instant::now();
        let replies = client.timed_send(b"ping", 50, None, range::msg::ACK_ANY)?;
        assert!(replies.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_millis(2_000));
        Ok(())
    }

    #[test]
    fn oversized_payloads_are_refused() {
        let mut client = UdpMultiClient::new(&[], 0);
        let huge = vec![0u8; MAX_PAYLOAD + 1];
        assert!(client.timed_send(&huge, 10, None, range::msg::ACK_ANY).is_err());
    }
}
