use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

/// Maximum UDP datagram payload accepted or produced by the daemon.
pub const MAX_PAYLOAD: usize = 65_507;

/// Request message types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    Request,
    Heartbeat,
    Replay,
    Prepare,
    Propose,
    Learn,
    Failover,
}

/// Ack message types. Values are single bits so a receive filter can accept
/// any of several types at once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckType {
    Ack,
    Nack,
    Promise,
    Accepted,
}

impl AckType {
    /// The bitmask bit for this ack type.
    pub fn bit(self) -> u32 {
        match self {
            AckType::Ack => 1 << 0,
            AckType::Nack => 1 << 1,
            AckType::Promise => 1 << 2,
            AckType::Accepted => 1 << 3,
        }
    }
}

/// Accepts every ack type.
pub const ACK_ANY: u32 = 0xf;

/// A write request or internal consensus message.
///
/// One structure serves the whole pipeline: client submissions, paxos
/// prepare/propose/learn traffic, heartbeats, and replay probes. The crc
/// field is computed over the serialization with the crc set to zero.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub rtype: RequestType,
    pub method: String,
    pub args: Vec<String>,
    pub client_id: String,
    pub request_id: u64,
    pub proposer_id: u32,
    pub proposal_num: u64,
    pub sequence_num: u64,
    pub timestamp: u64,
    pub sender_addr: u32,
    pub sender_port: u32,
    pub crc: u32,
}

/// An acknowledgment, sent point-to-point back to whatever produced the
/// triggering request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub atype: AckType,
    pub status: bool,
    pub code: u32,
    pub reason: String,
    pub client_id: String,
    pub request_id: u64,
    pub proposer_id: u32,
    pub proposal_num: u64,
    pub crc: u32,
}

impl Default for Request {
    fn default() -> Self {
        Request {
            rtype: RequestType::Request,
            method: String::new(),
            args: Vec::new(),
            client_id: String::new(),
            request_id: 0,
            proposer_id: 0,
            proposal_num: 0,
            sequence_num: 0,
            timestamp: 0,
            sender_addr: 0,
            sender_port: 0,
            crc: 0,
        }
    }
}

impl Request {
    pub fn new(rtype: RequestType, method: &str) -> Self {
        Request { rtype, method: method.to_string(), ..Default::default() }
    }

    /// Computes and stores the crc, then returns the serialized bytes.
    pub fn seal(&mut self) -> CResult<Vec<u8>> {
        self.crc = 0;
        let bytes = bincode::serialize(self)?;
        self.crc = crc32fast::hash(&bytes);
        Ok(bincode::serialize(self)?)
    }

    /// Deserializes and validates the crc, rejecting tampered datagrams.
    pub fn unseal(bytes: &[u8]) -> CResult<Self> {
        let mut req: Request = bincode::deserialize(bytes)?;
        let stored = req.crc;
        req.crc = 0;
        let actual = crc32fast::hash(&bincode::serialize(&req)?);
        if stored != actual {
            return Err(Error::CrcMismatch { stored, actual });
        }
        req.crc = stored;
        Ok(req)
    }
}

impl Default for Ack {
    fn default() -> Self {
        Ack {
            atype: AckType::Ack,
            status: false,
            code: 0,
            reason: String::new(),
            client_id: String::new(),
            request_id: 0,
            proposer_id: 0,
            proposal_num: 0,
            crc: 0,
        }
    }
}

impl Ack {
    pub fn new(atype: AckType, status: bool) -> Self {
        Ack { atype, status, ..Default::default() }
    }

    pub fn seal(&mut self) -> CResult<Vec<u8>> {
        self.crc = 0;
        let bytes = bincode::serialize(self)?;
        self.crc = crc32fast::hash(&bytes);
        Ok(bincode::serialize(self)?)
    }

    pub fn unseal(bytes: &[u8]) -> CResult<Self> {
        let mut ack: Ack = bincode::deserialize(bytes)?;
        let stored = ack.crc;
        ack.crc = 0;
        let actual = crc32fast::hash(&bincode::serialize(&ack)?);
        if stored != actual {
            return Err(Error::CrcMismatch { stored, actual });
        }
        ack.crc = stored;
        Ok(ack)
    }
}

/// Builds a client identity: `<node_id>|<pid>|<random>`. The node-id prefix
/// lets the learner that shares a box with the client recognize it and reply
/// on the local acknowledgment channel.
pub fn client_id(node_id: &str) -> String {
    use rand::Rng;
    let nonce: u32 = rand::thread_rng().gen();
    format!("{}|{}|{:08x}", node_id, std::process::id(), nonce)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_seal_round_trip() -> CResult<()> {
        let mut req = Request::new(RequestType::Propose, "create_env");
        req.args = vec!["env1".to_string()];
        req.client_id = "node1|42|deadbeef".to_string();
        req.request_id = 7;
        req.proposal_num = 3;

        let bytes = req.seal()?;
        assert!(bytes.len() <= MAX_PAYLOAD);
        let out = Request::unseal(&bytes)?;
        assert_eq!(out, req);
        assert_ne!(out.crc, 0);
        Ok(())
    }

    #[test]
    fn tampered_request_is_rejected() -> CResult<()> {
        let mut req = Request::new(RequestType::Prepare, "none");
        let mut bytes = req.seal()?;
        // Flip a bit inside the stored crc.
        let pos = bytes.len() - 1;
        bytes[pos] ^= 0x01;
        match Request::unseal(&bytes) {
            Err(Error::CrcMismatch { .. }) => Ok(()),
            other => panic!("expected a crc mismatch, got {:?}", other),
        }
    }

    #[test]
    fn ack_seal_round_trip() -> CResult<()> {
        let mut ack = Ack::new(AckType::Promise, true);
        ack.proposal_num = 9;
        ack.client_id = "node1|42|deadbeef".to_string();
        let bytes = ack.seal()?;
        let out = Ack::unseal(&bytes)?;
        assert_eq!(out, ack);
        Ok(())
    }

    #[test]
    fn ack_type_bits_are_disjoint() {
        let all = [AckType::Ack, AckType::Nack, AckType::Promise, AckType::Accepted];
        let mut mask = 0;
        for t in all {
            assert_eq!(mask & t.bit(), 0);
            mask |= t.bit();
        }
        assert_eq!(mask, ACK_ANY);
    }

    #[test]
    fn client_ids_carry_node_prefix() {
        let id = client_id("node9");
        assert!(id.starts_with("node9|"));
        assert_eq!(id.split('|').count(), 3);
    }
}
