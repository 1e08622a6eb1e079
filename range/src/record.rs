use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

/// Node types. Environment and cluster nodes can have children (forward
/// edges); host and string nodes cannot, but carry reverse edges and may
/// have other adjacencies such as dependencies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Environment,
    Cluster,
    Host,
    String,
    Reserved,
    Unknown,
}

impl Default for NodeType {
    fn default() -> Self {
        NodeType::Unknown
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeType::Environment => "ENVIRONMENT",
            NodeType::Cluster => "CLUSTER",
            NodeType::Host => "HOST",
            NodeType::String => "STRING",
            NodeType::Reserved => "RESERVED",
            NodeType::Unknown => "UNKNOWN",
        };
        write!(f, "{}", name)
    }
}

/// One adjacency and the node versions at which it was added or removed.
/// The edge exists at version W iff the count of versions ≤ W is odd.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub target: String,
    pub versions: Vec<u64>,
}

/// One value of a tag, with the key versions at which the value was added
/// or superseded.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TagValue {
    pub value: String,
    pub versions: Vec<u64>,
}

/// One tag key: its own presence toggles plus the recorded values.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TagRecord {
    pub key: String,
    pub versions: Vec<u64>,
    pub values: Vec<TagValue>,
}

/// The serialized form of one node, preserving per-attribute version
/// history so any prior version can be reconstructed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_type: NodeType,
    pub forward: Vec<EdgeRecord>,
    pub reverse: Vec<EdgeRecord>,
    pub tags: Vec<TagRecord>,
    /// Node versions at which the node toggled between existing and removed.
    pub presence: Vec<u64>,
    /// Monotonic per-node version; advances by one on every mutation.
    pub list_version: u64,
    /// Graph versions at which this node participated in a mutation.
    pub graph_versions: Vec<u64>,
    /// crc32 over the serialization with this field zeroed.
    pub crc: u32,
}

/// True when the toggle history says the attribute exists at version
/// `wanted`: an odd number of recorded versions are ≤ wanted.
pub fn present_at(versions: &[u64], wanted: u64) -> bool {
    versions.iter().filter(|v| **v <= wanted).count() % 2 == 1
}

/// The most recent recorded version ≤ wanted, scanning newest to oldest.
pub fn latest_at(versions: &[u64], wanted: u64) -> Option<u64> {
    versions.iter().rev().find(|v| **v <= wanted).copied()
}

impl NodeRecord {
    /// Serializes the record: the crc field is zeroed, the bytes are
    /// checksummed, the crc is stored, and the record is serialized again.
    pub fn encode(&mut self) -> CResult<Vec<u8>> {
        self.crc = 0;
        let bytes = bincode::serialize(self)?;
        self.crc = crc32fast::hash(&bytes);
        Ok(bincode::serialize(self)?)
    }

    /// Deserializes and verifies a record, rejecting checksum mismatches as
    /// corrupt.
    pub fn decode(bytes: &[u8]) -> CResult<Self> {
        let mut record: NodeRecord =
            bincode::deserialize(bytes).map_err(|e| Error::Corrupt(e.to_string()))?;
        let stored = record.crc;
        record.crc = 0;
        let actual = crc32fast::hash(&bincode::serialize(&record)?);
        if stored != actual {
            return Err(Error::CrcMismatch { stored, actual });
        }
        record.crc = stored;
        Ok(record)
    }

    /// True when the node exists at the given node version.
    pub fn exists_at(&self, wanted: u64) -> bool {
        present_at(&self.presence, wanted)
    }

    /// Edge targets present at the given node version, in recorded order.
    pub fn edges_at(edges: &[EdgeRecord], wanted: u64) -> Vec<String> {
        edges
            .iter()
            .filter(|e| present_at(&e.versions, wanted))
            .map(|e| e.target.clone())
            .collect()
    }

    /// Tag keys and their selected values at the given node version.
    pub fn tags_at(&self, wanted: u64) -> Vec<(String, Vec<String>)> {
        self.tags
            .iter()
            .filter(|t| present_at(&t.versions, wanted))
            .map(|t| {
                let values = t
                    .values
                    .iter()
                    .filter(|v| present_at(&v.versions, wanted))
                    .map(|v| v.value.clone())
                    .collect();
                (t.key.clone(), values)
            })
            .collect()
    }

    /// Mutation entry point: bumps the node version by one and returns it.
    pub fn bump(&mut self) -> u64 {
        self.list_version += 1;
        self.list_version
    }

    /// The edge entry for a target, creating it when missing.
    pub fn edge_entry<'a>(edges: &'a mut Vec<EdgeRecord>, target: &str) -> &'a mut EdgeRecord {
        if let Some(idx) = edges.iter().position(|e| e.target == target) {
            return &mut edges[idx];
        }
        edges.push(EdgeRecord { target: target.to_string(), versions: Vec::new() });
        edges.last_mut().expect("just pushed")
    }

    /// The tag entry for a key, creating it when missing.
    pub fn tag_entry(&mut self, key: &str) -> &mut TagRecord {
        if let Some(idx) = self.tags.iter().position(|t| t.key == key) {
            return &mut self.tags[idx];
        }
        self.tags.push(TagRecord { key: key.to_string(), ..Default::default() });
        self.tags.last_mut().expect("just pushed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> NodeRecord {
        NodeRecord {
            node_type: NodeType::Cluster,
            forward: vec![EdgeRecord { target: "host1".into(), versions: vec![2] }],
            reverse: vec![EdgeRecord { target: "env1".into(), versions: vec![1, 3] }],
            tags: vec![TagRecord {
                key: "owner".into(),
                versions: vec![4],
                values: vec![TagValue { value: "ops".into(), versions: vec![4] }],
            }],
            presence: vec![1],
            list_version: 4,
            graph_versions: vec![1, 2, 3, 4],
            crc: 0,
        }
    }

    #[test]
    fn encode_decode_encode_is_identical() -> CResult<()> {
        let mut rec = record();
        let bytes = rec.encode()?;
        let mut decoded = NodeRecord::decode(&bytes)?;
        assert_eq!(decoded, rec);
        assert_eq!(decoded.encode()?, bytes);
        Ok(())
    }

    #[test]
    fn checksum_guards_the_payload() -> CResult<()> {
        let mut rec = record();
        let mut bytes = rec.encode()?;
        // Flip a bit inside the stored checksum itself.
        let pos = bytes.len() - 1;
        bytes[pos] ^= 0xff;
        match NodeRecord::decode(&bytes) {
            Err(Error::CrcMismatch { .. }) => Ok(()),
            other => panic!("expected a checksum mismatch, got {:?}", other),
        }
    }

    #[test]
    fn edge_presence_follows_version_parity() {
        // Added at 2: absent before, present from 2 onward.
        assert!(!present_at(&[2], 1));
        assert!(present_at(&[2], 2));
        assert!(present_at(&[2], 9));

        // Added at 1, removed at 3, re-added at 5.
        let versions = [1, 3, 5];
        assert!(!present_at(&versions, 0));
        assert!(present_at(&versions, 1));
        assert!(present_at(&versions, 2));
        assert!(!present_at(&versions, 3));
        assert!(!present_at(&versions, 4));
        assert!(present_at(&versions, 5));
    }

    #[test]
    fn latest_at_scans_newest_first() {
        assert_eq!(latest_at(&[1, 3, 5], 4), Some(3));
        assert_eq!(latest_at(&[1, 3, 5], 9), Some(5));
        assert_eq!(latest_at(&[1, 3, 5], 0), None);
    }

    #[test]
    fn versioned_reads_resolve_per_attribute() {
        let rec = record();

        // Forward edge to host1 appears at version 2.
        assert_eq!(NodeRecord::edges_at(&rec.forward, 1), Vec::<String>::new());
        assert_eq!(NodeRecord::edges_at(&rec.forward, 2), vec!["host1"]);

        // Reverse edge to env1 existed at 1..3 and was removed at 3.
        assert_eq!(NodeRecord::edges_at(&rec.reverse, 2), vec!["env1"]);
        assert_eq!(NodeRecord::edges_at(&rec.reverse, 3), Vec::<String>::new());

        // The owner tag exists only from version 4.
        assert_eq!(rec.tags_at(3), Vec::<(String, Vec<String>)>::new());
        assert_eq!(rec.tags_at(4), vec![("owner".to_string(), vec!["ops".to_string()])]);
    }

    #[test]
    fn empty_record_reports_nothing() {
        let rec = NodeRecord::default();
        assert!(!rec.exists_at(0));
        assert!(!rec.exists_at(u64::MAX));
        assert_eq!(rec.tags_at(u64::MAX), vec![]);
    }
}
