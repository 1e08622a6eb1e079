use crate::error::{CResult, Error};
use crate::record::{present_at, NodeRecord, NodeType};
use crate::store::{GraphStore, RecordType};

/// One logical node, exposed at a chosen wanted version.
///
/// A node holds only its owning graph's store handle and its own name;
/// cross-references to other nodes are name lookups through the same handle.
/// All reads resolve against the wanted version (default: the node's head
/// version); all mutations apply at head and advance the node version by one.
pub struct Node {
    name: String,
    graph: GraphStore,
    wanted: Option<u64>,
    record: NodeRecord,
}

impl Node {
    /// Loads a node from its graph's table. Returns None when no record
    /// exists under the name.
    pub fn load(graph: &GraphStore, name: &str) -> CResult<Option<Node>> {
        match graph.get_record(RecordType::Node, name)? {
            Some(bytes) => {
                let record = NodeRecord::decode(&bytes)?;
                Ok(Some(Node {
                    name: name.to_string(),
                    graph: graph.clone(),
                    wanted: None,
                    record,
                }))
            }
            None => Ok(None),
        }
    }

    /// Creates a brand-new node record with a presence toggle at version 1.
    /// Fails if a record already exists; re-creating a removed node goes
    /// through [`Node::revive`] instead.
    pub fn create(
        graph: &GraphStore,
        name: &str,
        node_type: NodeType,
        graph_version: u64,
    ) -> CResult<Node> {
        if graph.get_record(RecordType::Node, name)?.is_some() {
            return Err(Error::CreateNodeError(name.to_string()));
        }
        let mut record = NodeRecord {
            node_type,
            list_version: 1,
            presence: vec![1],
            graph_versions: vec![graph_version],
            ..Default::default()
        };
        let data = record.encode()?;
        graph.write_record(RecordType::Node, name, 1, data)?;
        Ok(Node { name: name.to_string(), graph: graph.clone(), wanted: None, record })
    }

    /// Toggles a removed node back into existence as a new version.
    pub fn revive(&mut self, node_type: NodeType, graph_version: u64) -> CResult<()> {
        if self.record.exists_at(self.record.list_version) {
            return Err(Error::NodeExists(self.name.clone()));
        }
        self.mutate(|record, version| {
            record.node_type = node_type;
            record.presence.push(version);
            if record.graph_versions.last() != Some(&graph_version) {
                record.graph_versions.push(graph_version);
            }
            Ok(())
        })?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_type(&self) -> NodeType {
        self.record.node_type
    }

    /// The node's head version.
    pub fn version(&self) -> u64 {
        self.record.list_version
    }

    /// The version reads currently resolve against.
    pub fn get_wanted_version(&self) -> u64 {
        self.wanted.unwrap_or(self.record.list_version)
    }

    /// Selects the version reads resolve against. Errors when the version
    /// exceeds the node's head; versions preceding all recorded history are
    /// allowed and simply report the node as empty/absent.
    pub fn set_wanted_version(&mut self, version: u64) -> CResult<()> {
        if version > self.record.list_version {
            return Err(Error::InvalidVersion(version));
        }
        self.wanted = Some(version);
        Ok(())
    }

    pub fn crc32(&self) -> u32 {
        self.record.crc
    }

    /// True when the node exists at the wanted version.
    pub fn is_valid(&self) -> bool {
        self.record.exists_at(self.get_wanted_version())
    }

    /// Forward edge targets resolved at the wanted version.
    pub fn forward_edges(&self) -> Vec<String> {
        NodeRecord::edges_at(&self.record.forward, self.get_wanted_version())
    }

    /// Reverse edge targets resolved at the wanted version.
    pub fn reverse_edges(&self) -> Vec<String> {
        NodeRecord::edges_at(&self.record.reverse, self.get_wanted_version())
    }

    /// Tags and their values resolved at the wanted version.
    pub fn tags(&self) -> Vec<(String, Vec<String>)> {
        self.record.tags_at(self.get_wanted_version())
    }

    /// The values of one tag at the wanted version, if the key is present.
    pub fn tag(&self, key: &str) -> Option<Vec<String>> {
        let wanted = self.get_wanted_version();
        self.record
            .tags
            .iter()
            .find(|t| t.key == key && present_at(&t.versions, wanted))
            .map(|t| {
                t.values
                    .iter()
                    .filter(|v| present_at(&v.versions, wanted))
                    .map(|v| v.value.clone())
                    .collect()
            })
    }

    pub fn graph_versions(&self) -> Vec<u64> {
        self.record.graph_versions.clone()
    }

    /// Records that this node participated in a graph version.
    pub fn add_graph_version(&mut self, graph_version: u64) -> CResult<()> {
        if self.record.graph_versions.last() == Some(&graph_version) {
            return Ok(());
        }
        self.mutate(|record, _| {
            record.graph_versions.push(graph_version);
            Ok(())
        })?;
        Ok(())
    }

    /// Changes the node type, returning the previous one.
    pub fn set_type(&mut self, node_type: NodeType) -> CResult<NodeType> {
        let previous = self.record.node_type;
        if previous != node_type {
            self.mutate(|record, _| {
                record.node_type = node_type;
                Ok(())
            })?;
        }
        Ok(previous)
    }

    /// Persist any unbacked state. Nodes here are always backed by the graph
    /// store (every mutation writes through), so this is a no-op.
    pub fn commit(&mut self) -> CResult<bool> {
        Ok(true)
    }

    /// Adds a forward edge to `other`, and symmetrically the matching
    /// reverse edge on `other` unless suppressed. Returns false when the
    /// edge already exists at head.
    pub fn add_forward_edge(&mut self, other: &str, symmetric: bool) -> CResult<bool> {
        if self.has_edge_at_head(true, other) {
            return Ok(false);
        }
        self.mutate(|record, version| {
            append_edge(&mut record.forward, other, version);
            Ok(())
        })?;
        if symmetric {
            let mut peer = Node::load(&self.graph, other)?
                .ok_or_else(|| Error::NodeNotFound(other.to_string()))?;
            peer.add_reverse_edge(&self.name, false)?;
        }
        Ok(true)
    }

    /// Adds a reverse edge to `other`, and symmetrically the matching
    /// forward edge on `other` when requested.
    pub fn add_reverse_edge(&mut self, other: &str, symmetric: bool) -> CResult<bool> {
        if self.has_edge_at_head(false, other) {
            return Ok(false);
        }
        self.mutate(|record, version| {
            append_edge(&mut record.reverse, other, version);
            Ok(())
        })?;
        if symmetric {
            let mut peer = Node::load(&self.graph, other)?
                .ok_or_else(|| Error::NodeNotFound(other.to_string()))?;
            peer.add_forward_edge(&self.name, false)?;
        }
        Ok(true)
    }

    /// Removes the forward edge to `other`. Returns false when no such edge
    /// exists at head.
    pub fn remove_forward_edge(&mut self, other: &str, symmetric: bool) -> CResult<bool> {
        if !self.has_edge_at_head(true, other) {
            return Ok(false);
        }
        self.mutate(|record, version| {
            NodeRecord::edge_entry(&mut record.forward, other).versions.push(version);
            Ok(())
        })?;
        if symmetric {
            let mut peer = Node::load(&self.graph, other)?
                .ok_or_else(|| Error::NodeNotFound(other.to_string()))?;
            peer.remove_reverse_edge(&self.name, false)?;
        }
        Ok(true)
    }

    /// Removes the reverse edge to `other`. Returns false when no such edge
    /// exists at head.
    pub fn remove_reverse_edge(&mut self, other: &str, symmetric: bool) -> CResult<bool> {
        if !self.has_edge_at_head(false, other) {
            return Ok(false);
        }
        self.mutate(|record, version| {
            NodeRecord::edge_entry(&mut record.reverse, other).versions.push(version);
            Ok(())
        })?;
        if symmetric {
            let mut peer = Node::load(&self.graph, other)?
                .ok_or_else(|| Error::NodeNotFound(other.to_string()))?;
            peer.remove_forward_edge(&self.name, false)?;
        }
        Ok(true)
    }

    /// Replaces the values of a tag, creating the key when absent. Values
    /// not in the new set are toggled off; history remains queryable.
    pub fn update_tag(&mut self, key: &str, values: &[String]) -> CResult<bool> {
        let head = self.record.list_version;
        let key_present = self
            .record
            .tags
            .iter()
            .any(|t| t.key == key && present_at(&t.versions, head));
        self.mutate(|record, version| {
            {
                let tag = record.tag_entry(key);
                if !key_present {
                    tag.versions.push(version);
                }
            }
            // Toggle off values that are present but no longer wanted, then
            // toggle on (or insert) the wanted ones.
            let tag = record.tag_entry(key);
            for entry in tag.values.iter_mut() {
                let is_present = present_at(&entry.versions, head);
                let is_wanted = values.iter().any(|v| *v == entry.value);
                if is_present && !is_wanted {
                    entry.versions.push(version);
                }
            }
            for value in values {
                match tag.values.iter_mut().find(|e| e.value == *value) {
                    Some(entry) => {
                        if !present_at(&entry.versions, head) {
                            entry.versions.push(version);
                        }
                    }
                    None => tag
                        .values
                        .push(crate::record::TagValue { value: value.clone(), versions: vec![version] }),
                }
            }
            Ok(())
        })?;
        Ok(true)
    }

    /// Removes a tag key. Returns false when the key is absent at head.
    pub fn delete_tag(&mut self, key: &str) -> CResult<bool> {
        let head = self.record.list_version;
        let key_present = self
            .record
            .tags
            .iter()
            .any(|t| t.key == key && present_at(&t.versions, head));
        if !key_present {
            return Ok(false);
        }
        self.mutate(|record, version| {
            record.tag_entry(key).versions.push(version);
            Ok(())
        })?;
        Ok(true)
    }

    /// Marks the node removed at a new version; history remains queryable.
    pub fn retire(&mut self, graph_version: u64) -> CResult<()> {
        if !self.record.exists_at(self.record.list_version) {
            return Err(Error::NodeNotFound(self.name.clone()));
        }
        self.mutate(|record, version| {
            record.presence.push(version);
            if record.graph_versions.last() != Some(&graph_version) {
                record.graph_versions.push(graph_version);
            }
            Ok(())
        })?;
        Ok(())
    }

    /// True when the node's head state has the given edge.
    fn has_edge_at_head(&self, forward: bool, other: &str) -> bool {
        let head = self.record.list_version;
        let edges = if forward { &self.record.forward } else { &self.record.reverse };
        edges.iter().any(|e| e.target == other && present_at(&e.versions, head))
    }

    /// Read-modify-write cycle: reload the record, bump the version, apply
    /// the mutation, checksum, and write back.
    fn mutate<F>(&mut self, f: F) -> CResult<u64>
    where
        F: FnOnce(&mut NodeRecord, u64) -> CResult<()>,
    {
        let mut record = match self.graph.get_record(RecordType::Node, &self.name)? {
            Some(bytes) => NodeRecord::decode(&bytes)?,
            None => return Err(Error::NodeNotFound(self.name.clone())),
        };
        let version = record.bump();
        f(&mut record, version)?;
        let data = record.encode()?;
        self.graph.write_record(RecordType::Node, &self.name, version, data)?;
        self.record = record;
        Ok(version)
    }

}

/// Toggles an edge on. A re-added edge moves to the tail of the list so
/// list order is insertion order; the proposers cluster relies on this to
/// rotate a failed node to the back.
fn append_edge(edges: &mut Vec<crate::record::EdgeRecord>, target: &str, version: u64) {
    let mut entry = match edges.iter().position(|e| e.target == target) {
        Some(idx) => edges.remove(idx),
        None => crate::record::EdgeRecord { target: target.to_string(), versions: Vec::new() },
    };
    entry.versions.push(version);
    edges.push(entry);
}
