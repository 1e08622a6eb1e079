use std::collections::HashMap;
use std::sync::Arc;

use crate::error::CResult;
use crate::msg::Request;
use crate::node::Node;
use crate::record::NodeType;
use crate::store::{GraphStore, Store};
use crate::txn::RangeTxn;

/// One named graph instance: a set of versioned nodes plus the changelist
/// recording every committed version.
///
/// Instances are created on first access by name and live for the life of
/// the process. A wanted version can be selected to observe the whole graph
/// as of an earlier committed version.
pub struct GraphInstance {
    store: GraphStore,
    /// The selected graph version; None observes head.
    wanted: Option<u64>,
    /// Node name → node version pinned by `set_wanted_version`. A version of
    /// 0 marks a node that did not yet exist at the wanted version. Nodes
    /// absent from the map are unchanged since the wanted version, so their
    /// head record is already correct.
    wanted_map: HashMap<String, u64>,
}

impl GraphInstance {
    /// Opens the named graph instance, creating it on first access.
    pub fn open(store: &Arc<Store>, name: &str) -> CResult<GraphInstance> {
        Ok(GraphInstance { store: store.graph(name)?, wanted: None, wanted_map: HashMap::new() })
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }

    pub fn graph_store(&self) -> &GraphStore {
        &self.store
    }

    /// The graph's head version.
    pub fn version(&self) -> CResult<u64> {
        self.store.version()
    }

    /// The number of nodes visible at the wanted version.
    pub fn v_count(&self) -> CResult<usize> {
        let mut count = 0;
        for name in self.store.node_names()? {
            if self.get_node(&name)?.is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// The number of forward edges visible at the wanted version.
    pub fn e_count(&self) -> CResult<usize> {
        let mut count = 0;
        for name in self.store.node_names()? {
            if let Some(node) = self.get_node(&name)? {
                count += node.forward_edges().len();
            }
        }
        Ok(count)
    }

    /// Fetches a node, resolved at the graph's wanted version. Absent when
    /// no record exists or the node does not exist at that version.
    pub fn get_node(&self, name: &str) -> CResult<Option<Node>> {
        let mut node = match Node::load(&self.store, name)? {
            Some(node) => node,
            None => return Ok(None),
        };
        if self.wanted.is_some() {
            if let Some(&pinned) = self.wanted_map.get(name) {
                if pinned == 0 {
                    return Ok(None);
                }
                node.set_wanted_version(pinned)?;
            }
        }
        if !node.is_valid() {
            return Ok(None);
        }
        Ok(Some(node))
    }

    /// Creates a node at the graph's next version. Fails `NodeExists` when
    /// the name is present at head; a name that exists only in history is
    /// re-created as a new version.
    pub fn create(&self, name: &str, node_type: NodeType) -> CResult<Node> {
        let graph_version = self.version()? + 1;
        match Node::load(&self.store, name)? {
            Some(mut node) => {
                if node.is_valid() {
                    return Err(crate::error::Error::NodeExists(name.to_string()));
                }
                node.revive(node_type, graph_version)?;
                Ok(node)
            }
            None => Node::create(&self.store, name, node_type, graph_version),
        }
    }

    /// Removes a node: flips all of its currently-present edges to absent
    /// (symmetrically, so the peers' records stay reciprocal) and marks the
    /// node removed at a new version. History remains queryable.
    pub fn remove(&self, name: &str) -> CResult<()> {
        let mut node = self
            .get_node(name)?
            .ok_or_else(|| crate::error::Error::NodeNotFound(name.to_string()))?;
        let graph_version = self.version()? + 1;

        for target in node.forward_edges() {
            node.remove_forward_edge(&target, true)?;
        }
        for source in node.reverse_edges() {
            node.remove_reverse_edge(&source, true)?;
        }
        node.retire(graph_version)
    }

    /// A snapshot cursor over the nodes visible at the wanted version.
    pub fn cursor(&self) -> CResult<GraphCursor<'_>> {
        Ok(GraphCursor { graph: self, names: self.store.node_names()?, pos: None })
    }

    /// All nodes visible at the wanted version, in name order.
    pub fn nodes(&self) -> CResult<Vec<Node>> {
        let mut nodes = Vec::new();
        for name in self.store.node_names()? {
            if let Some(node) = self.get_node(&name)? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    /// Opens a range transaction grouping subsequent mutations into one
    /// version bump and one transaction-log entry.
    pub fn start_txn(&self, request: Request) -> CResult<RangeTxn> {
        RangeTxn::begin(Arc::clone(self.store.store()), request)
    }

    /// Selects the graph version reads resolve against, pinning every node
    /// touched after it to its version as of that point. Returns false when
    /// the version is ahead of head or older than the retained changelist.
    pub fn set_wanted_version(&mut self, version: u64) -> CResult<bool> {
        let changes = self.store.changelist()?;
        if version > changes.current_version {
            return Ok(false);
        }
        if version == changes.current_version {
            self.wanted = None;
            self.wanted_map.clear();
            return Ok(true);
        }
        if version != 0 {
            match changes.changes.first() {
                Some(oldest) if oldest.version <= version => {}
                _ => return Ok(false), // older than retained history
            }
        }

        // Walk from head down. Every node touched after the wanted version
        // starts out absent (0); continuing below the wanted version, the
        // newest change at or before it supplies the node's exact version.
        let mut map: HashMap<String, u64> = HashMap::new();
        let mut unresolved = 0usize;
        for change in changes.changes.iter().rev() {
            if change.version > version {
                for (name, _) in &change.items {
                    if map.insert(name.clone(), 0).is_none() {
                        unresolved += 1;
                    }
                }
            } else {
                for (name, node_version) in &change.items {
                    if let Some(slot) = map.get_mut(name) {
                        if *slot == 0 {
                            *slot = *node_version;
                            unresolved -= 1;
                        }
                    }
                }
                if unresolved == 0 {
                    break;
                }
            }
        }

        self.wanted = Some(version);
        self.wanted_map = map;
        Ok(true)
    }

    /// The currently selected wanted version, or head when none is set.
    pub fn get_wanted_version(&self) -> CResult<u64> {
        match self.wanted {
            Some(version) => Ok(version),
            None => self.version(),
        }
    }
}

/// A cursor over a snapshot of the graph's node names, filtered by the
/// graph's wanted version. Restart by re-opening.
pub struct GraphCursor<'a> {
    graph: &'a GraphInstance,
    names: Vec<String>,
    pos: Option<usize>,
}

impl<'a> GraphCursor<'a> {
    /// Fetches a node by name without moving the cursor.
    pub fn fetch(&self, name: &str) -> CResult<Option<Node>> {
        self.graph.get_node(name)
    }

    /// Positions at the first visible node.
    pub fn first(&mut self) -> CResult<Option<Node>> {
        self.pos = None;
        self.next()
    }

    /// Positions at the last visible node.
    pub fn last(&mut self) -> CResult<Option<Node>> {
        self.pos = Some(self.names.len());
        self.prev()
    }

    /// Advances to the next visible node.
    pub fn next(&mut self) -> CResult<Option<Node>> {
        let mut idx = match self.pos {
            Some(idx) => idx + 1,
            None => 0,
        };
        while idx < self.names.len() {
            self.pos = Some(idx);
            if let Some(node) = self.graph.get_node(&self.names[idx])? {
                return Ok(Some(node));
            }
            idx += 1;
        }
        self.pos = Some(self.names.len());
        Ok(None)
    }

    /// Steps back to the previous visible node.
    pub fn prev(&mut self) -> CResult<Option<Node>> {
        let mut idx = match self.pos {
            Some(idx) => idx,
            None => return Ok(None),
        };
        while idx > 0 {
            idx -= 1;
            self.pos = Some(idx);
            if let Some(node) = self.graph.get_node(&self.names[idx])? {
                return Ok(Some(node));
            }
        }
        self.pos = None;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::msg::{Request, RequestType};

    fn setup() -> (Arc<Store>, GraphInstance) {
        let store = Arc::new(Store::in_memory());
        let graph = GraphInstance::open(&store, "primary").unwrap();
        (store, graph)
    }

    fn txn_req() -> Request {
        Request::new(RequestType::Request, "test_op")
    }

    #[test]
    fn create_and_count() -> CResult<()> {
        let (_store, graph) = setup();
        graph.create("env1", NodeType::Environment)?;
        graph.create("env1#cl1", NodeType::Cluster)?;

        assert_eq!(graph.v_count()?, 2);
        assert_eq!(graph.e_count()?, 0);
        assert!(matches!(
            graph.create("env1", NodeType::Environment),
            Err(Error::NodeExists(_))
        ));
        Ok(())
    }

    #[test]
    fn version_advances_once_per_transaction() -> CResult<()> {
        let (_store, graph) = setup();
        assert_eq!(graph.version()?, 0);

        {
            let txn = graph.start_txn(txn_req())?;
            graph.create("env1", NodeType::Environment)?;
            txn.commit()?;
        }
        assert_eq!(graph.version()?, 1);

        {
            let txn = graph.start_txn(txn_req())?;
            let mut env = graph.get_node("env1")?.unwrap();
            graph.create("env1#cl1", NodeType::Cluster)?;
            env.add_forward_edge("env1#cl1", true)?;
            txn.commit()?;
        }
        assert_eq!(graph.version()?, 2);

        // Exactly one change set for the second commit, listing both nodes.
        let changes = graph.graph_store().changelist()?;
        assert_eq!(changes.changes.len(), 2);
        let names: Vec<&str> =
            changes.changes[1].items.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["env1", "env1#cl1"]);
        Ok(())
    }

    #[test]
    fn aborted_txn_rolls_back() -> CResult<()> {
        let (_store, graph) = setup();
        {
            let _txn = graph.start_txn(txn_req())?;
            graph.create("env1", NodeType::Environment)?;
            // dropped without commit
        }
        assert_eq!(graph.version()?, 0);
        assert!(graph.get_node("env1")?.is_none());
        Ok(())
    }

    #[test]
    fn remove_keeps_history_and_allows_recreate() -> CResult<()> {
        let (_store, graph) = setup();
        let mut env = graph.create("env1", NodeType::Environment)?;
        graph.create("h1", NodeType::Host)?;
        env.add_forward_edge("h1", true)?;

        graph.remove("h1")?;
        assert!(graph.get_node("h1")?.is_none());
        // The peer's record no longer lists the edge.
        assert_eq!(graph.get_node("env1")?.unwrap().forward_edges(), Vec::<String>::new());

        // Re-create as a new version.
        let revived = graph.create("h1", NodeType::Host)?;
        assert!(revived.is_valid());
        assert!(graph.get_node("h1")?.is_some());
        Ok(())
    }

    #[test]
    fn wanted_version_views_replay_history() -> CResult<()> {
        let (_store, mut graph) = setup();

        // v1: env, v2: cluster, v3: host h1, v4: host h2, v5: remove h1.
        {
            let txn = graph.start_txn(txn_req())?;
            graph.create("e", NodeType::Environment)?;
            txn.commit()?;
        }
        {
            let txn = graph.start_txn(txn_req())?;
            let mut e = graph.get_node("e")?.unwrap();
            graph.create("e#c", NodeType::Cluster)?;
            e.add_forward_edge("e#c", true)?;
            txn.commit()?;
        }
        for host in ["h1", "h2"] {
            let txn = graph.start_txn(txn_req())?;
            let mut c = graph.get_node("e#c")?.unwrap();
            graph.create(host, NodeType::Host)?;
            c.add_forward_edge(host, true)?;
            txn.commit()?;
        }
        {
            let txn = graph.start_txn(txn_req())?;
            let mut c = graph.get_node("e#c")?.unwrap();
            c.remove_forward_edge("h1", true)?;
            txn.commit()?;
        }
        assert_eq!(graph.version()?, 5);

        assert!(graph.set_wanted_version(4)?);
        let c = graph.get_node("e#c")?.unwrap();
        assert_eq!(c.forward_edges(), vec!["h1", "h2"]);

        assert!(graph.set_wanted_version(5)?);
        let c = graph.get_node("e#c")?.unwrap();
        assert_eq!(c.forward_edges(), vec!["h2"]);

        // Before the cluster existed.
        assert!(graph.set_wanted_version(1)?);
        assert!(graph.get_node("e#c")?.is_none());
        assert!(graph.get_node("e")?.is_some());
        assert_eq!(graph.v_count()?, 1);

        // The empty view.
        assert!(graph.set_wanted_version(0)?);
        assert_eq!(graph.v_count()?, 0);

        // Ahead of head: refused, wanted version unchanged.
        assert!(!graph.set_wanted_version(6)?);
        assert_eq!(graph.get_wanted_version()?, 0);
        Ok(())
    }

    #[test]
    fn cursor_walks_visible_nodes() -> CResult<()> {
        let (_store, graph) = setup();
        graph.create("a", NodeType::Host)?;
        graph.create("b", NodeType::Host)?;
        graph.create("c", NodeType::Host)?;
        graph.remove("b")?;

        let mut cursor = graph.cursor()?;
        assert_eq!(cursor.first()?.unwrap().name(), "a");
        assert_eq!(cursor.next()?.unwrap().name(), "c");
        assert!(cursor.next()?.is_none());
        assert_eq!(cursor.prev()?.unwrap().name(), "c");
        assert_eq!(cursor.last()?.unwrap().name(), "c");
        assert!(cursor.fetch("b")?.is_none());
        assert!(cursor.fetch("a")?.is_some());
        Ok(())
    }
}
