pub mod txlog;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::storage::engine::{prefix_range, Engine};
use crate::storage::log_cask::LogCask;
use crate::storage::memory::Memory;
use crate::store::txlog::TxLog;

/// Record types partitioning the key namespace of a graph table.
///
/// The numeric values are the key prefix bytes; do not renumber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    Node = 0,
    GraphMeta = 1,
    NodeMeta = 2,
    Reserved = 3,
    Unknown = 4,
}

/// Key separator between the record-type byte and the record name.
const KEY_SEP: [u8; 2] = [0x07, 0x07];

/// The graph-info key listing all graph instance names.
pub const GRAPH_LIST_KEY: &str = "graph_list";

/// The graph-info key holding the cross-graph changelist appended by range
/// transactions.
pub const RANGE_CHANGELIST_KEY: &str = "range_changelist";

/// The per-graph meta key holding that graph's changelist.
pub const CHANGELIST_KEY: &str = "changelist";

/// Garbage ratio at which a table is compacted on open. Node records are
/// rewritten on every mutation, so the logs accumulate garbage quickly.
const COMPACT_GARBAGE_RATIO: f64 = 0.5;

/// Builds the storage key for a record: type byte, two 0x07 separator bytes,
/// then the name bytes.
pub fn key_name(rtype: RecordType, name: &str) -> Vec<u8> {
    let mut key = key_prefix(rtype);
    key.extend_from_slice(name.as_bytes());
    key
}

/// The key prefix shared by all records of a type.
pub fn key_prefix(rtype: RecordType) -> Vec<u8> {
    vec![rtype as u8, KEY_SEP[0], KEY_SEP[1]]
}

/// An ordered list of change sets, one per committed version.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeList {
    /// The head version; bumped by one for every appended change set.
    pub current_version: u64,
    pub changes: Vec<ChangeSet>,
}

/// One committed change: the version it produced, when it happened, and
/// every (node name, node version) whose record advanced.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub version: u64,
    pub timestamp_ms: i64,
    pub items: Vec<(String, u64)>,
}

impl ChangeList {
    /// Appends a change set for the given items, bumping the head version.
    /// Returns the new head.
    pub fn append(&mut self, items: Vec<(String, u64)>) -> u64 {
        self.current_version += 1;
        self.changes.push(ChangeSet {
            version: self.current_version,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            items,
        });
        self.current_version
    }
}

/// A shared handle to one KV table.
pub type SharedEngine = Arc<Mutex<Box<dyn Engine>>>;

/// Writes buffered for one graph while a range transaction is active.
#[derive(Default)]
struct PendingGraph {
    /// Buffered record writes, latest value per key.
    writes: HashMap<Vec<u8>, Vec<u8>>,
    /// (node name, new node version) for every node record written.
    changes: Vec<(String, u64)>,
}

/// The process-level store: the `graph_info` table, one table per graph
/// instance, and the transaction log. Owned by the supervisor and passed
/// around as `Arc<Store>`.
pub struct Store {
    dir: Option<PathBuf>,
    graph_info: SharedEngine,
    graphs: Mutex<HashMap<String, SharedEngine>>,
    txlog: Mutex<TxLog>,
    /// Set while a range transaction is open; guards against nesting.
    txn_active: AtomicBool,
    /// Per-graph buffered writes for the active range transaction.
    pending: Mutex<HashMap<String, PendingGraph>>,
}

impl Store {
    /// Opens (or creates) a store rooted at `db_home`.
    pub fn open(db_home: &Path) -> CResult<Store> {
        let graph_info: Box<dyn Engine> =
            Box::new(LogCask::new_compact(db_home.join("graph_info"), COMPACT_GARBAGE_RATIO)?);
        let txlog = TxLog::open(db_home.join("transactionlog"))?;
        let store = Store {
            dir: Some(db_home.to_path_buf()),
            graph_info: Arc::new(Mutex::new(graph_info)),
            graphs: Mutex::new(HashMap::new()),
            txlog: Mutex::new(txlog),
            txn_active: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
        };
        for name in store.list_graphs()? {
            store.open_graph_engine(&name)?;
        }
        Ok(store)
    }

    /// Creates an in-memory store. Nothing is persisted; used by tests and
    /// by tools that replay a transaction log into a scratch state.
    pub fn in_memory() -> Store {
        Store {
            dir: None,
            graph_info: Arc::new(Mutex::new(Box::new(Memory::new()))),
            graphs: Mutex::new(HashMap::new()),
            txlog: Mutex::new(TxLog::in_memory()),
            txn_active: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// The graph instance names recorded in `graph_info`.
    pub fn list_graphs(&self) -> CResult<Vec<String>> {
        let mut engine = self.lock_info();
        match engine.get(&key_name(RecordType::GraphMeta, GRAPH_LIST_KEY))? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    /// Returns a handle to the named graph's table, creating the graph on
    /// first access and recording it in the graph list.
    pub fn graph(self: &Arc<Self>, name: &str) -> CResult<GraphStore> {
        {
            let graphs = self.graphs.lock().expect("graphs mutex poisoned");
            if graphs.contains_key(name) {
                return Ok(GraphStore { name: name.to_string(), store: Arc::clone(self) });
            }
        }
        self.open_graph_engine(name)?;

        let mut list = self.list_graphs()?;
        if !list.iter().any(|g| g == name) {
            list.push(name.to_string());
            let mut engine = self.lock_info();
            let data = bincode::serialize(&list)?;
            engine.set(&key_name(RecordType::GraphMeta, GRAPH_LIST_KEY), data)?;
            engine.flush()?;
        }
        Ok(GraphStore { name: name.to_string(), store: Arc::clone(self) })
    }

    fn open_graph_engine(&self, name: &str) -> CResult<SharedEngine> {
        let mut graphs = self.graphs.lock().expect("graphs mutex poisoned");
        if let Some(engine) = graphs.get(name) {
            return Ok(Arc::clone(engine));
        }
        let engine: Box<dyn Engine> = match &self.dir {
            Some(dir) => Box::new(LogCask::new_compact(
                dir.join(format!("graph_{}", name)),
                COMPACT_GARBAGE_RATIO,
            )?),
            None => Box::new(Memory::new()),
        };
        let engine = Arc::new(Mutex::new(engine));
        graphs.insert(name.to_string(), Arc::clone(&engine));
        Ok(engine)
    }

    fn graph_engine(&self, name: &str) -> CResult<SharedEngine> {
        let graphs = self.graphs.lock().expect("graphs mutex poisoned");
        graphs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::InvalidState(format!("graph {} not open", name)))
    }

    fn lock_info(&self) -> MutexGuard<'_, Box<dyn Engine>> {
        self.graph_info.lock().expect("graph_info mutex poisoned")
    }

    /// The transaction log, locked for the caller.
    pub fn txlog(&self) -> MutexGuard<'_, TxLog> {
        self.txlog.lock().expect("txlog mutex poisoned")
    }

    /// Reads the cross-graph changelist appended by range transactions.
    pub fn range_changelist(&self) -> CResult<ChangeList> {
        let mut engine = self.lock_info();
        match engine.get(&key_name(RecordType::GraphMeta, RANGE_CHANGELIST_KEY))? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(ChangeList::default()),
        }
    }

    /// Appends one entry to the cross-graph changelist, listing every graph's
    /// head version at commit time.
    pub fn add_new_range_version(&self, graph_heads: Vec<(String, u64)>) -> CResult<u64> {
        let mut changes = self.range_changelist()?;
        let version = changes.append(graph_heads);
        let mut engine = self.lock_info();
        let data = bincode::serialize(&changes)?;
        engine.set(&key_name(RecordType::GraphMeta, RANGE_CHANGELIST_KEY), data)?;
        engine.flush()?;
        Ok(version)
    }

    /// Reads a daemon metadata record (paxos promise state and the like)
    /// from `graph_info`.
    pub fn meta_get(&self, key: &str) -> CResult<Option<Vec<u8>>> {
        let mut engine = self.lock_info();
        engine.get(&key_name(RecordType::NodeMeta, key))
    }

    /// Durably writes a daemon metadata record to `graph_info`.
    pub fn meta_put(&self, key: &str, value: Vec<u8>) -> CResult<()> {
        let mut engine = self.lock_info();
        engine.set(&key_name(RecordType::NodeMeta, key), value)?;
        engine.flush()
    }

    /// Marks a range transaction as open. Fails with `InvalidState` if one
    /// is already active.
    pub(crate) fn begin_txn(&self) -> CResult<()> {
        if self.txn_active.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err()
        {
            return Err(Error::InvalidState("nested range transaction".to_string()));
        }
        Ok(())
    }

    /// Discards all buffered writes and closes the active transaction.
    pub(crate) fn abort_txn(&self) {
        self.pending.lock().expect("pending mutex poisoned").clear();
        self.txn_active.store(false, Ordering::SeqCst);
    }

    /// Applies every buffered graph write, appends one change set per touched
    /// graph, and closes the transaction. Returns the head version of every
    /// graph instance afterwards.
    pub(crate) fn commit_txn(&self) -> CResult<Vec<(String, u64)>> {
        let drained: Vec<(String, PendingGraph)> = {
            let mut pending = self.pending.lock().expect("pending mutex poisoned");
            pending.drain().collect()
        };

        for (graph, work) in drained {
            let engine = self.graph_engine(&graph)?;
            let mut engine = engine.lock().expect("graph engine mutex poisoned");

            for (key, data) in work.writes {
                engine.set(&key, data)?;
            }

            if !work.changes.is_empty() {
                // One change set per transaction, listing each node once at
                // its final version.
                let mut latest: HashMap<String, u64> = HashMap::new();
                for (name, version) in work.changes {
                    let slot = latest.entry(name).or_insert(version);
                    if *slot < version {
                        *slot = version;
                    }
                }
                let mut items: Vec<(String, u64)> = latest.into_iter().collect();
                items.sort();

                let mut changes = read_changelist(&mut engine)?;
                changes.append(items);
                write_changelist(&mut engine, &changes)?;
            }
            engine.flush()?;
        }
        self.txn_active.store(false, Ordering::SeqCst);

        let mut heads = Vec::new();
        for name in self.list_graphs()? {
            let engine = self.graph_engine(&name)?;
            let mut engine = engine.lock().expect("graph engine mutex poisoned");
            let changes = read_changelist(&mut engine)?;
            heads.push((name, changes.current_version));
        }
        heads.sort();
        Ok(heads)
    }

    fn txn_is_active(&self) -> bool {
        self.txn_active.load(Ordering::SeqCst)
    }
}

fn read_changelist(engine: &mut MutexGuard<'_, Box<dyn Engine>>) -> CResult<ChangeList> {
    match engine.get(&key_name(RecordType::GraphMeta, CHANGELIST_KEY))? {
        Some(bytes) => Ok(bincode::deserialize(&bytes)?),
        None => Ok(ChangeList::default()),
    }
}

fn write_changelist(
    engine: &mut MutexGuard<'_, Box<dyn Engine>>,
    changes: &ChangeList,
) -> CResult<()> {
    let data = bincode::serialize(changes)?;
    engine.set(&key_name(RecordType::GraphMeta, CHANGELIST_KEY), data)
}

/// A per-graph handle to the store: every node and meta record of one graph
/// instance goes through here. Cheap to clone; nodes carry one instead of a
/// back-pointer to their graph.
#[derive(Clone)]
pub struct GraphStore {
    name: String,
    store: Arc<Store>,
}

impl GraphStore {
    /// The graph instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Snapshot read of one record. Reads through the active transaction's
    /// buffer so a mutation sees its own earlier writes.
    pub fn get_record(&self, rtype: RecordType, key: &str) -> CResult<Option<Vec<u8>>> {
        let storage_key = key_name(rtype, key);
        if self.store.txn_is_active() {
            let pending = self.store.pending.lock().expect("pending mutex poisoned");
            if let Some(work) = pending.get(&self.name) {
                if let Some(data) = work.writes.get(&storage_key) {
                    return Ok(Some(data.clone()));
                }
            }
        }
        let engine = self.store.graph_engine(&self.name)?;
        let mut engine = engine.lock().expect("graph engine mutex poisoned");
        engine.get(&storage_key)
    }

    /// Writes one record. Inside an active range transaction the write is
    /// buffered; otherwise it is applied immediately together with a
    /// single-item change set (auto-commit).
    pub fn write_record(
        &self,
        rtype: RecordType,
        key: &str,
        object_version: u64,
        data: Vec<u8>,
    ) -> CResult<()> {
        let storage_key = key_name(rtype, key);
        if self.store.txn_is_active() {
            let mut pending = self.store.pending.lock().expect("pending mutex poisoned");
            let work = pending.entry(self.name.clone()).or_default();
            work.writes.insert(storage_key, data);
            if rtype == RecordType::Node {
                work.changes.push((key.to_string(), object_version));
            }
            return Ok(());
        }

        let engine = self.store.graph_engine(&self.name)?;
        let mut engine = engine.lock().expect("graph engine mutex poisoned");
        engine.set(&storage_key, data)?;
        if rtype == RecordType::Node {
            let mut changes = read_changelist(&mut engine)?;
            changes.append(vec![(key.to_string(), object_version)]);
            write_changelist(&mut engine, &changes)?;
        }
        engine.flush()
    }

    /// This graph's changelist.
    pub fn changelist(&self) -> CResult<ChangeList> {
        let engine = self.store.graph_engine(&self.name)?;
        let mut engine = engine.lock().expect("graph engine mutex poisoned");
        read_changelist(&mut engine)
    }

    /// The graph's head version.
    pub fn version(&self) -> CResult<u64> {
        Ok(self.changelist()?.current_version)
    }

    /// Snapshot of all node names in the graph, in key order. Buffered
    /// transaction writes are merged in so a transaction can iterate its own
    /// creations.
    pub fn node_names(&self) -> CResult<Vec<String>> {
        let prefix = key_prefix(RecordType::Node);
        let mut names: Vec<String> = Vec::new();
        {
            let engine = self.store.graph_engine(&self.name)?;
            let mut engine = engine.lock().expect("graph engine mutex poisoned");
            let iter = engine.scan_dyn(prefix_range(&prefix));
            for item in iter {
                let (key, _) = item?;
                names.push(decode_name(&key, &prefix)?);
            }
        }
        if self.store.txn_is_active() {
            let pending = self.store.pending.lock().expect("pending mutex poisoned");
            if let Some(work) = pending.get(&self.name) {
                for key in work.writes.keys() {
                    if key.starts_with(&prefix) {
                        let name = decode_name(key, &prefix)?;
                        if !names.contains(&name) {
                            names.push(name);
                        }
                    }
                }
                names.sort();
            }
        }
        Ok(names)
    }
}

fn decode_name(key: &[u8], prefix: &[u8]) -> CResult<String> {
    String::from_utf8(key[prefix.len()..].to_vec())
        .map_err(|e| Error::Corrupt(format!("non-utf8 record name: {}", e)))
}
