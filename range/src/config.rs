use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};

use crate::error::CResult;

const DEFAULT_DB_HOME: &str = "/var/lib/range";
const DEFAULT_MQ_NAME: &str = "range-stored";
const DEFAULT_CELL_NAME: &str = "range_cell";
const DEFAULT_PORT: u16 = 5444;

/// Daemon configuration, loaded from a YAML file. Every option has a
/// default so a minimal config file only names what it changes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreDaemonConfig {
    /// Root of the KV environment.
    pub db_home: PathBuf,

    /// Backend cache size in bytes.
    pub cache_size: u64,

    /// Whether this node participates in replication at all.
    pub use_stored: bool,

    /// Name of the local request queue.
    pub stored_mq_name: String,

    /// How long, in milliseconds, paxos state may wait before it is
    /// considered dead. Network sends derive their deadlines from this.
    pub stored_request_timeout: u64,

    /// How long a client waits on the acknowledgment channel, in
    /// milliseconds.
    pub reader_ack_timeout: u64,

    /// Heartbeat interval and reply deadline, in milliseconds.
    pub heartbeat_timeout: u64,

    /// Hostnames probed for replay and cluster bootstrap.
    pub initial_peers: Vec<String>,

    /// This node's identity within the cell.
    pub node_id: String,

    /// UDP port for replication traffic.
    pub port: u16,

    /// Cluster identifier naming the three paxos-role clusters
    /// (`<cell>.proposers` etc).
    pub range_cell_name: String,
}

impl Default for StoreDaemonConfig {
    fn default() -> Self {
        StoreDaemonConfig {
            db_home: PathBuf::from(DEFAULT_DB_HOME),
            cache_size: 64 * 1024 * 1024,
            use_stored: true,
            stored_mq_name: DEFAULT_MQ_NAME.to_string(),
            stored_request_timeout: 30_000,
            reader_ack_timeout: 5_000,
            heartbeat_timeout: 2_000,
            initial_peers: Vec::new(),
            node_id: default_node_id(),
            port: DEFAULT_PORT,
            range_cell_name: DEFAULT_CELL_NAME.to_string(),
        }
    }
}

fn default_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

impl StoreDaemonConfig {
    /// Loads the configuration from a YAML file.
    pub fn load(path: &std::path::Path) -> CResult<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    /// The qualified name of one of the cell's role clusters.
    pub fn cell_cluster(&self, role: &str) -> String {
        format!("{}.{}", self.range_cell_name, role)
    }
}
