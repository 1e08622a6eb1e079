pub mod engine;
pub mod log;
pub mod log_cask;
pub mod memory;

use serde_derive::{Deserialize, Serialize};

use crate::error::CResult;

/// Maps keys to a value position and length in the log file. A BTreeMap is
/// used so scans and compaction can walk keys in order. The map always points
/// at the latest version of each live key.
pub type KeyDir = std::collections::BTreeMap<Vec<u8>, (u64, u32)>;

/// Storage engine status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The name of the storage engine.
    pub name: String,

    /// The number of live keys in the engine.
    pub keys: u64,

    /// The logical size of live key/value pairs.
    pub size: u64,

    /// The on-disk size of all data, live and garbage.
    pub total_disk_size: u64,

    /// The on-disk size of live data.
    pub live_disk_size: u64,

    /// The on-disk size of garbage data.
    pub garbage_disk_size: u64,
}

/// A scan iterator, with a blanket implementation (in lieu of trait aliases).
pub trait ScanIteratorT: DoubleEndedIterator<Item = CResult<(Vec<u8>, Vec<u8>)>> {}

impl<I: DoubleEndedIterator<Item = CResult<(Vec<u8>, Vec<u8>)>>> ScanIteratorT for I {}
