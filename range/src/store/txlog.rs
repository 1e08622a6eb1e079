use std::path::PathBuf;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{CResult, Error};
use crate::msg::Request;
use crate::storage::engine::Engine;
use crate::storage::log_cask::LogCask;
use crate::storage::memory::Memory;

/// The append-only transaction log: every applied write request, keyed by a
/// dense sequence number starting at 1. A fresh replica replays this log
/// from a peer to catch up.
pub struct TxLog {
    engine: Box<dyn Engine>,
}

fn seq_key(seq: u64) -> [u8; 8] {
    let mut key = [0u8; 8];
    BigEndian::write_u64(&mut key, seq);
    key
}

fn seq_of(key: &[u8]) -> CResult<u64> {
    if key.len() != 8 {
        return Err(Error::Corrupt(format!("transaction log key of length {}", key.len())));
    }
    Ok(BigEndian::read_u64(key))
}

impl TxLog {
    /// Opens (or creates) the transaction log at the given path.
    pub fn open(path: PathBuf) -> CResult<Self> {
        Ok(Self { engine: Box::new(LogCask::new(path)?) })
    }

    /// An in-memory transaction log for tests and scratch replays.
    pub fn in_memory() -> Self {
        Self { engine: Box::new(Memory::new()) }
    }

    /// Appends a request under the next sequence number and returns it.
    /// Sequence numbers are dense: always last + 1.
    pub fn append(&mut self, req: &Request) -> CResult<u64> {
        let seq = match self.last()? {
            Some((seq, _)) => seq + 1,
            None => 1,
        };
        let data = bincode::serialize(req)?;
        self.engine.set(&seq_key(seq), data)?;
        self.engine.flush()?;
        Ok(seq)
    }

    /// Looks up the entry at the given sequence number.
    pub fn find(&mut self, seq: u64) -> CResult<Option<Request>> {
        match self.engine.get(&seq_key(seq))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The first retained entry, if any.
    pub fn first(&mut self) -> CResult<Option<(u64, Request)>> {
        let item = self.engine.scan_dyn((std::ops::Bound::Unbounded, std::ops::Bound::Unbounded)).next();
        match item {
            Some(entry) => {
                let (key, value) = entry?;
                Ok(Some((seq_of(&key)?, bincode::deserialize(&value)?)))
            }
            None => Ok(None),
        }
    }

    /// The last entry, if any.
    pub fn last(&mut self) -> CResult<Option<(u64, Request)>> {
        let item = self.engine.scan_dyn((std::ops::Bound::Unbounded, std::ops::Bound::Unbounded)).next_back();
        match item {
            Some(entry) => {
                let (key, value) = entry?;
                Ok(Some((seq_of(&key)?, bincode::deserialize(&value)?)))
            }
            None => Ok(None),
        }
    }

    /// All entries with sequence number ≥ from, in order.
    pub fn scan_from(&mut self, from: u64) -> CResult<Vec<(u64, Request)>> {
        let range = (std::ops::Bound::Included(seq_key(from).to_vec()), std::ops::Bound::Unbounded);
        let mut out = Vec::new();
        for entry in self.engine.scan_dyn(range) {
            let (key, value) = entry?;
            out.push((seq_of(&key)?, bincode::deserialize(&value)?));
        }
        Ok(out)
    }

    /// Removes every entry with a sequence number strictly below the given
    /// one (the given sequence itself is retained). Returns whether anything
    /// was removed.
    pub fn prune_prior_to(&mut self, seq: u64) -> CResult<bool> {
        let range =
            (std::ops::Bound::Unbounded, std::ops::Bound::Excluded(seq_key(seq).to_vec()));
        let doomed: Vec<Vec<u8>> = self
            .engine
            .scan_dyn(range)
            .map(|entry| entry.map(|(key, _)| key))
            .collect::<CResult<_>>()?;
        let pruned = !doomed.is_empty();
        for key in doomed {
            self.engine.delete(&key)?;
        }
        self.engine.flush()?;
        Ok(pruned)
    }
}
