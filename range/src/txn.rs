use std::sync::Arc;

use crate::error::CResult;
use crate::msg::Request;
use crate::store::Store;

/// A scoped cross-graph transaction: groups every graph mutation made while
/// it is open into one version bump per touched graph and one entry in the
/// transaction log.
///
/// Commit order matters: the originating request is durably appended to the
/// transaction log first, then the buffered graph writes apply, then one
/// change-set entry with every graph's head version is appended to the
/// range changelist. Dropping the transaction without committing aborts it;
/// nothing reaches the engines.
pub struct RangeTxn {
    store: Arc<Store>,
    request: Request,
    start_version: u64,
    done: bool,
}

impl RangeTxn {
    /// Opens a transaction, capturing the current range version. Fails with
    /// `InvalidState` when one is already active.
    pub fn begin(store: Arc<Store>, request: Request) -> CResult<RangeTxn> {
        store.begin_txn()?;
        let start_version = match store.range_changelist() {
            Ok(changes) => changes.current_version,
            Err(err) => {
                store.abort_txn();
                return Err(err);
            }
        };
        Ok(RangeTxn { store, request, start_version, done: false })
    }

    /// The range version when the transaction began.
    pub fn start_version(&self) -> u64 {
        self.start_version
    }

    /// Commits: log append, buffered writes, range version bump. Returns the
    /// new range version.
    pub fn commit(mut self) -> CResult<u64> {
        self.done = true;
        let result = self.try_commit();
        if result.is_err() {
            self.store.abort_txn();
        }
        result
    }

    fn try_commit(&self) -> CResult<u64> {
        let seq = self.store.txlog().append(&self.request)?;
        log::debug!("transaction {} appended at sequence {}", self.request.method, seq);
        let heads = self.store.commit_txn()?;
        self.store.add_new_range_version(heads)
    }
}

impl Drop for RangeTxn {
    fn drop(&mut self) {
        if !self.done {
            log::debug!("aborting range transaction {}", self.request.method);
            self.store.abort_txn();
        }
    }
}
