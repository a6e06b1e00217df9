//! sled-backed sink
//!
//! Entries are bincode-encoded under big-endian sequence keys so a tree
//! scan returns them in append order.

use async_trait::async_trait;
use std::path::Path;

use super::{LogEntry, LogError, TransactionLog};

const TREE: &str = "transaction_log";

pub struct SledLog {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledLog {
    /// Open the database at `path`.
    ///
    /// sled holds an exclusive file lock that its background flusher can keep
    /// for a moment after the last handle drops, so reopening the same path
    /// in-process may fail with `WouldBlock`. Share one `sled::Db` through
    /// [`with_db`](Self::with_db) instead.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LogError> {
        let db = sled::open(path)?;
        Self::with_db(db)
    }

    /// Use a tree inside an existing database
    pub fn with_db(db: sled::Db) -> Result<Self, LogError> {
        let tree = db.open_tree(TREE)?;
        Ok(Self { db, tree })
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

#[async_trait]
impl TransactionLog for SledLog {
    async fn append(&self, entry: &LogEntry) -> Result<(), LogError> {
        let key = self.db.generate_id()?.to_be_bytes();
        let value = bincode::serialize(entry)?;
        self.tree.insert(key, value)?;
        self.tree.flush()?;
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<LogEntry>, LogError> {
        self.tree
            .iter()
            .values()
            .map(|value| -> Result<LogEntry, LogError> { Ok(bincode::deserialize(&value?)?) })
            .collect()
    }
}
