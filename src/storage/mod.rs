//! Transaction log sinks
//!
//! The coordinator emits one entry per lifecycle event and hands it to an
//! injected [`TransactionLog`]. Entries render as `"<txID>: <event>"` lines.
//! Nothing here drives recovery; [`replay`] only folds a log back into the
//! last known state of each transaction.

pub mod file_log;
pub mod sled_log;

pub use file_log::FileLog;
pub use sled_log::SledLog;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::coord::types::{Status, TransactionId};

/// Storage errors
#[derive(Error, Debug)]
pub enum LogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Malformed log line: {0}")]
    Malformed(String),
}

/// A lifecycle event of one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxEvent {
    Begin,
    Register { participant: String },
    Status { status: Status },
    /// Written before any Commit/Rollback call goes out
    Decision { commit: bool },
    Evicted,
}

impl fmt::Display for TxEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxEvent::Begin => f.write_str("begin"),
            TxEvent::Register { participant } => write!(f, "register {}", participant),
            TxEvent::Status { status } => write!(f, "status {}", status),
            TxEvent::Decision { commit: true } => f.write_str("decision commit"),
            TxEvent::Decision { commit: false } => f.write_str("decision abort"),
            TxEvent::Evicted => f.write_str("evicted"),
        }
    }
}

impl FromStr for TxEvent {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (verb, rest) = match s.split_once(' ') {
            Some((verb, rest)) => (verb, Some(rest)),
            None => (s, None),
        };
        match (verb, rest) {
            ("begin", None) => Ok(TxEvent::Begin),
            ("evicted", None) => Ok(TxEvent::Evicted),
            ("register", Some(name)) => Ok(TxEvent::Register {
                participant: name.to_string(),
            }),
            ("status", Some(status)) => status
                .parse()
                .map(|status| TxEvent::Status { status })
                .map_err(LogError::Malformed),
            ("decision", Some("commit")) => Ok(TxEvent::Decision { commit: true }),
            ("decision", Some("abort")) => Ok(TxEvent::Decision { commit: false }),
            _ => Err(LogError::Malformed(s.to_string())),
        }
    }
}

/// One line of the transaction log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub tx_id: TransactionId,
    pub event: TxEvent,
}

impl LogEntry {
    pub fn new(tx_id: TransactionId, event: TxEvent) -> Self {
        Self { tx_id, event }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.tx_id, self.event)
    }
}

impl FromStr for LogEntry {
    type Err = LogError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let (id, event) = line
            .split_once(": ")
            .ok_or_else(|| LogError::Malformed(line.to_string()))?;
        Ok(LogEntry::new(TransactionId::from(id), event.parse()?))
    }
}

/// Append-only sink for transaction events
#[async_trait]
pub trait TransactionLog: Send + Sync {
    /// Append one entry; must not return before the entry is durable
    async fn append(&self, entry: &LogEntry) -> Result<(), LogError>;

    /// Every entry in append order
    async fn entries(&self) -> Result<Vec<LogEntry>, LogError>;
}

/// In-memory sink, mainly for tests and embedding
#[derive(Clone, Default)]
pub struct MemoryLog {
    entries: Arc<RwLock<Vec<LogEntry>>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rendered lines, in append order
    pub fn lines(&self) -> Vec<String> {
        self.entries.read().iter().map(|e| e.to_string()).collect()
    }

    pub fn entries_for(&self, tx_id: &TransactionId) -> Vec<TxEvent> {
        self.entries
            .read()
            .iter()
            .filter(|e| &e.tx_id == tx_id)
            .map(|e| e.event.clone())
            .collect()
    }
}

#[async_trait]
impl TransactionLog for MemoryLog {
    async fn append(&self, entry: &LogEntry) -> Result<(), LogError> {
        self.entries.write().push(entry.clone());
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<LogEntry>, LogError> {
        Ok(self.entries.read().clone())
    }
}

/// Last known state of a transaction according to a log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayState {
    pub status: Status,
    pub participants: Vec<String>,
    /// A commit decision was logged; participants may already be committing
    pub commit_decided: bool,
}

impl ReplayState {
    /// Not terminal, so an operator or recovery driver must resolve it
    pub fn in_doubt(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Fold log entries into the last known state per transaction.
///
/// Evicted transactions are dropped from the result.
pub fn replay<'a, I>(entries: I) -> HashMap<TransactionId, ReplayState>
where
    I: IntoIterator<Item = &'a LogEntry>,
{
    let mut states: HashMap<TransactionId, ReplayState> = HashMap::new();
    for entry in entries {
        match &entry.event {
            TxEvent::Evicted => {
                states.remove(&entry.tx_id);
            }
            event => {
                let state = states
                    .entry(entry.tx_id.clone())
                    .or_insert_with(|| ReplayState {
                        status: Status::Active,
                        participants: Vec::new(),
                        commit_decided: false,
                    });
                match event {
                    TxEvent::Register { participant } => {
                        state.participants.push(participant.clone())
                    }
                    TxEvent::Status { status } => state.status = *status,
                    TxEvent::Decision { commit } => state.commit_decided = *commit,
                    TxEvent::Begin | TxEvent::Evicted => {}
                }
            }
        }
    }
    states
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(id: &str, event: TxEvent) -> LogEntry {
        LogEntry::new(TransactionId::from(id), event)
    }

    #[test]
    fn test_line_format() {
        let lines = [
            (entry("tx-1-1", TxEvent::Begin), "tx-1-1: begin"),
            (
                entry(
                    "tx-1-1",
                    TxEvent::Register {
                        participant: "stock db".to_string(),
                    },
                ),
                "tx-1-1: register stock db",
            ),
            (
                entry(
                    "tx-1-1",
                    TxEvent::Status {
                        status: Status::RollingBack,
                    },
                ),
                "tx-1-1: status rolling_back",
            ),
            (
                entry("tx-1-1", TxEvent::Decision { commit: false }),
                "tx-1-1: decision abort",
            ),
            (entry("tx-1-1", TxEvent::Evicted), "tx-1-1: evicted"),
        ];
        for (entry, line) in lines {
            assert_eq!(entry.to_string(), line);
            assert_eq!(line.parse::<LogEntry>().unwrap(), entry);
        }

        assert!("no separator".parse::<LogEntry>().is_err());
        assert!("tx-1-1: status sideways".parse::<LogEntry>().is_err());
        assert!("tx-1-1: decision maybe".parse::<LogEntry>().is_err());
    }

    #[tokio::test]
    async fn test_memory_log_and_replay() {
        let log = MemoryLog::new();
        let events = [
            entry("tx-1-1", TxEvent::Begin),
            entry("tx-1-2", TxEvent::Begin),
            entry(
                "tx-1-1",
                TxEvent::Register {
                    participant: "a".to_string(),
                },
            ),
            entry(
                "tx-1-1",
                TxEvent::Status {
                    status: Status::Prepared,
                },
            ),
            entry("tx-1-1", TxEvent::Decision { commit: true }),
            entry(
                "tx-1-1",
                TxEvent::Status {
                    status: Status::Committing,
                },
            ),
            entry("tx-1-3", TxEvent::Begin),
            entry("tx-1-3", TxEvent::Evicted),
        ];
        for e in &events {
            log.append(e).await.unwrap();
        }

        let stored = log.entries().await.unwrap();
        assert_eq!(stored.len(), events.len());
        assert_eq!(log.lines()[0], "tx-1-1: begin");
        assert_eq!(log.entries_for(&TransactionId::from("tx-1-2")), vec![TxEvent::Begin]);

        let states = replay(&stored);
        assert_eq!(states.len(), 2);

        let first = &states[&TransactionId::from("tx-1-1")];
        assert_eq!(first.status, Status::Committing);
        assert!(first.commit_decided);
        assert!(first.in_doubt());
        assert_eq!(first.participants, vec!["a"]);

        let second = &states[&TransactionId::from("tx-1-2")];
        assert_eq!(second.status, Status::Active);
        assert!(!second.commit_decided);
    }
}
