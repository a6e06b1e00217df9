//! Journal - fans each transaction event out to the log sink and subscribers

use async_broadcast::{InactiveReceiver, Receiver, Sender};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::coord::types::TransactionId;
use crate::storage::{LogEntry, LogError, TransactionLog, TxEvent};

#[derive(Clone)]
pub struct Journal {
    log: Option<Arc<dyn TransactionLog>>,
    events_tx: Sender<LogEntry>,
    // Keeps the channel open while nobody is subscribed
    events_rx: InactiveReceiver<LogEntry>,
}

impl Journal {
    pub fn new(log: Option<Arc<dyn TransactionLog>>, capacity: usize) -> Self {
        let (mut events_tx, events_rx) = async_broadcast::broadcast(capacity.max(1));
        events_tx.set_overflow(true);
        Self {
            log,
            events_tx,
            events_rx: events_rx.deactivate(),
        }
    }

    pub fn subscribe(&self) -> Receiver<LogEntry> {
        self.events_rx.activate_cloned()
    }

    /// Append to the sink, then notify subscribers.
    ///
    /// Subscribers only see events the sink accepted.
    pub async fn record(&self, tx_id: &TransactionId, event: TxEvent) -> Result<(), LogError> {
        let entry = LogEntry::new(tx_id.clone(), event);
        if let Some(log) = &self.log {
            log.append(&entry).await?;
        }
        debug!(tx_id = %entry.tx_id, event = %entry.event, "Transaction event");
        // Err only means there are no active subscribers
        let _ = self.events_tx.try_broadcast(entry);
        Ok(())
    }

    /// Like [`record`](Self::record) for events whose loss does not affect correctness
    pub async fn note(&self, tx_id: &TransactionId, event: TxEvent) {
        if let Err(e) = self.record(tx_id, event).await {
            warn!(tx_id = %tx_id, error = %e, "Failed to append transaction event");
        }
    }
}
