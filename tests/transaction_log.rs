//! Coordinator behaviour with a transaction log attached

mod common;

use async_broadcast::TryRecvError;
use async_trait::async_trait;
use std::sync::Arc;

use common::{init_tracing, test_config, MockParticipant, PrepareScript};
use pretty_assertions::assert_eq;
use twophase::storage::{replay, LogError};
use twophase::{
    AbortCause, Coordinator, FileLog, LogEntry, MemoryLog, Status, TransactionLog, TxEvent,
};

#[tokio::test]
async fn test_commit_is_logged_in_order() {
    init_tracing();
    let log = MemoryLog::new();
    let coordinator = Coordinator::with_log(test_config(), Arc::new(log.clone())).unwrap();

    let id = coordinator.begin().await;
    coordinator
        .register(&id, MockParticipant::new("orders").arc())
        .await
        .unwrap();
    coordinator.end(&id).await.unwrap();

    let expected: Vec<String> = [
        "begin",
        "register orders",
        "status preparing",
        "status prepared",
        "decision commit",
        "status committing",
        "status committed",
    ]
    .iter()
    .map(|event| format!("{}: {}", id, event))
    .collect();
    assert_eq!(log.lines(), expected);
}

#[tokio::test]
async fn test_prepare_failure_is_logged_as_abort() {
    init_tracing();
    let log = MemoryLog::new();
    let coordinator = Coordinator::with_log(test_config(), Arc::new(log.clone())).unwrap();

    let id = coordinator.begin().await;
    coordinator
        .register(
            &id,
            MockParticipant::new("stock")
                .with_prepare(PrepareScript::Reject)
                .arc(),
        )
        .await
        .unwrap();
    coordinator.end(&id).await.unwrap_err();

    let events = log.entries_for(&id);
    assert!(events.contains(&TxEvent::Status {
        status: Status::PrepareFailed
    }));
    assert!(events.contains(&TxEvent::Decision { commit: false }));
    assert_eq!(
        events.last(),
        Some(&TxEvent::Status {
            status: Status::RolledBack
        })
    );
}

/// Sink that refuses to persist commit decisions
#[derive(Clone, Default)]
struct NoDecisionLog {
    inner: MemoryLog,
}

#[async_trait]
impl TransactionLog for NoDecisionLog {
    async fn append(&self, entry: &LogEntry) -> Result<(), LogError> {
        if entry.event == (TxEvent::Decision { commit: true }) {
            return Err(LogError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.inner.append(entry).await
    }

    async fn entries(&self) -> Result<Vec<LogEntry>, LogError> {
        self.inner.entries().await
    }
}

#[tokio::test]
async fn test_unlogged_decision_rolls_back() {
    init_tracing();
    let log = NoDecisionLog::default();
    let coordinator = Coordinator::with_log(test_config(), Arc::new(log.clone())).unwrap();
    let a = MockParticipant::new("a").arc();
    let b = MockParticipant::new("b").arc();

    let id = coordinator.begin().await;
    coordinator.register(&id, a.clone()).await.unwrap();
    coordinator.register(&id, b.clone()).await.unwrap();

    let err = coordinator.end(&id).await.unwrap_err();

    assert_eq!(err.abort_cause(), Some(AbortCause::DecisionNotLogged));
    assert_eq!(coordinator.status(&id).unwrap(), Status::RolledBack);
    for p in [&a, &b] {
        assert_eq!(p.commits(), 0);
        assert_eq!(p.rollbacks(), 1);
    }
    assert!(!log
        .inner
        .entries_for(&id)
        .contains(&TxEvent::Decision { commit: true }));
}

#[tokio::test]
async fn test_file_log_replays_to_terminal_state() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coordinator.log");

    let (committed, open) = {
        let log = FileLog::open(&path).await.unwrap();
        let coordinator = Coordinator::with_log(test_config(), Arc::new(log)).unwrap();

        let committed = coordinator.begin().await;
        coordinator
            .register(&committed, MockParticipant::new("ledger").arc())
            .await
            .unwrap();
        coordinator.end(&committed).await.unwrap();

        let open = coordinator.begin().await;
        coordinator
            .register(&open, MockParticipant::new("cache").arc())
            .await
            .unwrap();
        (committed, open)
    };

    let log = FileLog::open(&path).await.unwrap();
    let entries = log.entries().await.unwrap();
    let states = replay(&entries);

    let done = &states[&committed];
    assert_eq!(done.status, Status::Committed);
    assert!(done.commit_decided);
    assert!(!done.in_doubt());

    let pending = &states[&open];
    assert_eq!(pending.status, Status::Active);
    assert_eq!(pending.participants, vec!["cache"]);
    assert!(pending.in_doubt());
}

#[tokio::test]
async fn test_subscribers_see_lifecycle() {
    init_tracing();
    let coordinator = Coordinator::new(test_config()).unwrap();
    let mut events = coordinator.subscribe();

    let id = coordinator.begin().await;
    coordinator.rollback(&id).await.unwrap();

    let mut seen = Vec::new();
    loop {
        let entry = match events.try_recv() {
            Ok(entry) => entry,
            Err(TryRecvError::Overflowed(_)) => continue,
            Err(_) => break,
        };
        assert_eq!(entry.tx_id, id);
        seen.push(entry.event);
    }
    assert_eq!(
        seen,
        vec![
            TxEvent::Begin,
            TxEvent::Status {
                status: Status::RollingBack
            },
            TxEvent::Status {
                status: Status::RolledBack
            },
        ]
    );
}

#[tokio::test]
async fn test_lagging_subscriber_skips_lost_events() {
    init_tracing();
    let config = twophase::CoordinatorConfig {
        event_capacity: 2,
        ..test_config()
    };
    let coordinator = Coordinator::new(config).unwrap();
    let mut events = coordinator.subscribe();

    let id = coordinator.begin().await;
    coordinator.rollback(&id).await.unwrap();

    // Three events into a two-slot buffer: the oldest is gone
    assert!(matches!(events.try_recv(), Err(TryRecvError::Overflowed(1))));

    let mut seen = Vec::new();
    loop {
        let entry = match events.try_recv() {
            Ok(entry) => entry,
            Err(TryRecvError::Overflowed(_)) => continue,
            Err(_) => break,
        };
        seen.push(entry.event);
    }
    assert_eq!(
        seen,
        vec![
            TxEvent::Status {
                status: Status::RollingBack
            },
            TxEvent::Status {
                status: Status::RolledBack
            },
        ]
    );
}
