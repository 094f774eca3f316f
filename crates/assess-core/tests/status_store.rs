use std::time::{Duration, SystemTime, UNIX_EPOCH};

use assess_core::models::{
    CoreErrorKind, CostInfo, ProviderName, ProviderResult, ProviderTaskRecord, ProviderTaskState,
    QueueClass, RunId, RunRecord, RunState, SubjectRef, TaskError,
};
use assess_core::persistence::{InMemoryStatusStore, MigrationStore, StatusStore};
use assess_core::sqlite::SqliteStatusStore;

// Whole milliseconds so records survive the sqlite timestamp encoding unchanged.
fn at(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(1_700_000_000_000 + millis)
}

fn run(id: u64, state: RunState) -> RunRecord {
    let mut record = RunRecord::created(RunId(id), SubjectRef::new("acme.example"), at(0));
    record.state = state;
    if state != RunState::Created {
        record.started_at = Some(at(5));
    }
    if state.is_terminal() {
        record.finished_at = Some(at(900));
    }
    record
}

fn task(run: u64, provider: &str, state: ProviderTaskState) -> ProviderTaskRecord {
    let mut record = ProviderTaskRecord::pending(
        RunId(run),
        ProviderName::new(provider),
        QueueClass::Assessment,
        3,
        at(1),
    );
    record.state = state;
    record.updated_at = at(50);
    match state {
        ProviderTaskState::Succeeded => {
            record.attempts = 2;
            record.result = Some(ProviderResult {
                payload: serde_json::json!({ "score": 91, "issues": ["alt-text"] }),
                cost: CostInfo {
                    cost_micros: 1_250,
                    latency: Duration::from_millis(340),
                    peak_memory_bytes: Some(48 * 1024 * 1024),
                },
            });
        }
        ProviderTaskState::FailedPermanent => {
            record.attempts = 1;
            record.last_error = Some(TaskError {
                kind: CoreErrorKind::AuthFailure,
                message: "api key revoked".to_string(),
            });
        }
        ProviderTaskState::RetryScheduled => {
            record.attempts = 1;
            record.next_attempt_at = Some(at(250));
            record.last_error = Some(TaskError {
                kind: CoreErrorKind::RateLimited,
                message: "slow down".to_string(),
            });
        }
        ProviderTaskState::Running => record.attempts = 1,
        ProviderTaskState::Pending => {}
    }
    record
}

fn sqlite_store(dir: &tempfile::TempDir) -> SqliteStatusStore {
    let store = SqliteStatusStore::new(dir.path().join("status.sqlite3"));
    store.migrate_to_latest().unwrap();
    store
}

fn records_round_trip(store: &dyn StatusStore) {
    let tasks = vec![
        task(1, "accessibility", ProviderTaskState::Succeeded),
        task(1, "performance", ProviderTaskState::FailedPermanent),
        task(1, "seo_metrics", ProviderTaskState::RetryScheduled),
    ];
    for record in &tasks {
        store.put_task(record).unwrap();
    }
    store.put_run(&run(1, RunState::InProgress)).unwrap();

    assert_eq!(store.list_tasks(RunId(1)).unwrap(), tasks);
    assert_eq!(
        store.get_run(RunId(1)).unwrap(),
        Some(run(1, RunState::InProgress))
    );
    assert_eq!(store.get_run(RunId(2)).unwrap(), None);
    assert!(store.list_tasks(RunId(2)).unwrap().is_empty());
}

fn later_writes_replace_earlier_ones(store: &dyn StatusStore) {
    store
        .put_task(&task(4, "screenshot", ProviderTaskState::Running))
        .unwrap();
    store
        .put_task(&task(4, "screenshot", ProviderTaskState::Succeeded))
        .unwrap();

    let stored = store.list_tasks(RunId(4)).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].state, ProviderTaskState::Succeeded);
    assert_eq!(stored[0].attempts, 2);
}

fn terminal_run_requires_terminal_tasks(store: &dyn StatusStore) {
    store.put_run(&run(3, RunState::InProgress)).unwrap();
    store
        .put_task(&task(3, "a", ProviderTaskState::Succeeded))
        .unwrap();
    store
        .put_task(&task(3, "b", ProviderTaskState::Running))
        .unwrap();

    let error = store.put_run(&run(3, RunState::Completed)).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);
    assert_eq!(
        store.get_run(RunId(3)).unwrap().map(|record| record.state),
        Some(RunState::InProgress)
    );

    store
        .put_task(&task(3, "b", ProviderTaskState::FailedPermanent))
        .unwrap();
    let mut finished = run(3, RunState::PartiallyCompleted);
    finished.failure_reason = Some("one provider failed".to_string());
    store.put_run(&finished).unwrap();
    assert_eq!(store.get_run(RunId(3)).unwrap(), Some(finished));
}

fn max_run_id_tracks_highest_run(store: &dyn StatusStore) {
    assert_eq!(store.max_run_id().unwrap(), None);
    store.put_run(&run(9, RunState::Created)).unwrap();
    store.put_run(&run(12, RunState::Created)).unwrap();
    store.put_run(&run(10, RunState::Created)).unwrap();
    assert_eq!(store.max_run_id().unwrap(), Some(RunId(12)));
}

#[test]
fn in_memory_store_round_trips_records() {
    records_round_trip(&InMemoryStatusStore::new());
}

#[test]
fn in_memory_store_keeps_last_write() {
    later_writes_replace_earlier_ones(&InMemoryStatusStore::new());
}

#[test]
fn in_memory_store_rejects_premature_terminal_run() {
    terminal_run_requires_terminal_tasks(&InMemoryStatusStore::new());
}

#[test]
fn in_memory_store_reports_max_run_id() {
    max_run_id_tracks_highest_run(&InMemoryStatusStore::new());
}

#[test]
fn sqlite_store_round_trips_records() {
    let dir = tempfile::tempdir().unwrap();
    records_round_trip(&sqlite_store(&dir));
}

#[test]
fn sqlite_store_keeps_last_write() {
    let dir = tempfile::tempdir().unwrap();
    later_writes_replace_earlier_ones(&sqlite_store(&dir));
}

#[test]
fn sqlite_store_rejects_premature_terminal_run() {
    let dir = tempfile::tempdir().unwrap();
    terminal_run_requires_terminal_tasks(&sqlite_store(&dir));
}

#[test]
fn sqlite_store_reports_max_run_id() {
    let dir = tempfile::tempdir().unwrap();
    max_run_id_tracks_highest_run(&sqlite_store(&dir));
}

#[test]
fn sqlite_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("status.sqlite3");
    {
        let store = SqliteStatusStore::new(&path);
        store.migrate_to_latest().unwrap();
        store
            .put_task(&task(21, "accessibility", ProviderTaskState::Succeeded))
            .unwrap();
        store.put_run(&run(21, RunState::Completed)).unwrap();
    }

    let reopened = SqliteStatusStore::new(&path);
    assert_eq!(
        reopened.get_run(RunId(21)).unwrap(),
        Some(run(21, RunState::Completed))
    );
    assert_eq!(reopened.list_tasks(RunId(21)).unwrap().len(), 1);
    assert_eq!(reopened.max_run_id().unwrap(), Some(RunId(21)));
}

#[test]
fn sqlite_store_refuses_work_before_migration() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStatusStore::new(dir.path().join("fresh.sqlite3"));

    assert_eq!(store.current_version().unwrap(), 0);
    let error = store.get_run(RunId(1)).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);
}
