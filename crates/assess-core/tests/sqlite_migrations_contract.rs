use assess_core::models::{RunId, RunRecord, SubjectRef};
use assess_core::persistence::{MigrationStore, StatusStore};
use assess_core::sqlite::{SqliteStatusStore, current_schema_version, migration, migrations};

#[test]
fn migration_versions_are_strictly_increasing() {
    let entries = migrations();
    assert!(!entries.is_empty());

    let mut previous = 0;
    for entry in entries {
        assert!(entry.version > previous);
        previous = entry.version;
    }
}

#[test]
fn migration_lookup_and_schema_version_are_consistent() {
    let latest = current_schema_version();
    let latest_entry = migration(latest).expect("latest migration must exist");
    assert_eq!(latest_entry.version, latest);
    assert!(migration(latest + 1).is_none());
}

#[test]
fn migration_sql_is_defined_for_up_and_down_paths() {
    for entry in migrations() {
        assert!(!entry.up_sql.trim().is_empty(), "up sql must not be empty");
        assert!(
            !entry.down_sql.trim().is_empty(),
            "down sql must not be empty"
        );
    }
}

#[test]
fn migrations_apply_and_roll_back_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStatusStore::new(dir.path().join("migrations.sqlite3"));

    assert_eq!(store.planned_migrations(0).len(), migrations().len());
    store.apply_migration(1).unwrap();
    assert_eq!(store.current_version().unwrap(), 1);
    assert_eq!(
        store.planned_migrations(1).len(),
        migrations().len() - 1
    );

    store.migrate_to_latest().unwrap();
    assert_eq!(store.current_version().unwrap(), current_schema_version());
    store.migrate_to_latest().unwrap();

    let mut record = RunRecord::created(
        RunId(1),
        SubjectRef::new("acme.example"),
        std::time::UNIX_EPOCH,
    );
    record.failure_reason = Some("kept".to_string());
    store.put_run(&record).unwrap();

    store.apply_migration(0).unwrap();
    assert_eq!(store.current_version().unwrap(), 0);
    assert!(store.get_run(RunId(1)).is_err());

    store.migrate_to_latest().unwrap();
    assert_eq!(store.get_run(RunId(1)).unwrap(), None);
}

#[test]
fn unknown_target_version_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStatusStore::new(dir.path().join("unknown.sqlite3"));

    assert!(store.apply_migration(current_schema_version() + 5).is_err());
    assert_eq!(store.current_version().unwrap(), 0);
}
