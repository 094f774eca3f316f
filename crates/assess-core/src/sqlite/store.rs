use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::models::{
    CoreError, CoreErrorKind, ProviderName, ProviderResult, ProviderTaskRecord, ProviderTaskState,
    QueueClass, RunId, RunRecord, RunState, SubjectRef, TaskError,
};
use crate::persistence::{MigrationStore, PersistenceResult, StatusStore};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "assess_schema_migrations";

/// [`StatusStore`] backed by a SQLite file. Each call opens its own connection.
pub struct SqliteStatusStore {
    database_path: PathBuf,
}

impl SqliteStatusStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path)
            .map_err(|error| storage_error(operation_name, error))?;
        operation(&mut connection).map_err(|error| storage_error(operation_name, error))
    }
}

impl MigrationStore for SqliteStatusStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        if target_version > 0 && migration(target_version).is_none() {
            return Err(storage_error_text(
                "apply_migration",
                format!("migration version '{target_version}' is not defined"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version == current_version {
                // DDL is IF NOT EXISTS; re-running repairs recorded-but-missing tables.
                for version in 1..=target_version {
                    execute_batch_tolerant(connection, defined_migration(version)?.up_sql)?;
                }
                return Ok(());
            }

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, defined_migration(version)?)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, defined_migration(version)?)?;
                }
            }

            Ok(())
        })
    }
}

impl StatusStore for SqliteStatusStore {
    fn put_task(&self, task: &ProviderTaskRecord) -> PersistenceResult<()> {
        self.with_connection("put_task", |connection| {
            ensure_schema_ready(connection)?;
            let result_json = task
                .result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;

            connection.execute(
                "
INSERT INTO provider_tasks (
    run_id, provider, queue_class, state, attempts, max_attempts,
    last_error_kind, last_error_message, result_json,
    created_at_unix_ms, updated_at_unix_ms, next_attempt_at_unix_ms
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
ON CONFLICT(run_id, provider) DO UPDATE SET
    queue_class = excluded.queue_class,
    state = excluded.state,
    attempts = excluded.attempts,
    max_attempts = excluded.max_attempts,
    last_error_kind = excluded.last_error_kind,
    last_error_message = excluded.last_error_message,
    result_json = excluded.result_json,
    updated_at_unix_ms = excluded.updated_at_unix_ms,
    next_attempt_at_unix_ms = excluded.next_attempt_at_unix_ms
",
                params![
                    run_id_to_i64(task.run)?,
                    task.provider.as_str(),
                    task.queue_class.as_str(),
                    task.state.as_str(),
                    task.attempts,
                    task.max_attempts,
                    task.last_error.as_ref().map(|error| error.kind.as_str()),
                    task.last_error.as_ref().map(|error| error.message.as_str()),
                    result_json,
                    to_unix_millis(task.created_at)?,
                    to_unix_millis(task.updated_at)?,
                    task.next_attempt_at.map(to_unix_millis).transpose()?,
                ],
            )?;
            Ok(())
        })
    }

    fn put_run(&self, run: &RunRecord) -> PersistenceResult<()> {
        self.with_connection("put_run", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;
            let run_id = run_id_to_i64(run.id)?;

            if run.state.is_terminal() {
                let pending: Option<String> = transaction
                    .query_row(
                        "
SELECT provider FROM provider_tasks
WHERE run_id = ?1 AND state NOT IN ('succeeded', 'failed_permanent')
LIMIT 1
",
                        [run_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(provider) = pending {
                    return Err(storage_error_sqlite(&format!(
                        "run {} cannot be stored as '{}' while task '{provider}' is in flight",
                        run.id,
                        run.state.as_str()
                    )));
                }
            }

            transaction.execute(
                "
INSERT INTO runs (
    run_id, subject, state, created_at_unix_ms, started_at_unix_ms,
    finished_at_unix_ms, failure_reason
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT(run_id) DO UPDATE SET
    subject = excluded.subject,
    state = excluded.state,
    started_at_unix_ms = excluded.started_at_unix_ms,
    finished_at_unix_ms = excluded.finished_at_unix_ms,
    failure_reason = excluded.failure_reason
",
                params![
                    run_id,
                    run.subject.as_str(),
                    run.state.as_str(),
                    to_unix_millis(run.created_at)?,
                    run.started_at.map(to_unix_millis).transpose()?,
                    run.finished_at.map(to_unix_millis).transpose()?,
                    run.failure_reason.as_deref(),
                ],
            )?;
            transaction.commit()?;
            Ok(())
        })
    }

    fn get_run(&self, run: RunId) -> PersistenceResult<Option<RunRecord>> {
        self.with_connection("get_run", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(
                    "
SELECT run_id, subject, state, created_at_unix_ms, started_at_unix_ms,
       finished_at_unix_ms, failure_reason
FROM runs
WHERE run_id = ?1
",
                    [run_id_to_i64(run)?],
                    run_from_row,
                )
                .optional()
        })
    }

    fn list_tasks(&self, run: RunId) -> PersistenceResult<Vec<ProviderTaskRecord>> {
        self.with_connection("list_tasks", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT run_id, provider, queue_class, state, attempts, max_attempts,
       last_error_kind, last_error_message, result_json,
       created_at_unix_ms, updated_at_unix_ms, next_attempt_at_unix_ms
FROM provider_tasks
WHERE run_id = ?1
ORDER BY provider ASC
",
            )?;
            let rows = statement.query_map([run_id_to_i64(run)?], task_from_row)?;
            rows.collect()
        })
    }

    fn max_run_id(&self) -> PersistenceResult<Option<RunId>> {
        self.with_connection("max_run_id", |connection| {
            ensure_schema_ready(connection)?;
            let max_id: Option<i64> =
                connection.query_row("SELECT MAX(run_id) FROM runs", [], |row| row.get(0))?;
            max_id.map(|id| i64_to_u64(id).map(RunId)).transpose()
        })
    }
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let run_id_raw: i64 = row.get(0)?;
    let subject: String = row.get(1)?;
    let state_raw: String = row.get(2)?;
    let created_at: i64 = row.get(3)?;
    let started_at: Option<i64> = row.get(4)?;
    let finished_at: Option<i64> = row.get(5)?;

    Ok(RunRecord {
        id: RunId(i64_to_u64(run_id_raw)?),
        subject: SubjectRef::new(subject),
        state: RunState::parse(&state_raw)
            .ok_or_else(|| storage_error_sqlite(&format!("unknown run state '{state_raw}'")))?,
        created_at: from_unix_millis(created_at)?,
        started_at: started_at.map(from_unix_millis).transpose()?,
        finished_at: finished_at.map(from_unix_millis).transpose()?,
        failure_reason: row.get(6)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<ProviderTaskRecord> {
    let run_id_raw: i64 = row.get(0)?;
    let provider: String = row.get(1)?;
    let queue_class_raw: String = row.get(2)?;
    let state_raw: String = row.get(3)?;
    let error_kind_raw: Option<String> = row.get(6)?;
    let error_message: Option<String> = row.get(7)?;
    let result_json: Option<String> = row.get(8)?;
    let next_attempt_at: Option<i64> = row.get(11)?;

    let last_error = match error_kind_raw {
        Some(raw) => Some(TaskError {
            kind: CoreErrorKind::parse(&raw)
                .ok_or_else(|| storage_error_sqlite(&format!("unknown error kind '{raw}'")))?,
            message: error_message.unwrap_or_default(),
        }),
        None => None,
    };
    let result = result_json
        .map(|raw| serde_json::from_str::<ProviderResult>(&raw))
        .transpose()
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(error))
        })?;

    Ok(ProviderTaskRecord {
        run: RunId(i64_to_u64(run_id_raw)?),
        provider: ProviderName::new(provider),
        queue_class: QueueClass::parse(&queue_class_raw).ok_or_else(|| {
            storage_error_sqlite(&format!("unknown queue class '{queue_class_raw}'"))
        })?,
        state: ProviderTaskState::parse(&state_raw)
            .ok_or_else(|| storage_error_sqlite(&format!("unknown task state '{state_raw}'")))?,
        attempts: row.get(4)?,
        max_attempts: row.get(5)?,
        last_error,
        result,
        created_at: from_unix_millis(row.get(9)?)?,
        updated_at: from_unix_millis(row.get(10)?)?,
        next_attempt_at: next_attempt_at.map(from_unix_millis).transpose()?,
    })
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    let connection = Connection::open(database_path)?;
    connection.busy_timeout(Duration::from_secs(5))?;
    Ok(connection)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(
        "
CREATE TABLE IF NOT EXISTS assess_schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
",
    )?;
    Ok(())
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version <= 0 {
        return Err(storage_error_sqlite(
            "database schema is not initialized; apply migrations before run operations",
        ));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn defined_migration(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version)
        .ok_or_else(|| storage_error_sqlite(&format!("migration version '{version}' is not defined")))
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    execute_batch_tolerant(&transaction, migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()?;
    Ok(())
}

/// `ALTER TABLE ADD COLUMN` is not idempotent in SQLite; a duplicate column is fine.
fn execute_batch_tolerant(connection: &Connection, sql: &str) -> rusqlite::Result<()> {
    match connection.execute_batch(sql) {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("duplicate column name") => Ok(()),
        Err(e) => Err(e),
    }
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()?;
    Ok(())
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    storage_error_text(operation, error.to_string())
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    )
}

fn to_unix_millis(value: SystemTime) -> rusqlite::Result<i64> {
    let duration = value.duration_since(UNIX_EPOCH).map_err(|error| {
        storage_error_sqlite(&format!("time before unix epoch is not supported: {error}"))
    })?;
    i64::try_from(duration.as_millis())
        .map_err(|_| storage_error_sqlite("unix timestamp millis exceed i64 range"))
}

fn from_unix_millis(value: i64) -> rusqlite::Result<SystemTime> {
    let millis = u64::try_from(value)
        .map_err(|_| storage_error_sqlite("negative unix timestamps are not supported"))?;
    Ok(UNIX_EPOCH + Duration::from_millis(millis))
}

fn run_id_to_i64(value: RunId) -> rusqlite::Result<i64> {
    i64::try_from(value.0).map_err(|_| storage_error_sqlite("run id exceeds i64 range"))
}

fn i64_to_u64(value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| storage_error_sqlite("negative id is not supported"))
}
