#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_run_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS runs (
    run_id INTEGER PRIMARY KEY,
    subject TEXT NOT NULL,
    state TEXT NOT NULL,
    created_at_unix_ms INTEGER NOT NULL,
    started_at_unix_ms INTEGER,
    finished_at_unix_ms INTEGER
);

CREATE TABLE IF NOT EXISTS provider_tasks (
    run_id INTEGER NOT NULL,
    provider TEXT NOT NULL,
    queue_class TEXT NOT NULL,
    state TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    last_error_kind TEXT,
    last_error_message TEXT,
    result_json TEXT,
    created_at_unix_ms INTEGER NOT NULL,
    updated_at_unix_ms INTEGER NOT NULL,
    next_attempt_at_unix_ms INTEGER,
    PRIMARY KEY (run_id, provider)
);

CREATE INDEX IF NOT EXISTS idx_runs_subject
    ON runs (subject, created_at_unix_ms DESC);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_runs_subject;
DROP TABLE IF EXISTS provider_tasks;
DROP TABLE IF EXISTS runs;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_run_failure_reason",
    up_sql: r#"
ALTER TABLE runs ADD COLUMN failure_reason TEXT;
"#,
    down_sql: r#"
ALTER TABLE runs DROP COLUMN failure_reason;
"#,
};

const MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}
