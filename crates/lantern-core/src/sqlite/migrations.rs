#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_task_queue_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS task_records (
    task_id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    priority_rank INTEGER NOT NULL,
    state TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    lease_owner TEXT,
    lease_expiry_ms INTEGER,
    not_before_ms INTEGER,
    result TEXT,
    error TEXT,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_records_eligibility
    ON task_records (state, priority_rank, task_id);

CREATE INDEX IF NOT EXISTS idx_task_records_run
    ON task_records (run_id, state);

CREATE TABLE IF NOT EXISTS workflow_runs (
    run_id INTEGER PRIMARY KEY AUTOINCREMENT,
    question TEXT NOT NULL,
    status TEXT NOT NULL,
    stages TEXT NOT NULL DEFAULT '[]',
    elapsed_ms INTEGER NOT NULL DEFAULT 0,
    started_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS workflow_runs;
DROP INDEX IF EXISTS idx_task_records_run;
DROP INDEX IF EXISTS idx_task_records_eligibility;
DROP TABLE IF EXISTS task_records;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_document_catalog",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS documents (
    document_id INTEGER PRIMARY KEY,
    title TEXT NOT NULL,
    abstract TEXT NOT NULL DEFAULT '',
    authors TEXT,
    publication_year INTEGER
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS documents;
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
