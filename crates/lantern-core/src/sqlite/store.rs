use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::functions::FunctionFlags;
use rusqlite::types::Value;
use rusqlite::{
    Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior, params, params_from_iter,
};

use crate::models::{
    CoreError, CoreErrorKind, DocumentId, DocumentRecord, NewTask, RunId, RunStatus, StageOutcome,
    TaskId, TaskKind, TaskLease, TaskPriority, TaskRecord, TaskState, TaskStateCounts,
    WorkflowRun,
};
use crate::persistence::{
    DocumentStore, MigrationStore, PersistenceResult, RunStore, TaskMutation, TaskScan, TaskStore,
};
use crate::querygen::expression::{fold_search_text, parse_query_expression};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "lantern_schema_migrations";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
/// SQL function applying the same case fold as parsed query terms.
const FOLD_FUNCTION: &str = "lantern_fold";

const TASK_COLUMNS: &str = "task_id, run_id, kind, payload, priority_rank, state, attempts, \
     lease_owner, lease_expiry_ms, not_before_ms, result, error, created_at_ms, updated_at_ms";

pub struct SqliteStore {
    database_path: PathBuf,
}

impl SqliteStore {
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

    /// Loads or replaces catalog rows; used to seed the document store.
    pub fn insert_documents(&self, documents: &[DocumentRecord]) -> PersistenceResult<()> {
        self.with_connection("insert_documents", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;
            {
                let mut statement = transaction.prepare(
                    "
INSERT INTO documents (document_id, title, abstract, authors, publication_year)
VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(document_id) DO UPDATE SET
    title = excluded.title,
    abstract = excluded.abstract,
    authors = excluded.authors,
    publication_year = excluded.publication_year
",
                )?;
                for document in documents {
                    statement.execute(params![
                        document.id.0,
                        document.title.as_str(),
                        document.abstract_text.as_str(),
                        document.authors.as_deref(),
                        document.year,
                    ])?;
                }
            }
            transaction.commit()?;
            Ok(())
        })
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

impl MigrationStore for SqliteStore {
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
                // DDL is idempotent; re-running it repairs tables dropped behind our back.
                for version in 1..=target_version {
                    connection.execute_batch(defined_migration(version)?.up_sql)?;
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

impl TaskStore for SqliteStore {
    fn append(&self, task: &NewTask) -> PersistenceResult<TaskRecord> {
        self.with_connection("append", |connection| {
            ensure_schema_ready(connection)?;
            let created_at_ms = to_unix_millis(task.created_at)?;
            let payload = serde_json::to_string(&task.payload)
                .map_err(|error| storage_error_sqlite(&format!("payload encoding: {error}")))?;
            connection.execute(
                "
INSERT INTO task_records (
    run_id, kind, payload, priority_rank, state, attempts, created_at_ms, updated_at_ms
) VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5)
",
                params![
                    task.run.map(|run| run_id_to_i64(run)).transpose()?,
                    task_kind_to_str(task.kind),
                    payload,
                    task.priority.rank(),
                    created_at_ms,
                ],
            )?;
            let task_id = i64_to_u64(connection.last_insert_rowid())?;

            Ok(TaskRecord {
                id: TaskId(task_id),
                run: task.run,
                kind: task.kind,
                payload: task.payload.clone(),
                priority: task.priority,
                state: TaskState::Pending,
                attempts: 0,
                lease: None,
                not_before: None,
                result: None,
                error: None,
                created_at: from_unix_millis(created_at_ms)?,
                updated_at: from_unix_millis(created_at_ms)?,
            })
        })
    }

    fn update(
        &self,
        task_id: TaskId,
        mutation: TaskMutation<'_>,
    ) -> PersistenceResult<TaskRecord> {
        let outcome = self.with_connection("update", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = transaction
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM task_records WHERE task_id = ?1"),
                    params![task_id_to_i64(task_id)?],
                    read_task_row,
                )
                .optional()?;

            let Some(mut record) = current else {
                return Ok(Err(CoreError::new(
                    CoreErrorKind::NotFound,
                    format!("unknown task id '{}'", task_id.0),
                )));
            };

            if let Err(error) = mutation(&mut record) {
                // Dropping the transaction rolls it back.
                return Ok(Err(error));
            }

            record.id = task_id;
            record.updated_at = SystemTime::now();
            write_task_row(&transaction, &record)?;
            transaction.commit()?;
            Ok(Ok(record))
        })?;
        outcome
    }

    fn get(&self, task_id: TaskId) -> PersistenceResult<Option<TaskRecord>> {
        self.with_connection("get", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM task_records WHERE task_id = ?1"),
                    params![task_id_to_i64(task_id)?],
                    read_task_row,
                )
                .optional()
        })
    }

    fn scan(&self, scan: &TaskScan) -> PersistenceResult<Vec<TaskRecord>> {
        if scan.limit == Some(0) {
            return Ok(Vec::new());
        }

        self.with_connection("scan", |connection| {
            ensure_schema_ready(connection)?;
            let mut clauses = Vec::new();
            let mut values: Vec<Value> = Vec::new();

            if !scan.states.is_empty() {
                clauses.push(format!("state IN ({})", placeholders(scan.states.len())));
                values.extend(
                    scan.states
                        .iter()
                        .map(|state| Value::Text(task_state_to_str(*state).to_string())),
                );
            }
            if !scan.kinds.is_empty() {
                clauses.push(format!("kind IN ({})", placeholders(scan.kinds.len())));
                values.extend(
                    scan.kinds
                        .iter()
                        .map(|kind| Value::Text(task_kind_to_str(*kind).to_string())),
                );
            }
            if let Some(run) = scan.run {
                clauses.push("run_id = ?".to_string());
                values.push(Value::Integer(run_id_to_i64(run)?));
            }

            let mut sql = format!("SELECT {TASK_COLUMNS} FROM task_records");
            if !clauses.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clauses.join(" AND "));
            }
            sql.push_str(" ORDER BY priority_rank ASC, task_id ASC");
            if let Some(limit) = scan.limit {
                sql.push_str(" LIMIT ?");
                values.push(Value::Integer(to_i64(limit)?));
            }

            let mut statement = connection.prepare(&sql)?;
            let rows = statement.query_map(params_from_iter(values), read_task_row)?;
            rows.collect()
        })
    }

    fn state_counts(&self, run: Option<RunId>) -> PersistenceResult<TaskStateCounts> {
        self.with_connection("state_counts", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT state, COUNT(*)
FROM task_records
WHERE (?1 IS NULL OR run_id = ?1)
GROUP BY state
",
            )?;
            let run_raw = run.map(run_id_to_i64).transpose()?;
            let rows = statement.query_map(params![run_raw], |row| {
                let state_raw: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((parse_task_state(&state_raw)?, count))
            })?;

            let mut counts = TaskStateCounts::default();
            for row in rows {
                let (state, count) = row?;
                counts.add(state, usize::try_from(count).unwrap_or(0));
            }
            Ok(counts)
        })
    }

    fn prune_terminal(&self, older_than: SystemTime) -> PersistenceResult<usize> {
        self.with_connection("prune_terminal", |connection| {
            ensure_schema_ready(connection)?;
            let deleted = connection.execute(
                "
DELETE FROM task_records
WHERE state IN ('completed', 'failed', 'dead')
  AND updated_at_ms < ?1
",
                params![to_unix_millis(older_than)?],
            )?;
            Ok(deleted)
        })
    }
}

impl RunStore for SqliteStore {
    fn create_run(&self, question: &str, started_at: SystemTime) -> PersistenceResult<RunId> {
        self.with_connection("create_run", |connection| {
            ensure_schema_ready(connection)?;
            let started_at_ms = to_unix_millis(started_at)?;
            connection.execute(
                "
INSERT INTO workflow_runs (question, status, started_at_ms, updated_at_ms)
VALUES (?1, ?2, ?3, ?3)
",
                params![question, run_status_to_str(RunStatus::Running), started_at_ms],
            )?;
            Ok(RunId(i64_to_u64(connection.last_insert_rowid())?))
        })
    }

    fn update_run(&self, run: &WorkflowRun) -> PersistenceResult<()> {
        self.with_connection("update_run", |connection| {
            ensure_schema_ready(connection)?;
            let stages = serde_json::to_string(&run.stages)
                .map_err(|error| storage_error_sqlite(&format!("stage encoding: {error}")))?;
            let updated = connection.execute(
                "
UPDATE workflow_runs
SET status = ?2, stages = ?3, elapsed_ms = ?4, updated_at_ms = ?5
WHERE run_id = ?1
",
                params![
                    run_id_to_i64(run.id)?,
                    run_status_to_str(run.status),
                    stages,
                    duration_to_millis(run.elapsed)?,
                    to_unix_millis(SystemTime::now())?,
                ],
            )?;
            if updated == 0 {
                return Err(storage_error_sqlite("run id was not found for update"));
            }
            Ok(())
        })
    }

    fn run_status(&self, run: RunId) -> PersistenceResult<Option<RunStatus>> {
        self.with_connection("run_status", |connection| {
            ensure_schema_ready(connection)?;
            let raw: Option<String> = connection
                .query_row(
                    "SELECT status FROM workflow_runs WHERE run_id = ?1",
                    params![run_id_to_i64(run)?],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|value| parse_run_status(&value)).transpose()
        })
    }
}

impl SqliteStore {
    /// Decoded stage outcomes of a persisted run, in execution order.
    pub fn run_stages(&self, run: RunId) -> PersistenceResult<Vec<StageOutcome>> {
        self.with_connection("run_stages", |connection| {
            ensure_schema_ready(connection)?;
            let raw: Option<String> = connection
                .query_row(
                    "SELECT stages FROM workflow_runs WHERE run_id = ?1",
                    params![run_id_to_i64(run)?],
                    |row| row.get(0),
                )
                .optional()?;
            match raw {
                Some(value) => serde_json::from_str(&value)
                    .map_err(|error| storage_error_sqlite(&format!("stage decoding: {error}"))),
                None => Ok(Vec::new()),
            }
        })
    }
}

impl DocumentStore for SqliteStore {
    fn find_ids(&self, query: &str, max_rows: usize) -> PersistenceResult<Vec<DocumentId>> {
        if max_rows == 0 {
            return Ok(Vec::new());
        }
        let groups = parse_query_expression(query);
        if groups.is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::QueryParseError,
                format!("query expression '{query}' is unbalanced or has no searchable terms"),
            ));
        }

        self.with_connection("find_ids", |connection| {
            ensure_schema_ready(connection)?;
            let mut values: Vec<Value> = Vec::new();
            let mut group_clauses = Vec::new();
            for group in &groups {
                let mut term_clauses = Vec::new();
                for term in group {
                    term_clauses.push(format!(
                        "({FOLD_FUNCTION}(title) LIKE ? ESCAPE '\\' \
                         OR {FOLD_FUNCTION}(abstract) LIKE ? ESCAPE '\\')"
                    ));
                    let pattern = format!("%{}%", escape_like(term));
                    values.push(Value::Text(pattern.clone()));
                    values.push(Value::Text(pattern));
                }
                group_clauses.push(format!("({})", term_clauses.join(" AND ")));
            }
            values.push(Value::Integer(to_i64(max_rows)?));

            let sql = format!(
                "SELECT document_id FROM documents WHERE {} ORDER BY document_id ASC LIMIT ?",
                group_clauses.join(" OR ")
            );
            let mut statement = connection.prepare(&sql)?;
            let rows = statement.query_map(params_from_iter(values), |row| {
                Ok(DocumentId(row.get(0)?))
            })?;
            rows.collect()
        })
    }

    fn fetch_by_ids(
        &self,
        ids: &[DocumentId],
        batch_size: usize,
    ) -> PersistenceResult<Vec<DocumentRecord>> {
        if batch_size == 0 {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "fetch_by_ids batch_size must be greater than zero",
            ));
        }
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        self.with_connection("fetch_by_ids", |connection| {
            ensure_schema_ready(connection)?;
            let mut records = Vec::with_capacity(ids.len());
            for batch in ids.chunks(batch_size) {
                let sql = format!(
                    "
SELECT document_id, title, abstract, authors, publication_year
FROM documents
WHERE document_id IN ({})
",
                    placeholders(batch.len())
                );
                let mut statement = connection.prepare(&sql)?;
                let rows = statement.query_map(
                    params_from_iter(batch.iter().map(|id| id.0)),
                    |row| {
                        Ok(DocumentRecord {
                            id: DocumentId(row.get(0)?),
                            title: row.get(1)?,
                            abstract_text: row.get(2)?,
                            authors: row.get(3)?,
                            year: row.get(4)?,
                        })
                    },
                )?;
                for row in rows {
                    records.push(row?);
                }
            }
            Ok(records)
        })
    }

    fn ping(&self) -> PersistenceResult<()> {
        self.with_connection("ping", |connection| {
            ensure_schema_ready(connection)?;
            connection.query_row("SELECT 1", [], |_| Ok(()))
        })
    }
}

fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for ch in term.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    let connection = Connection::open(database_path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    connection.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
    connection.create_scalar_function(
        FOLD_FUNCTION,
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |context| {
            let text: Option<String> = context.get(0)?;
            Ok(text.map(|text| fold_search_text(&text)))
        },
    )?;
    Ok(connection)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(
        "
CREATE TABLE IF NOT EXISTS lantern_schema_migrations (
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
            "database schema is not initialized; apply migrations before queue operations",
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
    migration(version).ok_or_else(|| {
        storage_error_sqlite(&format!("migration version '{version}' is not defined"))
    })
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.up_sql)?;
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

fn read_task_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let task_id_raw: i64 = row.get(0)?;
    let run_raw: Option<i64> = row.get(1)?;
    let kind_raw: String = row.get(2)?;
    let payload_raw: String = row.get(3)?;
    let priority_raw: i64 = row.get(4)?;
    let state_raw: String = row.get(5)?;
    let attempts_raw: i64 = row.get(6)?;
    let lease_owner: Option<String> = row.get(7)?;
    let lease_expiry_ms: Option<i64> = row.get(8)?;
    let not_before_ms: Option<i64> = row.get(9)?;
    let result_raw: Option<String> = row.get(10)?;
    let error: Option<String> = row.get(11)?;
    let created_at_ms: i64 = row.get(12)?;
    let updated_at_ms: i64 = row.get(13)?;

    let lease = match (lease_owner, lease_expiry_ms) {
        (Some(owner), Some(expiry)) => Some(TaskLease {
            owner,
            expires_at: from_unix_millis(expiry)?,
        }),
        _ => None,
    };

    Ok(TaskRecord {
        id: TaskId(i64_to_u64(task_id_raw)?),
        run: run_raw.map(i64_to_u64).transpose()?.map(RunId),
        kind: parse_task_kind(&kind_raw)?,
        payload: parse_json(&payload_raw)?,
        priority: parse_priority_rank(priority_raw)?,
        state: parse_task_state(&state_raw)?,
        attempts: u32::try_from(attempts_raw)
            .map_err(|_| storage_error_sqlite("attempt counter out of range in sqlite record"))?,
        lease,
        not_before: not_before_ms.map(from_unix_millis).transpose()?,
        result: result_raw.as_deref().map(parse_json).transpose()?,
        error,
        created_at: from_unix_millis(created_at_ms)?,
        updated_at: from_unix_millis(updated_at_ms)?,
    })
}

fn write_task_row(connection: &Connection, record: &TaskRecord) -> rusqlite::Result<()> {
    let result = record
        .result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|error| storage_error_sqlite(&format!("result encoding: {error}")))?;
    let updated = connection.execute(
        "
UPDATE task_records
SET priority_rank = ?2,
    state = ?3,
    attempts = ?4,
    lease_owner = ?5,
    lease_expiry_ms = ?6,
    not_before_ms = ?7,
    result = ?8,
    error = ?9,
    updated_at_ms = ?10
WHERE task_id = ?1
",
        params![
            task_id_to_i64(record.id)?,
            record.priority.rank(),
            task_state_to_str(record.state),
            i64::from(record.attempts),
            record.lease.as_ref().map(|lease| lease.owner.as_str()),
            record
                .lease
                .as_ref()
                .map(|lease| to_unix_millis(lease.expires_at))
                .transpose()?,
            record.not_before.map(to_unix_millis).transpose()?,
            result,
            record.error.as_deref(),
            to_unix_millis(record.updated_at)?,
        ],
    )?;
    if updated == 0 {
        return Err(storage_error_sqlite("task id was not found for update"));
    }
    Ok(())
}

fn parse_json(raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw)
        .map_err(|error| storage_error_sqlite(&format!("invalid json in sqlite record: {error}")))
}

fn task_kind_to_str(value: TaskKind) -> &'static str {
    match value {
        TaskKind::QueryGeneration => "query_generation",
        TaskKind::RelevanceScoring => "relevance_scoring",
        TaskKind::CitationExtraction => "citation_extraction",
        TaskKind::ReportSynthesis => "report_synthesis",
        TaskKind::CounterfactualAnalysis => "counterfactual_analysis",
    }
}

fn parse_task_kind(raw: &str) -> rusqlite::Result<TaskKind> {
    match raw {
        "query_generation" => Ok(TaskKind::QueryGeneration),
        "relevance_scoring" => Ok(TaskKind::RelevanceScoring),
        "citation_extraction" => Ok(TaskKind::CitationExtraction),
        "report_synthesis" => Ok(TaskKind::ReportSynthesis),
        "counterfactual_analysis" => Ok(TaskKind::CounterfactualAnalysis),
        _ => Err(storage_error_sqlite(&format!(
            "unknown task kind '{raw}' in sqlite record"
        ))),
    }
}

fn task_state_to_str(value: TaskState) -> &'static str {
    match value {
        TaskState::Pending => "pending",
        TaskState::Leased => "leased",
        TaskState::Completed => "completed",
        TaskState::Failed => "failed",
        TaskState::Dead => "dead",
    }
}

fn parse_task_state(raw: &str) -> rusqlite::Result<TaskState> {
    match raw {
        "pending" => Ok(TaskState::Pending),
        "leased" => Ok(TaskState::Leased),
        "completed" => Ok(TaskState::Completed),
        "failed" => Ok(TaskState::Failed),
        "dead" => Ok(TaskState::Dead),
        _ => Err(storage_error_sqlite(&format!(
            "unknown task state '{raw}' in sqlite record"
        ))),
    }
}

fn parse_priority_rank(raw: i64) -> rusqlite::Result<TaskPriority> {
    match raw {
        0 => Ok(TaskPriority::High),
        1 => Ok(TaskPriority::Normal),
        2 => Ok(TaskPriority::Low),
        _ => Err(storage_error_sqlite(&format!(
            "unknown priority rank '{raw}' in sqlite record"
        ))),
    }
}

fn run_status_to_str(value: RunStatus) -> &'static str {
    match value {
        RunStatus::Running => "running",
        RunStatus::Succeeded => "succeeded",
        RunStatus::Partial => "partial",
        RunStatus::Failed => "failed",
    }
}

fn parse_run_status(raw: &str) -> rusqlite::Result<RunStatus> {
    match raw {
        "running" => Ok(RunStatus::Running),
        "succeeded" => Ok(RunStatus::Succeeded),
        "partial" => Ok(RunStatus::Partial),
        "failed" => Ok(RunStatus::Failed),
        _ => Err(storage_error_sqlite(&format!(
            "unknown run status '{raw}' in sqlite record"
        ))),
    }
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    let busy = matches!(
        error.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    );
    let mut core = storage_error_text(operation, error.to_string());
    if busy {
        core.kind = CoreErrorKind::StoreUnavailable;
    }
    core
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn to_unix_millis(value: SystemTime) -> rusqlite::Result<i64> {
    let duration = value.duration_since(UNIX_EPOCH).map_err(|error| {
        storage_error_sqlite(&format!("time before unix epoch is not supported: {error}"))
    })?;
    duration_to_millis(duration)
}

fn duration_to_millis(value: Duration) -> rusqlite::Result<i64> {
    i64::try_from(value.as_millis())
        .map_err(|_| storage_error_sqlite("millisecond value exceeds i64 range"))
}

fn from_unix_millis(value: i64) -> rusqlite::Result<SystemTime> {
    let millis = u64::try_from(value)
        .map_err(|_| storage_error_sqlite("negative unix timestamps are not supported"))?;
    Ok(UNIX_EPOCH + Duration::from_millis(millis))
}

fn task_id_to_i64(value: TaskId) -> rusqlite::Result<i64> {
    i64::try_from(value.0).map_err(|_| storage_error_sqlite("task id exceeds i64 range"))
}

fn run_id_to_i64(value: RunId) -> rusqlite::Result<i64> {
    i64::try_from(value.0).map_err(|_| storage_error_sqlite("run id exceeds i64 range"))
}

fn i64_to_u64(value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| storage_error_sqlite("negative id in sqlite record"))
}

fn to_i64(value: usize) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| storage_error_sqlite("value exceeds i64 range"))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    )
}
