use std::time::SystemTime;

use crate::models::{
    CoreError, DocumentId, DocumentRecord, NewTask, RunId, RunStatus, TaskId, TaskKind,
    TaskRecord, TaskState, TaskStateCounts, WorkflowRun,
};

pub type PersistenceResult<T> = Result<T, CoreError>;

/// Applied inside the store's write transaction; returning an error rolls the update back.
pub type TaskMutation<'a> = &'a mut dyn FnMut(&mut TaskRecord) -> PersistenceResult<()>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

/// Selection over task records. Empty `states`/`kinds` match everything.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TaskScan {
    pub states: Vec<TaskState>,
    pub kinds: Vec<TaskKind>,
    pub run: Option<RunId>,
    pub limit: Option<usize>,
}

impl TaskScan {
    pub fn in_states(states: impl IntoIterator<Item = TaskState>) -> Self {
        Self {
            states: states.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = TaskKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    pub fn run(mut self, run: RunId) -> Self {
        self.run = Some(run);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Durable task log. Every operation is atomic with respect to concurrent callers, and
/// `scan` returns records ordered by priority tier, then insertion order.
pub trait TaskStore: Send + Sync {
    fn append(&self, task: &NewTask) -> PersistenceResult<TaskRecord>;

    fn update(&self, task_id: TaskId, mutation: TaskMutation<'_>)
    -> PersistenceResult<TaskRecord>;

    fn get(&self, task_id: TaskId) -> PersistenceResult<Option<TaskRecord>>;

    fn scan(&self, scan: &TaskScan) -> PersistenceResult<Vec<TaskRecord>>;

    fn state_counts(&self, run: Option<RunId>) -> PersistenceResult<TaskStateCounts>;

    fn prune_terminal(&self, older_than: SystemTime) -> PersistenceResult<usize>;
}

pub trait RunStore: Send + Sync {
    fn create_run(&self, question: &str, started_at: SystemTime) -> PersistenceResult<RunId>;

    fn update_run(&self, run: &WorkflowRun) -> PersistenceResult<()>;

    fn run_status(&self, run: RunId) -> PersistenceResult<Option<RunStatus>>;
}

/// The relational literature store: id-only search plus one bulk fetch.
pub trait DocumentStore: Send + Sync {
    fn find_ids(&self, query: &str, max_rows: usize) -> PersistenceResult<Vec<DocumentId>>;

    /// Unknown ids are skipped; ordering of the returned records is unspecified.
    fn fetch_by_ids(
        &self,
        ids: &[DocumentId],
        batch_size: usize,
    ) -> PersistenceResult<Vec<DocumentRecord>>;

    fn ping(&self) -> PersistenceResult<()>;
}
