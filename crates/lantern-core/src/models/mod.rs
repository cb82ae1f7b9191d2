pub mod document;
pub mod error;
pub mod query;
pub mod task;
pub mod workflow;

pub use document::{DocumentId, DocumentIdSet, DocumentRecord};
pub use error::{CoreError, CoreErrorKind};
pub use query::{MultiModelQueryResult, QueryGenerationResult};
pub use task::{
    NewTask, RunId, TaskId, TaskKind, TaskLease, TaskPriority, TaskRecord, TaskState,
    TaskStateCounts,
};
pub use workflow::{PipelineStage, RunStatus, StageOutcome, StageStatus, WorkflowRun};
