pub mod cancellation;
pub mod engine;
pub mod gates;
pub mod progress;
pub mod queue;
pub mod worker;

pub use cancellation::RunCancellation;
pub use engine::{Orchestrator, OrchestratorContext, WorkflowOutcome};
pub use gates::{ResourceClass, ResourceGates};
pub use progress::{ProgressSink, TracingProgress, tracing_progress};
pub use queue::{FailDisposition, QueueManager, ReapReport, RetryPolicy};
pub use worker::{StageReport, drive_tasks};

use crate::models::CoreError;

pub type OrchestrationResult<T> = Result<T, CoreError>;
