use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::models::{CoreError, CoreErrorKind, TaskId, TaskKind};

pub type AgentResult<T> = Result<T, CoreError>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AgentDescriptor {
    pub kind: TaskKind,
    pub name: &'static str,
}

/// Identifies one in-flight call so it can be aborted best-effort.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    task_id: TaskId,
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn request_cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
pub struct AgentRequest {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    pub attempt: u32,
    pub handle: CancelHandle,
}

impl AgentRequest {
    pub fn decode<T: DeserializeOwned>(&self) -> AgentResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(|error| {
            CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("task '{}' payload is not valid: {error}", self.task_id.0),
            )
            .for_task(self.kind)
        })
    }
}

/// Processing stage contract. Agents hold no queue state: any instance can execute any task
/// of its kind.
pub trait Agent: Send + Sync {
    fn descriptor(&self) -> &AgentDescriptor;

    fn execute(&self, request: &AgentRequest) -> AgentResult<serde_json::Value>;

    fn test_connection(&self) -> AgentResult<()>;

    fn supports_cancel(&self) -> bool {
        false
    }

    fn cancel(&self, handle: &CancelHandle) -> AgentResult<()> {
        Err(CoreError::new(
            CoreErrorKind::InvalidInput,
            format!(
                "agent '{}' cannot cancel task '{}'",
                self.descriptor().name,
                handle.task_id().0
            ),
        )
        .for_task(self.descriptor().kind))
    }
}

pub fn ensure_kind_supported(agent: &dyn Agent, kind: TaskKind) -> AgentResult<()> {
    let descriptor = agent.descriptor();
    if descriptor.kind == kind {
        return Ok(());
    }
    Err(CoreError::new(
        CoreErrorKind::InvalidInput,
        format!(
            "agent '{}' handles {:?} tasks, not {kind:?}",
            descriptor.name, descriptor.kind
        ),
    )
    .for_task(kind))
}

pub fn execute_with_kind_check(
    agent: &dyn Agent,
    request: &AgentRequest,
) -> AgentResult<serde_json::Value> {
    ensure_kind_supported(agent, request.kind)?;
    agent
        .execute(request)
        .map_err(|error| error.for_task(request.kind))
}

pub(crate) fn encode_output<T: Serialize>(
    kind: TaskKind,
    output: &T,
) -> AgentResult<serde_json::Value> {
    serde_json::to_value(output).map_err(|error| {
        CoreError::new(
            CoreErrorKind::Internal,
            format!("failed to encode {kind:?} output: {error}"),
        )
        .for_task(kind)
    })
}
