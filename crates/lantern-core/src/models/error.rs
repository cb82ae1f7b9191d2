use crate::models::TaskKind;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CoreErrorKind {
    ModelUnavailable,
    QueryParseError,
    InferenceTimeout,
    StoreTimeout,
    StoreUnavailable,
    LeaseLost,
    FatalConfig,
    InvalidInput,
    NotFound,
    Cancelled,
    StorageFailure,
    AgentFailure,
    Internal,
}

impl CoreErrorKind {
    /// Whether a task failing with this kind goes back to the queue for another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::InferenceTimeout
                | Self::StoreTimeout
                | Self::StoreUnavailable
                | Self::AgentFailure
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub task: Option<TaskKind>,
    pub model: Option<String>,
    pub kind: CoreErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            task: None,
            model: None,
            kind,
            message: message.into(),
        }
    }

    pub fn for_task(mut self, task: TaskKind) -> Self {
        self.task = self.task.or(Some(task));
        self
    }

    pub fn for_model(mut self, model: impl Into<String>) -> Self {
        if self.model.is_none() {
            self.model = Some(model.into());
        }
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

pub(crate) fn config_error(message: impl Into<String>) -> CoreError {
    CoreError::new(CoreErrorKind::FatalConfig, message)
}

pub(crate) fn internal_error(message: impl Into<String>) -> CoreError {
    CoreError::new(CoreErrorKind::Internal, message)
}
