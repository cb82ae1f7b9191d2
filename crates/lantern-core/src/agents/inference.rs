use std::sync::Arc;
use std::time::Duration;

use crate::agents::{AgentDescriptor, AgentResult, CancelHandle};
use crate::models::{CoreError, CoreErrorKind, TaskId};

const PING_PROMPT: &str = "Reply with the single word: ready";
const PING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum InferenceErrorKind {
    Unavailable,
    Timeout,
    Malformed,
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct InferenceError {
    pub kind: InferenceErrorKind,
    pub message: String,
}

impl InferenceError {
    pub fn new(kind: InferenceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn into_core(self, model: &str) -> CoreError {
        let kind = match self.kind {
            InferenceErrorKind::Unavailable => CoreErrorKind::ModelUnavailable,
            InferenceErrorKind::Timeout => CoreErrorKind::InferenceTimeout,
            InferenceErrorKind::Malformed => CoreErrorKind::QueryParseError,
        };
        CoreError::new(kind, format!("model '{model}': {}", self.message)).for_model(model)
    }
}

#[derive(Clone, Debug)]
pub struct InferenceRequest<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub timeout: Duration,
    pub handle: &'a CancelHandle,
}

/// The shared local inference backend. Callers must not invoke it concurrently; the
/// orchestrator's inference gate guarantees that.
pub trait InferenceBackend: Send + Sync {
    fn invoke(&self, request: &InferenceRequest<'_>) -> Result<String, InferenceError>;

    fn ping(&self, model: &str) -> Result<(), InferenceError> {
        let handle = CancelHandle::new(TaskId(0));
        self.invoke(&InferenceRequest {
            model,
            prompt: PING_PROMPT,
            timeout: PING_TIMEOUT,
            handle: &handle,
        })
        .map(|_| ())
    }

    fn supports_cancel(&self) -> bool {
        false
    }

    fn cancel(&self, _handle: &CancelHandle) -> bool {
        false
    }
}

/// A backend plus the model and timeout one agent uses for its calls.
#[derive(Clone)]
pub struct ModelBinding {
    backend: Arc<dyn InferenceBackend>,
    model: String,
    timeout: Duration,
}

impl ModelBinding {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            model: model.into(),
            timeout,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn backend(&self) -> &dyn InferenceBackend {
        self.backend.as_ref()
    }

    pub fn invoke(&self, prompt: &str, handle: &CancelHandle) -> Result<String, CoreError> {
        invoke_model(self.backend.as_ref(), &self.model, prompt, self.timeout, handle)
    }

    /// Like `invoke`, but malformed output is classified as a retryable agent failure.
    pub fn invoke_recoverable(
        &self,
        prompt: &str,
        handle: &CancelHandle,
    ) -> Result<String, CoreError> {
        self.invoke(prompt, handle).map_err(recoverable_parse)
    }

    pub fn ping(&self) -> Result<(), CoreError> {
        self.backend
            .ping(&self.model)
            .map_err(|error| error.into_core(&self.model))
    }
}

pub fn invoke_model(
    backend: &dyn InferenceBackend,
    model: &str,
    prompt: &str,
    timeout: Duration,
    handle: &CancelHandle,
) -> Result<String, CoreError> {
    if handle.is_cancel_requested() {
        return Err(CoreError::new(
            CoreErrorKind::Cancelled,
            format!("task '{}' cancelled before inference", handle.task_id().0),
        ));
    }
    backend
        .invoke(&InferenceRequest {
            model,
            prompt,
            timeout,
            handle,
        })
        .map_err(|error| error.into_core(model))
}

pub(crate) fn recoverable_parse(error: CoreError) -> CoreError {
    if error.kind == CoreErrorKind::QueryParseError {
        CoreError {
            kind: CoreErrorKind::AgentFailure,
            ..error
        }
    } else {
        error
    }
}

pub(crate) fn cancel_through(
    backend: &dyn InferenceBackend,
    descriptor: &AgentDescriptor,
    handle: &CancelHandle,
) -> AgentResult<()> {
    handle.request_cancel();
    if backend.supports_cancel() && backend.cancel(handle) {
        return Ok(());
    }
    Err(CoreError::new(
        CoreErrorKind::Cancelled,
        format!(
            "agent '{}' could not abort task '{}'; waiting for the call to finish",
            descriptor.name,
            handle.task_id().0
        ),
    )
    .for_task(descriptor.kind))
}

pub(crate) fn first_nonempty_line(output: &str) -> Option<&str> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with("```"))
}
