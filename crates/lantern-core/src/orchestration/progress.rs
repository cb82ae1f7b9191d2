use std::sync::Arc;

/// Receives `(stage, fraction, message)` at least once per task completion.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, stage: &str, fraction: f64, message: &str);
}

impl<F> ProgressSink for F
where
    F: Fn(&str, f64, &str) + Send + Sync,
{
    fn on_progress(&self, stage: &str, fraction: f64, message: &str) {
        self(stage, fraction, message)
    }
}

pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn on_progress(&self, stage: &str, fraction: f64, message: &str) {
        tracing::info!(stage, fraction, message, "progress");
    }
}

pub fn tracing_progress() -> Arc<dyn ProgressSink> {
    Arc::new(TracingProgress)
}

pub(crate) fn fraction(done: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        (done as f64 / total as f64).clamp(0.0, 1.0)
    }
}
