use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};

use crate::agents::{AgentRequest, CancelHandle, execute_with_kind_check};
use crate::models::error::internal_error;
use crate::models::{
    CoreError, CoreErrorKind, PipelineStage, TaskId, TaskKind, TaskRecord, TaskState,
};
use crate::orchestration::engine::OrchestratorContext;
use crate::orchestration::gates::ResourceClass;
use crate::orchestration::progress::fraction;
use crate::orchestration::queue::FailDisposition;
use crate::orchestration::{OrchestrationResult, RunCancellation};
use crate::persistence::PersistenceResult;

static WORKER_SEQUENCE: AtomicUsize = AtomicUsize::new(0);

/// Terminal records of one driven batch, in the order the batch was enqueued.
#[derive(Clone, Debug, Default)]
pub struct StageReport {
    pub stage: Option<PipelineStage>,
    pub records: Vec<TaskRecord>,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl StageReport {
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.records.iter().map(|record| record.id).collect()
    }

    pub fn completed(&self) -> impl Iterator<Item = &TaskRecord> {
        self.records
            .iter()
            .filter(|record| record.state == TaskState::Completed)
    }

    pub fn completed_count(&self) -> usize {
        self.completed().count()
    }

    pub fn dead_count(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.state == TaskState::Dead)
            .count()
    }

    /// Error text of the first task that did not complete.
    pub fn first_error(&self) -> Option<&str> {
        self.records
            .iter()
            .filter(|record| record.state != TaskState::Completed)
            .find_map(|record| record.error.as_deref())
    }
}

/// Runs `operation` on the blocking pool; stores and agents are synchronous.
pub(crate) async fn run_blocking<T, F>(operation: F) -> OrchestrationResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> OrchestrationResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .map_err(|join_error| internal_error(format!("blocking task join failure: {join_error}")))?
}

/// One store call under the store gate, bounded by the store timeout and retried with the
/// queue's backoff policy while the failure is retryable.
pub(crate) async fn store_call<T, F>(
    ctx: &OrchestratorContext,
    operation_name: &str,
    operation: F,
) -> OrchestrationResult<T>
where
    T: Send + 'static,
    F: Fn() -> PersistenceResult<T> + Clone + Send + 'static,
{
    let policy = ctx.queue.policy().clone();
    let limit = ctx.config.orchestrator.store_timeout();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let permit = ctx.gates.acquire(ResourceClass::Store).await?;
        let call = operation.clone();
        let joined = timeout(
            limit,
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                call()
            }),
        )
        .await;

        let result = match joined {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(internal_error(format!(
                "store call '{operation_name}' join failure: {join_error}"
            ))),
            Err(_) => Err(CoreError::new(
                CoreErrorKind::StoreTimeout,
                format!(
                    "store call '{operation_name}' exceeded {} ms",
                    limit.as_millis()
                ),
            )),
        };

        match result {
            Err(error) if error.is_retryable() && policy.allows_retry(attempt) => {
                let delay = policy.backoff_for(attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    kind = ?error.kind,
                    message = %error.message,
                    "store call failed; retrying"
                );
                sleep(delay).await;
            }
            other => return other,
        }
    }
}

/// Drives an enqueued batch to terminal states with a bounded worker pool.
///
/// Workers lease only `stage`'s task kind. The driver reaps expired leases on every poll
/// tick and, once `cancellation` fires, abandons tasks that have not started.
pub async fn drive_tasks(
    ctx: &OrchestratorContext,
    stage: PipelineStage,
    task_ids: Vec<TaskId>,
    cancellation: &RunCancellation,
) -> OrchestrationResult<StageReport> {
    let started = Instant::now();
    if task_ids.is_empty() {
        return Ok(StageReport {
            stage: Some(stage),
            ..StageReport::default()
        });
    }

    let kind = stage.task_kind();
    let total = task_ids.len();
    let owned: Arc<HashSet<TaskId>> = Arc::new(task_ids.iter().copied().collect());
    let finished = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));
    let (failures, mut failure_rx) = mpsc::unbounded_channel::<CoreError>();

    let pool_size = ctx.config.orchestrator.worker_concurrency.min(total).max(1);
    let mut workers = JoinSet::new();
    for _ in 0..pool_size {
        let worker = StageWorker {
            id: format!(
                "{}-worker-{}",
                stage.as_str(),
                WORKER_SEQUENCE.fetch_add(1, Ordering::Relaxed)
            ),
            ctx: ctx.clone(),
            stage,
            kind,
            total,
            owned: owned.clone(),
            finished: finished.clone(),
            stop: stop.clone(),
            cancellation: cancellation.clone(),
        };
        let failures = failures.clone();
        workers.spawn(async move {
            if let Err(error) = worker.run().await {
                let _ = failures.send(error);
            }
        });
    }
    drop(failures);

    let poll_interval = ctx.config.orchestrator.poll_interval();
    let outcome = loop {
        tokio::select! {
            _ = sleep(poll_interval) => {}
            _ = cancellation.cancelled(), if !cancellation.is_cancelled() => {}
        }

        if let Ok(error) = failure_rx.try_recv() {
            break Err(error);
        }

        let queue = ctx.queue.clone();
        if let Err(error) = run_blocking(move || queue.reap_expired()).await {
            tracing::warn!(
                stage = stage.as_str(),
                kind = ?error.kind,
                message = %error.message,
                "failed to reap expired leases"
            );
        }

        if cancellation.is_cancelled() {
            let queue = ctx.queue.clone();
            let pending = task_ids.clone();
            let abandoned = run_blocking(move || -> OrchestrationResult<usize> {
                let mut abandoned = 0;
                for task_id in pending {
                    if queue.cancel_pending(task_id)? {
                        abandoned += 1;
                    }
                }
                Ok(abandoned)
            })
            .await;
            match abandoned {
                Ok(count) if count > 0 => {
                    finished.fetch_add(count, Ordering::SeqCst);
                    tracing::info!(stage = stage.as_str(), count, "cancelled pending tasks");
                }
                Ok(_) => {}
                Err(error) if error.is_retryable() => {}
                Err(error) => break Err(error),
            }
        }

        let queue = ctx.queue.clone();
        let watched = task_ids.clone();
        let snapshot = run_blocking(move || -> OrchestrationResult<Vec<TaskRecord>> {
            watched.iter().map(|id| queue.get(*id)).collect()
        })
        .await;
        match snapshot {
            Ok(records) => {
                if records.iter().all(|record| record.state.is_terminal()) {
                    break Ok(records);
                }
            }
            Err(error) if error.is_retryable() => {
                tracing::warn!(
                    stage = stage.as_str(),
                    message = %error.message,
                    "task snapshot failed; retrying on next tick"
                );
            }
            Err(error) => break Err(error),
        }
    };

    stop.store(true, Ordering::SeqCst);
    while workers.join_next().await.is_some() {}

    let records = outcome?;
    let report = StageReport {
        stage: Some(stage),
        records,
        cancelled: cancellation.is_cancelled(),
        elapsed: started.elapsed(),
    };
    tracing::info!(
        stage = stage.as_str(),
        total,
        completed = report.completed_count(),
        dead = report.dead_count(),
        cancelled = report.cancelled,
        "stage tasks terminal"
    );
    Ok(report)
}

struct StageWorker {
    id: String,
    ctx: OrchestratorContext,
    stage: PipelineStage,
    kind: TaskKind,
    total: usize,
    owned: Arc<HashSet<TaskId>>,
    finished: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    cancellation: RunCancellation,
}

impl StageWorker {
    async fn run(self) -> OrchestrationResult<()> {
        let lease_duration = self.ctx.config.queue.lease_duration();
        let poll_interval = self.ctx.config.orchestrator.poll_interval();

        while !self.stop.load(Ordering::SeqCst) && !self.cancellation.is_cancelled() {
            let queue = self.ctx.queue.clone();
            let worker_id = self.id.clone();
            let kind = self.kind;
            let leased =
                run_blocking(move || queue.lease(&worker_id, lease_duration, &[kind])).await;

            match leased {
                Ok(Some(record)) => self.process(record).await?,
                Ok(None) => sleep(poll_interval).await,
                Err(error) if error.is_retryable() => {
                    tracing::warn!(
                        worker = %self.id,
                        message = %error.message,
                        "lease attempt failed; backing off"
                    );
                    sleep(poll_interval).await;
                }
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    async fn process(&self, record: TaskRecord) -> OrchestrationResult<()> {
        let task_id = record.id;
        let outcome = self.execute(&record).await;

        let queue = self.ctx.queue.clone();
        let worker_id = self.id.clone();
        let (terminal, message) = match outcome {
            Ok(output) => {
                let completed =
                    run_blocking(move || queue.complete(task_id, &worker_id, output)).await;
                match completed {
                    Ok(_) => (true, format!("task {} completed", task_id.0)),
                    Err(error) if error.kind == CoreErrorKind::LeaseLost => return Ok(()),
                    Err(error) => return Err(error),
                }
            }
            Err(error)
                if error.kind == CoreErrorKind::Cancelled && self.cancellation.is_cancelled() =>
            {
                let abandoned =
                    run_blocking(move || queue.abandon(task_id, &worker_id, "cancelled")).await;
                match abandoned {
                    Ok(_) => (true, format!("task {} cancelled", task_id.0)),
                    Err(error) if error.kind == CoreErrorKind::LeaseLost => return Ok(()),
                    Err(error) => return Err(error),
                }
            }
            Err(error) => {
                tracing::warn!(
                    task_id = task_id.0,
                    kind = ?record.kind,
                    worker = %self.id,
                    attempt = record.attempts,
                    error_kind = ?error.kind,
                    model = ?error.model,
                    message = %error.message,
                    "agent execution failed"
                );
                let retryable = error.is_retryable();
                let text = error.to_string();
                let failed =
                    run_blocking(move || queue.fail(task_id, &worker_id, &text, retryable)).await;
                match failed {
                    Ok(FailDisposition::Dead { .. }) => {
                        (true, format!("task {} dead after {:?}", task_id.0, error.kind))
                    }
                    Ok(FailDisposition::Retrying { attempts, .. }) => (
                        false,
                        format!("task {} retrying after attempt {attempts}", task_id.0),
                    ),
                    Err(error) if error.kind == CoreErrorKind::LeaseLost => return Ok(()),
                    Err(error) => return Err(error),
                }
            }
        };

        let done = if terminal && self.owned.contains(&task_id) {
            self.finished.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.finished.load(Ordering::SeqCst)
        };
        self.ctx
            .progress
            .on_progress(self.stage.as_str(), fraction(done, self.total), &message);
        Ok(())
    }

    /// Executes the leased task through the gate for its resource class. The permit moves
    /// into the blocking call, so a timed-out call keeps the gate until it actually returns.
    async fn execute(&self, record: &TaskRecord) -> OrchestrationResult<serde_json::Value> {
        let agent = self.ctx.registry.agent(record.kind)?;
        let class = ResourceClass::of(record.kind);
        let limit = match class {
            ResourceClass::Inference => self.ctx.config.orchestrator.inference_timeout(),
            ResourceClass::Store => self.ctx.config.orchestrator.store_timeout(),
        };

        let permit = self.ctx.gates.acquire(class).await?;
        let handle = CancelHandle::new(record.id);
        let request = AgentRequest {
            task_id: record.id,
            kind: record.kind,
            payload: record.payload.clone(),
            attempt: record.attempts,
            handle: handle.clone(),
        };
        let call_agent = agent.clone();
        let call = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            execute_with_kind_check(call_agent.as_ref(), &request)
        });
        let call = timeout(limit, call);
        tokio::pin!(call);

        let joined = if agent.supports_cancel() {
            tokio::select! {
                joined = &mut call => joined,
                _ = self.cancellation.cancelled() => {
                    if let Err(error) = agent.cancel(&handle) {
                        tracing::warn!(
                            task_id = record.id.0,
                            message = %error.message,
                            "best-effort cancel failed; waiting for the call"
                        );
                    }
                    call.await
                }
            }
        } else {
            call.await
        };

        match joined {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(internal_error(format!(
                "agent call for task '{}' join failure: {join_error}",
                record.id.0
            ))
            .for_task(record.kind)),
            Err(_) => {
                handle.request_cancel();
                let kind = match class {
                    ResourceClass::Inference => CoreErrorKind::InferenceTimeout,
                    ResourceClass::Store => CoreErrorKind::StoreTimeout,
                };
                Err(CoreError::new(
                    kind,
                    format!(
                        "task '{}' exceeded its {} ms timeout",
                        record.id.0,
                        limit.as_millis()
                    ),
                )
                .for_task(record.kind))
            }
        }
    }
}
