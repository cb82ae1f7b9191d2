use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::config::QueueConfig;
use crate::models::{
    CoreError, CoreErrorKind, NewTask, RunId, TaskId, TaskKind, TaskLease, TaskPriority,
    TaskRecord, TaskState, TaskStateCounts,
};
use crate::orchestration::OrchestrationResult;
use crate::persistence::{TaskScan, TaskStore};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempts` (1-based) becomes eligible: `base * 2^(n-1)`, capped.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for RetryPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FailDisposition {
    Retrying { attempts: u32, not_before: SystemTime },
    Dead { attempts: u32 },
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReapReport {
    pub requeued: Vec<TaskId>,
    pub dead: Vec<TaskId>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.dead.is_empty()
    }
}

/// Sole owner of task state transitions. Every transition is a compare-and-set executed
/// inside the store's write transaction, so concurrent workers never share a lease.
#[derive(Clone)]
pub struct QueueManager {
    store: Arc<dyn TaskStore>,
    policy: RetryPolicy,
}

impl QueueManager {
    pub fn new(store: Arc<dyn TaskStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn enqueue(
        &self,
        kind: TaskKind,
        payload: serde_json::Value,
        priority: TaskPriority,
    ) -> OrchestrationResult<TaskId> {
        self.enqueue_for_run(None, kind, payload, priority)
    }

    pub fn enqueue_for_run(
        &self,
        run: Option<RunId>,
        kind: TaskKind,
        payload: serde_json::Value,
        priority: TaskPriority,
    ) -> OrchestrationResult<TaskId> {
        let record = self.store.append(&NewTask {
            run,
            kind,
            payload,
            priority,
            created_at: SystemTime::now(),
        })?;
        tracing::debug!(task_id = record.id.0, kind = ?kind, priority = ?priority, "task enqueued");
        Ok(record.id)
    }

    /// Leases the oldest eligible task of the highest eligible priority tier. A task is
    /// eligible when it is pending and past its backoff, or leased with an expired lease.
    pub fn lease(
        &self,
        worker_id: &str,
        lease_duration: Duration,
        kinds: &[TaskKind],
    ) -> OrchestrationResult<Option<TaskRecord>> {
        let scan = TaskScan::in_states([TaskState::Pending, TaskState::Leased])
            .kinds(kinds.iter().copied());
        let now = SystemTime::now();
        let candidates = self
            .store
            .scan(&scan)?
            .into_iter()
            .filter(|record| record.is_leasable_at(now));

        for candidate in candidates {
            let max_attempts = self.policy.max_attempts;
            let attempt = self.store.update(candidate.id, &mut |record| {
                let now = SystemTime::now();
                if !record.is_leasable_at(now) {
                    return Err(lease_lost(record.id, "task was claimed by another worker"));
                }
                if record.attempts >= max_attempts {
                    record.state = TaskState::Dead;
                    record.lease = None;
                    record.error = Some(format!(
                        "lease expired after {} of {max_attempts} attempts",
                        record.attempts
                    ));
                    return Ok(());
                }
                record.state = TaskState::Leased;
                record.attempts += 1;
                record.not_before = None;
                record.lease = Some(TaskLease {
                    owner: worker_id.to_string(),
                    expires_at: now + lease_duration,
                });
                Ok(())
            });

            match attempt {
                Ok(record) if record.state == TaskState::Leased => {
                    tracing::debug!(
                        task_id = record.id.0,
                        kind = ?record.kind,
                        worker = worker_id,
                        attempts = record.attempts,
                        "task leased"
                    );
                    return Ok(Some(record));
                }
                Ok(record) => {
                    tracing::warn!(
                        task_id = record.id.0,
                        kind = ?record.kind,
                        attempts = record.attempts,
                        "expired lease exhausted retry budget; task dead-lettered"
                    );
                }
                Err(error) if error.kind == CoreErrorKind::LeaseLost => continue,
                Err(error) => return Err(error),
            }
        }

        Ok(None)
    }

    pub fn complete(
        &self,
        task_id: TaskId,
        worker_id: &str,
        result: serde_json::Value,
    ) -> OrchestrationResult<TaskRecord> {
        let completed = self.store.update(task_id, &mut |record| {
            ensure_lease_held(record, worker_id)?;
            record.state = TaskState::Completed;
            record.lease = None;
            record.error = None;
            record.result = Some(result.clone());
            Ok(())
        });
        log_lease_lost(&completed, task_id, worker_id, "complete");
        completed
    }

    pub fn fail(
        &self,
        task_id: TaskId,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> OrchestrationResult<FailDisposition> {
        let policy = self.policy.clone();
        let mut disposition = None;
        let failed = self.store.update(task_id, &mut |record| {
            ensure_lease_held(record, worker_id)?;
            record.lease = None;
            record.error = Some(error.to_string());
            if retryable && policy.allows_retry(record.attempts) {
                let not_before = SystemTime::now() + policy.backoff_for(record.attempts);
                record.state = TaskState::Pending;
                record.not_before = Some(not_before);
                disposition = Some(FailDisposition::Retrying {
                    attempts: record.attempts,
                    not_before,
                });
            } else {
                record.state = TaskState::Dead;
                record.not_before = None;
                disposition = Some(FailDisposition::Dead {
                    attempts: record.attempts,
                });
            }
            Ok(())
        });
        log_lease_lost(&failed, task_id, worker_id, "fail");
        let record = failed?;

        let disposition = disposition.ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("task '{}' failed without a recorded disposition", task_id.0),
            )
        })?;
        if let FailDisposition::Dead { attempts } = disposition {
            tracing::warn!(
                task_id = task_id.0,
                kind = ?record.kind,
                attempts,
                retryable,
                error,
                "task dead-lettered"
            );
        }
        Ok(disposition)
    }

    /// Returns expired leases to the queue. Driven by the orchestrator loop, never by workers.
    pub fn reap_expired(&self) -> OrchestrationResult<ReapReport> {
        let now = SystemTime::now();
        let expired: Vec<TaskId> = self
            .store
            .scan(&TaskScan::in_states([TaskState::Leased]))?
            .into_iter()
            .filter(|record| record.lease.as_ref().is_none_or(|l| l.is_expired_at(now)))
            .map(|record| record.id)
            .collect();

        let mut report = ReapReport::default();
        for task_id in expired {
            let max_attempts = self.policy.max_attempts;
            let reaped = self.store.update(task_id, &mut |record| {
                let now = SystemTime::now();
                let still_expired = record.state == TaskState::Leased
                    && record.lease.as_ref().is_none_or(|l| l.is_expired_at(now));
                if !still_expired {
                    return Err(lease_lost(record.id, "lease was renewed or released"));
                }
                let previous_owner = record.lease_owner().unwrap_or("unknown").to_string();
                record.lease = None;
                if record.attempts >= max_attempts {
                    record.state = TaskState::Dead;
                    record.error = Some(format!(
                        "lease held by '{previous_owner}' expired after {} of {max_attempts} \
                         attempts",
                        record.attempts
                    ));
                } else {
                    record.state = TaskState::Pending;
                    record.not_before = None;
                }
                Ok(())
            });

            match reaped {
                Ok(record) if record.state == TaskState::Dead => report.dead.push(task_id),
                Ok(_) => report.requeued.push(task_id),
                Err(error) if error.kind == CoreErrorKind::LeaseLost => {}
                Err(error) => return Err(error),
            }
        }

        if !report.is_empty() {
            tracing::info!(
                requeued = report.requeued.len(),
                dead = report.dead.len(),
                "reaped expired leases"
            );
        }
        Ok(report)
    }

    /// Abandons a task that has not started; leased or terminal tasks are left alone.
    pub fn cancel_pending(&self, task_id: TaskId) -> OrchestrationResult<bool> {
        let cancelled = self.store.update(task_id, &mut |record| {
            if record.state != TaskState::Pending {
                return Err(lease_lost(record.id, "task is no longer pending"));
            }
            record.state = TaskState::Failed;
            record.not_before = None;
            record.error = Some("cancelled".to_string());
            Ok(())
        });
        match cancelled {
            Ok(_) => Ok(true),
            Err(error) if error.kind == CoreErrorKind::LeaseLost => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Releases a lease without retrying: the task ends FAILED. Used when the run that owns
    /// the task was cancelled while the call was in flight.
    pub fn abandon(
        &self,
        task_id: TaskId,
        worker_id: &str,
        reason: &str,
    ) -> OrchestrationResult<TaskRecord> {
        let abandoned = self.store.update(task_id, &mut |record| {
            ensure_lease_held(record, worker_id)?;
            record.state = TaskState::Failed;
            record.lease = None;
            record.not_before = None;
            record.error = Some(reason.to_string());
            Ok(())
        });
        log_lease_lost(&abandoned, task_id, worker_id, "abandon");
        abandoned
    }

    pub fn get(&self, task_id: TaskId) -> OrchestrationResult<TaskRecord> {
        self.store.get(task_id)?.ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::NotFound,
                format!("unknown task id '{}'", task_id.0),
            )
        })
    }

    pub fn counts(&self, run: Option<RunId>) -> OrchestrationResult<TaskStateCounts> {
        self.store.state_counts(run)
    }
}

fn ensure_lease_held(record: &TaskRecord, worker_id: &str) -> Result<(), CoreError> {
    if record.holds_active_lease(worker_id, SystemTime::now()) {
        return Ok(());
    }
    let detail = match (&record.state, record.lease_owner()) {
        (TaskState::Leased, Some(owner)) if owner != worker_id => {
            format!("lease is now held by '{owner}'")
        }
        (TaskState::Leased, _) => "lease expired".to_string(),
        (state, _) => format!("task is {state:?}"),
    };
    Err(lease_lost(record.id, &detail).for_task(record.kind))
}

fn lease_lost(task_id: TaskId, detail: &str) -> CoreError {
    CoreError::new(
        CoreErrorKind::LeaseLost,
        format!("lease on task '{}' lost: {detail}", task_id.0),
    )
}

fn log_lease_lost<T>(
    outcome: &OrchestrationResult<T>,
    task_id: TaskId,
    worker_id: &str,
    operation: &str,
) {
    if let Err(error) = outcome
        && error.kind == CoreErrorKind::LeaseLost
    {
        tracing::warn!(
            task_id = task_id.0,
            worker = worker_id,
            operation,
            message = %error.message,
            "discarding result for task whose lease was lost"
        );
    }
}
