use std::time::SystemTime;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TaskId(pub u64);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RunId(pub u64);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    QueryGeneration,
    RelevanceScoring,
    CitationExtraction,
    ReportSynthesis,
    CounterfactualAnalysis,
}

impl TaskKind {
    pub const ALL: [TaskKind; 5] = [
        TaskKind::QueryGeneration,
        TaskKind::RelevanceScoring,
        TaskKind::CitationExtraction,
        TaskKind::ReportSynthesis,
        TaskKind::CounterfactualAnalysis,
    ];
}

/// Strict tiers: a lower tier is never leased while a higher tier has eligible work.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    High,
    Normal,
    Low,
}

impl TaskPriority {
    pub fn rank(self) -> i64 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Leased,
    Completed,
    Failed,
    Dead,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Dead)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskLease {
    pub owner: String,
    pub expires_at: SystemTime,
}

impl TaskLease {
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires_at <= now
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TaskRecord {
    pub id: TaskId,
    pub run: Option<RunId>,
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    pub priority: TaskPriority,
    pub state: TaskState,
    pub attempts: u32,
    pub lease: Option<TaskLease>,
    pub not_before: Option<SystemTime>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl TaskRecord {
    pub fn lease_owner(&self) -> Option<&str> {
        self.lease.as_ref().map(|lease| lease.owner.as_str())
    }

    pub fn lease_expiry(&self) -> Option<SystemTime> {
        self.lease.as_ref().map(|lease| lease.expires_at)
    }

    /// True when a worker may lease this record at `now`.
    pub fn is_leasable_at(&self, now: SystemTime) -> bool {
        match self.state {
            TaskState::Pending => self.not_before.is_none_or(|at| at <= now),
            TaskState::Leased => self
                .lease
                .as_ref()
                .is_none_or(|lease| lease.is_expired_at(now)),
            _ => false,
        }
    }

    pub fn holds_active_lease(&self, worker_id: &str, now: SystemTime) -> bool {
        self.state == TaskState::Leased
            && self
                .lease
                .as_ref()
                .is_some_and(|lease| lease.owner == worker_id && !lease.is_expired_at(now))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewTask {
    pub run: Option<RunId>,
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    pub priority: TaskPriority,
    pub created_at: SystemTime,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TaskStateCounts {
    pub pending: usize,
    pub leased: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead: usize,
}

impl TaskStateCounts {
    pub fn add(&mut self, state: TaskState, count: usize) {
        match state {
            TaskState::Pending => self.pending += count,
            TaskState::Leased => self.leased += count,
            TaskState::Completed => self.completed += count,
            TaskState::Failed => self.failed += count,
            TaskState::Dead => self.dead += count,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.leased + self.completed + self.failed + self.dead
    }

    pub fn terminal(&self) -> usize {
        self.completed + self.failed + self.dead
    }
}
