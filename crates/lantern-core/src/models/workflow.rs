use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, CoreErrorKind, RunId, TaskId, TaskKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        self != Self::Running
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    QueryGeneration,
    RelevanceScoring,
    CitationExtraction,
    ReportSynthesis,
    CounterfactualAnalysis,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QueryGeneration => "query_generation",
            Self::RelevanceScoring => "relevance_scoring",
            Self::CitationExtraction => "citation_extraction",
            Self::ReportSynthesis => "report_synthesis",
            Self::CounterfactualAnalysis => "counterfactual_analysis",
        }
    }

    pub fn task_kind(self) -> TaskKind {
        match self {
            Self::QueryGeneration => TaskKind::QueryGeneration,
            Self::RelevanceScoring => TaskKind::RelevanceScoring,
            Self::CitationExtraction => TaskKind::CitationExtraction,
            Self::ReportSynthesis => TaskKind::ReportSynthesis,
            Self::CounterfactualAnalysis => TaskKind::CounterfactualAnalysis,
        }
    }

    /// A required stage that fails takes the whole run down with it.
    pub fn is_required(self) -> bool {
        matches!(
            self,
            Self::QueryGeneration | Self::RelevanceScoring | Self::ReportSynthesis
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Partial,
    Failed,
    Skipped,
    Cancelled,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: PipelineStage,
    pub status: StageStatus,
    pub task_ids: Vec<TaskId>,
    pub completed: usize,
    pub dead: usize,
    pub elapsed: Duration,
    pub message: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkflowRun {
    pub id: RunId,
    pub question: String,
    pub status: RunStatus,
    pub stages: Vec<StageOutcome>,
    pub started_at: SystemTime,
    pub elapsed: Duration,
}

impl WorkflowRun {
    pub fn start(id: RunId, question: impl Into<String>) -> Self {
        Self {
            id,
            question: question.into(),
            status: RunStatus::Running,
            stages: Vec::new(),
            started_at: SystemTime::now(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn record_stage(&mut self, outcome: StageOutcome) -> Result<(), CoreError> {
        self.ensure_running()?;
        self.elapsed += outcome.elapsed;
        self.stages.push(outcome);
        Ok(())
    }

    pub fn stage(&self, stage: PipelineStage) -> Option<&StageOutcome> {
        self.stages.iter().find(|outcome| outcome.stage == stage)
    }

    /// Derives the terminal status from the recorded stage outcomes and seals the run.
    pub fn finish(&mut self) -> Result<RunStatus, CoreError> {
        self.ensure_running()?;
        let mut status = RunStatus::Succeeded;
        for outcome in &self.stages {
            match outcome.status {
                StageStatus::Cancelled => {
                    status = RunStatus::Failed;
                }
                StageStatus::Failed if outcome.stage.is_required() => {
                    status = RunStatus::Failed;
                }
                StageStatus::Failed | StageStatus::Partial => {
                    if status == RunStatus::Succeeded {
                        status = RunStatus::Partial;
                    }
                }
                StageStatus::Completed | StageStatus::Skipped => {}
            }
        }
        self.status = status;
        Ok(status)
    }

    /// Seals the run as failed after an error that made continuation impossible.
    pub fn abort(&mut self) -> Result<RunStatus, CoreError> {
        self.ensure_running()?;
        self.status = RunStatus::Failed;
        Ok(self.status)
    }

    fn ensure_running(&self) -> Result<(), CoreError> {
        if self.status.is_terminal() {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!(
                    "workflow run '{}' is already terminal ({:?})",
                    self.id.0, self.status
                ),
            ));
        }
        Ok(())
    }
}
