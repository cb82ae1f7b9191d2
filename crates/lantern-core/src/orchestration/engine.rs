use std::sync::Arc;
use std::time::{Instant, SystemTime};

use serde::de::DeserializeOwned;

use crate::agents::{
    CitationTaskInput, CitationTaskOutput, CounterfactualTaskInput, CounterfactualTaskOutput,
    ReportCitation, ReportTaskInput, ReportTaskOutput, ScoringTaskInput, ScoringTaskOutput,
};
use crate::config::LanternConfig;
use crate::models::error::{config_error, internal_error};
use crate::models::{
    CoreError, CoreErrorKind, DocumentRecord, PipelineStage, RunId, StageOutcome, StageStatus,
    TaskId, TaskPriority, TaskRecord, WorkflowRun,
};
use crate::orchestration::gates::{ResourceClass, ResourceGates};
use crate::orchestration::progress::ProgressSink;
use crate::orchestration::queue::{QueueManager, RetryPolicy};
use crate::orchestration::worker::{StageReport, drive_tasks, run_blocking};
use crate::orchestration::{OrchestrationResult, RunCancellation};
use crate::persistence::{DocumentStore, RunStore, TaskStore};
use crate::querygen::{MultiModelQueryGenerator, QueryPipelineOutcome, QueryReviewer};
use crate::registry::AgentRegistry;

/// Everything a run needs, passed explicitly. Cheap to clone.
#[derive(Clone)]
pub struct OrchestratorContext {
    pub config: Arc<LanternConfig>,
    pub queue: QueueManager,
    pub registry: AgentRegistry,
    pub documents: Arc<dyn DocumentStore>,
    pub runs: Arc<dyn RunStore>,
    pub gates: ResourceGates,
    pub progress: Arc<dyn ProgressSink>,
}

impl OrchestratorContext {
    pub fn new(
        config: LanternConfig,
        tasks: Arc<dyn TaskStore>,
        runs: Arc<dyn RunStore>,
        documents: Arc<dyn DocumentStore>,
        registry: AgentRegistry,
        progress: Arc<dyn ProgressSink>,
    ) -> OrchestrationResult<Self> {
        config.validate()?;
        let queue = QueueManager::new(tasks, RetryPolicy::from(&config.queue));
        let gates = ResourceGates::new(config.orchestrator.store_concurrency);
        Ok(Self {
            config: Arc::new(config),
            queue,
            registry,
            documents,
            runs,
            gates,
            progress,
        })
    }
}

/// Everything a finished run produced, alongside its persisted status.
#[derive(Clone, Debug)]
pub struct WorkflowOutcome {
    pub run: WorkflowRun,
    pub retrieval: Option<QueryPipelineOutcome>,
    pub scores: Vec<ScoringTaskOutput>,
    pub citations: Vec<CitationTaskOutput>,
    pub report: Option<ReportTaskOutput>,
    pub counterfactual_questions: Vec<String>,
}

pub struct Orchestrator {
    ctx: OrchestratorContext,
    generator: MultiModelQueryGenerator,
}

impl Orchestrator {
    pub fn new(ctx: OrchestratorContext) -> Self {
        let generator = MultiModelQueryGenerator::new(ctx.clone());
        Self { ctx, generator }
    }

    pub fn with_reviewer(mut self, reviewer: Arc<dyn QueryReviewer>) -> Self {
        self.generator = self.generator.with_reviewer(reviewer);
        self
    }

    pub fn context(&self) -> &OrchestratorContext {
        &self.ctx
    }

    /// Checks every registered agent and the document store; returns the first failure.
    /// Each check holds the gate of its resource class and never overlaps stage work on the
    /// inference backend.
    pub async fn test_connections(&self) -> OrchestrationResult<()> {
        for agent in self.ctx.registry.agents() {
            let name = agent.descriptor().name;
            let kind = agent.descriptor().kind;
            let permit = self.ctx.gates.acquire(ResourceClass::of(kind)).await?;
            run_blocking(move || {
                let _permit = permit;
                agent.test_connection()
            })
            .await
            .map_err(|error| {
                tracing::warn!(
                    agent = name,
                    kind = ?error.kind,
                    message = %error.message,
                    "connection test failed"
                );
                error.for_task(kind)
            })?;
        }
        let documents = self.ctx.documents.clone();
        let permit = self.ctx.gates.acquire(ResourceClass::Store).await?;
        run_blocking(move || {
            let _permit = permit;
            documents.ping()
        })
        .await
    }

    /// Runs the whole pipeline for one question. Configuration and connection problems
    /// fail before a run is created; afterwards stage failures are reflected in the run
    /// status instead of being returned.
    pub async fn run_workflow(
        &self,
        question: &str,
        cancellation: &RunCancellation,
    ) -> OrchestrationResult<WorkflowOutcome> {
        self.generator.check_config()?;
        for stage in self.pipeline_stages() {
            if !self.ctx.registry.has_kind(stage.task_kind()) {
                return Err(config_error(format!(
                    "no agent is registered for stage '{}'",
                    stage.as_str()
                )));
            }
        }
        self.test_connections().await?;

        let started_at = SystemTime::now();
        let runs = self.ctx.runs.clone();
        let owned_question = question.to_string();
        let run_id = run_blocking(move || runs.create_run(&owned_question, started_at)).await?;
        let mut run = WorkflowRun::start(run_id, question);
        run.started_at = started_at;
        tracing::info!(run_id = run_id.0, "workflow run started");

        let mut outcome = WorkflowOutcome {
            run,
            retrieval: None,
            scores: Vec::new(),
            citations: Vec::new(),
            report: None,
            counterfactual_questions: Vec::new(),
        };
        if let Err(error) = self
            .execute_stages(question, run_id, cancellation, &mut outcome)
            .await
        {
            tracing::error!(
                run_id = run_id.0,
                kind = ?error.kind,
                message = %error.message,
                "workflow run aborted"
            );
            if outcome.run.abort().is_ok() {
                let _ = self.persist(&outcome.run).await;
            }
            return Err(error);
        }

        let status = outcome.run.finish()?;
        self.persist(&outcome.run).await?;
        tracing::info!(run_id = run_id.0, status = ?status, "workflow run finished");
        Ok(outcome)
    }

    fn pipeline_stages(&self) -> Vec<PipelineStage> {
        let mut stages = vec![
            PipelineStage::QueryGeneration,
            PipelineStage::RelevanceScoring,
            PipelineStage::CitationExtraction,
            PipelineStage::ReportSynthesis,
        ];
        if self.ctx.config.orchestrator.counterfactual_enabled {
            stages.push(PipelineStage::CounterfactualAnalysis);
        }
        stages
    }

    async fn execute_stages(
        &self,
        question: &str,
        run_id: RunId,
        cancellation: &RunCancellation,
        outcome: &mut WorkflowOutcome,
    ) -> OrchestrationResult<()> {
        // Query generation and retrieval.
        let started = Instant::now();
        let retrieval = match self.generator.run(question, Some(run_id), cancellation).await {
            Ok(retrieval) => retrieval,
            Err(error) => {
                let status = if error.kind == CoreErrorKind::Cancelled {
                    StageStatus::Cancelled
                } else {
                    StageStatus::Failed
                };
                let stage = StageOutcome {
                    stage: PipelineStage::QueryGeneration,
                    status,
                    task_ids: Vec::new(),
                    completed: 0,
                    dead: 0,
                    elapsed: started.elapsed(),
                    message: Some(error.message),
                };
                return self.record(outcome, stage).await;
            }
        };
        let status = if retrieval.is_degraded() {
            StageStatus::Partial
        } else {
            StageStatus::Completed
        };
        let message = if retrieval.review_aborted {
            Some("reviewer selected no queries".to_string())
        } else {
            Some(format!(
                "{} unique queries, {} documents",
                retrieval.queries.unique_queries.len(),
                retrieval.documents.len()
            ))
        };
        let stage = StageOutcome {
            stage: PipelineStage::QueryGeneration,
            status,
            task_ids: retrieval.task_ids.clone(),
            completed: retrieval.queries.total_queries,
            dead: retrieval.queries.ordered_results.len() - retrieval.queries.total_queries,
            elapsed: started.elapsed(),
            message,
        };
        let documents = retrieval.documents.clone();
        outcome.retrieval = Some(retrieval);
        self.record(outcome, stage).await?;

        // Relevance scoring.
        if self.stop_if_cancelled(outcome, PipelineStage::RelevanceScoring, cancellation).await? {
            return Ok(());
        }
        if documents.is_empty() {
            return self
                .skip_from(outcome, PipelineStage::RelevanceScoring, "no documents retrieved")
                .await;
        }
        let payloads = documents
            .iter()
            .map(|document| ScoringTaskInput {
                question: question.to_string(),
                document: document.clone(),
            })
            .collect::<Vec<_>>();
        let report = self
            .run_stage(
                PipelineStage::RelevanceScoring,
                run_id,
                TaskPriority::Normal,
                &payloads,
                cancellation,
            )
            .await?;
        let mut scores: Vec<ScoringTaskOutput> = decode_outputs(&report);
        scores.sort_by(|a, b| b.score.cmp(&a.score).then(a.document_id.cmp(&b.document_id)));
        outcome.scores = scores;
        if !self.record_report(outcome, &report).await? {
            return Ok(());
        }

        // Citation extraction.
        let threshold = self.ctx.config.orchestrator.relevance_threshold;
        let relevant: Vec<&DocumentRecord> = outcome
            .scores
            .iter()
            .filter(|score| score.score >= threshold)
            .filter_map(|score| documents.iter().find(|document| document.id == score.document_id))
            .collect();
        if self.stop_if_cancelled(outcome, PipelineStage::CitationExtraction, cancellation).await? {
            return Ok(());
        }
        if relevant.is_empty() {
            return self
                .skip_from(
                    outcome,
                    PipelineStage::CitationExtraction,
                    "no document reached the relevance threshold",
                )
                .await;
        }
        let payloads = relevant
            .iter()
            .map(|document| CitationTaskInput {
                question: question.to_string(),
                document: (*document).clone(),
            })
            .collect::<Vec<_>>();
        let report = self
            .run_stage(
                PipelineStage::CitationExtraction,
                run_id,
                TaskPriority::Normal,
                &payloads,
                cancellation,
            )
            .await?;
        outcome.citations = decode_outputs(&report);
        let citation_failed = report.completed_count() == 0;
        if !self.record_report(outcome, &report).await? {
            return Ok(());
        }

        let mut citations: Vec<ReportCitation> = outcome
            .citations
            .iter()
            .filter_map(|citation| {
                citation.passage.as_ref().map(|passage| ReportCitation {
                    document_id: citation.document_id,
                    title: citation.title.clone(),
                    passage: passage.clone(),
                })
            })
            .collect();
        if citation_failed {
            // Degraded input: fall back to the abstracts of the relevant documents.
            citations = relevant
                .iter()
                .map(|document| ReportCitation {
                    document_id: document.id,
                    title: document.title.clone(),
                    passage: document.abstract_text.clone(),
                })
                .collect();
        }

        // Report synthesis.
        if self.stop_if_cancelled(outcome, PipelineStage::ReportSynthesis, cancellation).await? {
            return Ok(());
        }
        if citations.is_empty() {
            return self
                .skip_from(outcome, PipelineStage::ReportSynthesis, "no supporting citations")
                .await;
        }
        let payloads = vec![ReportTaskInput {
            question: question.to_string(),
            citations,
        }];
        let report = self
            .run_stage(
                PipelineStage::ReportSynthesis,
                run_id,
                TaskPriority::Normal,
                &payloads,
                cancellation,
            )
            .await?;
        outcome.report = decode_outputs::<ReportTaskOutput>(&report).into_iter().next();
        if !self.record_report(outcome, &report).await? {
            return Ok(());
        }

        // Counterfactual analysis.
        if !self.ctx.config.orchestrator.counterfactual_enabled {
            return Ok(());
        }
        let Some(synthesized) = outcome.report.as_ref().map(|report| report.report.clone()) else {
            return self
                .skip_from(outcome, PipelineStage::CounterfactualAnalysis, "no report to analyse")
                .await;
        };
        if self
            .stop_if_cancelled(outcome, PipelineStage::CounterfactualAnalysis, cancellation)
            .await?
        {
            return Ok(());
        }
        let payloads = vec![CounterfactualTaskInput {
            question: question.to_string(),
            report: synthesized,
        }];
        let report = self
            .run_stage(
                PipelineStage::CounterfactualAnalysis,
                run_id,
                TaskPriority::Low,
                &payloads,
                cancellation,
            )
            .await?;
        outcome.counterfactual_questions = decode_outputs::<CounterfactualTaskOutput>(&report)
            .into_iter()
            .flat_map(|output| output.questions)
            .collect();
        self.record_report(outcome, &report).await?;
        Ok(())
    }

    /// Enqueues one task per payload as a batch, then drives the batch to terminal states.
    async fn run_stage<T: serde::Serialize>(
        &self,
        stage: PipelineStage,
        run_id: RunId,
        priority: TaskPriority,
        payloads: &[T],
        cancellation: &RunCancellation,
    ) -> OrchestrationResult<StageReport> {
        let kind = stage.task_kind();
        let encoded = payloads
            .iter()
            .map(|payload| {
                serde_json::to_value(payload).map_err(|error| {
                    CoreError::new(
                        CoreErrorKind::Internal,
                        format!("failed to encode {} payload: {error}", stage.as_str()),
                    )
                    .for_task(kind)
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let queue = self.ctx.queue.clone();
        let task_ids = run_blocking(move || -> OrchestrationResult<Vec<TaskId>> {
            encoded
                .into_iter()
                .map(|payload| queue.enqueue_for_run(Some(run_id), kind, payload, priority))
                .collect()
        })
        .await?;
        tracing::info!(
            run_id = run_id.0,
            stage = stage.as_str(),
            tasks = task_ids.len(),
            "stage enqueued"
        );
        drive_tasks(&self.ctx, stage, task_ids, cancellation).await
    }

    /// Records a driven stage. Returns `false` when the run cannot continue past it.
    async fn record_report(
        &self,
        outcome: &mut WorkflowOutcome,
        report: &StageReport,
    ) -> OrchestrationResult<bool> {
        let Some(stage) = report.stage else {
            return Err(internal_error("stage report without a stage"));
        };
        let completed = report.completed_count();
        let status = if completed == report.records.len() {
            StageStatus::Completed
        } else if report.cancelled {
            StageStatus::Cancelled
        } else if completed > 0 {
            StageStatus::Partial
        } else {
            StageStatus::Failed
        };
        let message = match status {
            StageStatus::Completed => None,
            _ => report.first_error().map(str::to_string),
        };
        self.record(
            outcome,
            StageOutcome {
                stage,
                status,
                task_ids: report.task_ids(),
                completed,
                dead: report.dead_count(),
                elapsed: report.elapsed,
                message,
            },
        )
        .await?;

        let continues = match status {
            StageStatus::Completed | StageStatus::Partial => true,
            StageStatus::Failed => !stage.is_required(),
            StageStatus::Cancelled | StageStatus::Skipped => false,
        };
        Ok(continues)
    }

    async fn stop_if_cancelled(
        &self,
        outcome: &mut WorkflowOutcome,
        next: PipelineStage,
        cancellation: &RunCancellation,
    ) -> OrchestrationResult<bool> {
        if !cancellation.is_cancelled() {
            return Ok(false);
        }
        tracing::info!(
            run_id = outcome.run.id.0,
            stage = next.as_str(),
            "run cancelled between stages"
        );
        self.record(
            outcome,
            StageOutcome {
                stage: next,
                status: StageStatus::Cancelled,
                task_ids: Vec::new(),
                completed: 0,
                dead: 0,
                elapsed: Default::default(),
                message: Some("run cancelled before the stage was enqueued".to_string()),
            },
        )
        .await?;
        Ok(true)
    }

    /// Marks `from` and every later stage of the pipeline as skipped.
    async fn skip_from(
        &self,
        outcome: &mut WorkflowOutcome,
        from: PipelineStage,
        reason: &str,
    ) -> OrchestrationResult<()> {
        let stages = self.pipeline_stages();
        let Some(position) = stages.iter().position(|stage| *stage == from) else {
            return Ok(());
        };
        for stage in &stages[position..] {
            self.record(
                outcome,
                StageOutcome {
                    stage: *stage,
                    status: StageStatus::Skipped,
                    task_ids: Vec::new(),
                    completed: 0,
                    dead: 0,
                    elapsed: Default::default(),
                    message: Some(reason.to_string()),
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn record(
        &self,
        outcome: &mut WorkflowOutcome,
        stage: StageOutcome,
    ) -> OrchestrationResult<()> {
        tracing::info!(
            run_id = outcome.run.id.0,
            stage = stage.stage.as_str(),
            status = ?stage.status,
            completed = stage.completed,
            dead = stage.dead,
            "stage finished"
        );
        self.ctx.progress.on_progress(
            stage.stage.as_str(),
            1.0,
            &format!("{:?}", stage.status).to_lowercase(),
        );
        outcome.run.record_stage(stage)?;
        self.persist(&outcome.run).await
    }

    async fn persist(&self, run: &WorkflowRun) -> OrchestrationResult<()> {
        let runs = self.ctx.runs.clone();
        let snapshot = run.clone();
        let persisted = run_blocking(move || runs.update_run(&snapshot)).await;
        if let Err(error) = &persisted {
            tracing::error!(
                run_id = run.id.0,
                kind = ?error.kind,
                message = %error.message,
                "failed to persist workflow run"
            );
        }
        persisted
    }
}

fn decode_outputs<T: DeserializeOwned>(report: &StageReport) -> Vec<T> {
    report
        .completed()
        .filter_map(|record: &TaskRecord| {
            let value = record.result.clone()?;
            match serde_json::from_value(value) {
                Ok(output) => Some(output),
                Err(error) => {
                    tracing::warn!(
                        task_id = record.id.0,
                        error = %error,
                        "undecodable task result"
                    );
                    None
                }
            }
        })
        .collect()
}
