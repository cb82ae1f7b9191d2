use std::sync::Arc;
use std::time::Instant;

use crate::agents::{QueryTaskInput, QueryTaskOutput};
use crate::models::error::config_error;
use crate::models::{
    CoreError, CoreErrorKind, DocumentId, DocumentIdSet, DocumentRecord, MultiModelQueryResult,
    PipelineStage, QueryGenerationResult, RunId, TaskId, TaskKind, TaskPriority, TaskState,
};
use crate::orchestration::engine::OrchestratorContext;
use crate::orchestration::progress::fraction;
use crate::orchestration::worker::{drive_tasks, run_blocking, store_call};
use crate::orchestration::{OrchestrationResult, RunCancellation};
use crate::querygen::dedup::UniqueQueries;

/// Human-in-the-loop selection over the candidate queries. Returning an empty selection
/// aborts retrieval for the question.
pub trait QueryReviewer: Send + Sync {
    fn review(&self, candidates: &[String]) -> Vec<String>;
}

impl<F> QueryReviewer for F
where
    F: Fn(&[String]) -> Vec<String> + Send + Sync,
{
    fn review(&self, candidates: &[String]) -> Vec<String> {
        self(candidates)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FailedQuery {
    pub query: String,
    pub error: String,
}

#[derive(Clone, Debug, Default)]
pub struct QueryPipelineOutcome {
    pub queries: MultiModelQueryResult,
    /// Queries that reached the store, after review.
    pub executed_queries: Vec<String>,
    pub failed_queries: Vec<FailedQuery>,
    pub document_ids: DocumentIdSet,
    pub documents: Vec<DocumentRecord>,
    pub review_aborted: bool,
    pub task_ids: Vec<TaskId>,
}

impl QueryPipelineOutcome {
    /// Some model or some query failed while others succeeded.
    pub fn is_degraded(&self) -> bool {
        !self.queries.failed_models().is_empty() || !self.failed_queries.is_empty()
    }
}

/// Serial multi-model query generation followed by two-phase document retrieval: id-only
/// search per query, then a single bulk fetch of the union.
#[derive(Clone)]
pub struct MultiModelQueryGenerator {
    ctx: OrchestratorContext,
    reviewer: Option<Arc<dyn QueryReviewer>>,
}

impl MultiModelQueryGenerator {
    pub fn new(ctx: OrchestratorContext) -> Self {
        Self {
            ctx,
            reviewer: None,
        }
    }

    pub fn with_reviewer(mut self, reviewer: Arc<dyn QueryReviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    /// Fails with `FatalConfig` before anything is enqueued when the configuration cannot
    /// produce a run.
    pub fn check_config(&self) -> OrchestrationResult<()> {
        self.ctx.config.validate()?;
        let settings = &self.ctx.config.query_generation;
        if settings.active_models().is_empty() {
            return Err(config_error("no query generation model is configured"));
        }
        if settings.human_review && self.reviewer.is_none() {
            return Err(config_error(
                "query_generation.human_review is enabled but no reviewer was supplied",
            ));
        }
        Ok(())
    }

    /// Asks every active model, one at a time, for its queries. Per-model failures are
    /// recorded in the result rather than returned.
    pub async fn generate(
        &self,
        question: &str,
        run: Option<RunId>,
        cancellation: &RunCancellation,
    ) -> OrchestrationResult<(MultiModelQueryResult, Vec<TaskId>)> {
        self.check_config()?;
        let settings = &self.ctx.config.query_generation;
        let models = settings.active_models();
        let per_model = settings.attempts_per_model();
        let total = models.len() * per_model;

        let mut results = Vec::with_capacity(total);
        let mut task_ids = Vec::with_capacity(total);
        for model in models {
            for variant in 0..per_model {
                if cancellation.is_cancelled() {
                    return Err(CoreError::new(
                        CoreErrorKind::Cancelled,
                        "query generation cancelled",
                    )
                    .for_task(TaskKind::QueryGeneration));
                }

                let started = Instant::now();
                let task_id = self.enqueue_query_task(question, model, variant, run).await?;
                task_ids.push(task_id);
                let report = drive_tasks(
                    &self.ctx,
                    PipelineStage::QueryGeneration,
                    vec![task_id],
                    cancellation,
                )
                .await?;

                let result = match report.records.first() {
                    Some(record) if record.state == TaskState::Completed => {
                        let decoded = record
                            .result
                            .clone()
                            .map(serde_json::from_value::<QueryTaskOutput>);
                        match decoded {
                            Some(Ok(output)) => QueryGenerationResult {
                                model_id: model.clone(),
                                query_text: Some(output.query),
                                latency: started.elapsed(),
                                error: None,
                            },
                            _ => failed_result(model, started, "task completed without a query"),
                        }
                    }
                    Some(record) => failed_result(
                        model,
                        started,
                        record.error.as_deref().unwrap_or("query task did not complete"),
                    ),
                    None => failed_result(model, started, "query task disappeared"),
                };

                if let Some(error) = &result.error {
                    tracing::warn!(
                        model = %model,
                        variant,
                        error = %error,
                        "model failed to produce a query"
                    );
                }
                self.ctx.progress.on_progress(
                    PipelineStage::QueryGeneration.as_str(),
                    fraction(results.len() + 1, total) * 0.5,
                    &format!("model {model} query {}/{per_model}", variant + 1),
                );
                results.push(result);
            }
        }

        let generated = MultiModelQueryResult::from_results(results);
        if settings.show_all_queries {
            for (index, result) in generated.ordered_results.iter().enumerate() {
                tracing::info!(
                    index,
                    model = %result.model_id,
                    query = ?result.query_text,
                    error = ?result.error,
                    "generated query"
                );
            }
        }
        tracing::info!(
            models = generated.model_count,
            total_queries = generated.total_queries,
            unique_queries = generated.unique_queries.len(),
            failed_models = generated.failed_models().len(),
            "query generation finished"
        );
        Ok((generated, task_ids))
    }

    /// Generation, optional review, id-only search per query, then one bulk fetch.
    pub async fn run(
        &self,
        question: &str,
        run: Option<RunId>,
        cancellation: &RunCancellation,
    ) -> OrchestrationResult<QueryPipelineOutcome> {
        let (queries, task_ids) = self.generate(question, run, cancellation).await?;
        if cancellation.is_cancelled() {
            return Err(CoreError::new(CoreErrorKind::Cancelled, "query generation cancelled")
                .for_task(TaskKind::QueryGeneration));
        }
        if queries.all_failed() {
            let failed = queries.failed_models().join(", ");
            return Err(CoreError::new(
                CoreErrorKind::ModelUnavailable,
                format!(
                    "all {} query models failed: {failed}",
                    queries.model_count
                ),
            )
            .for_task(TaskKind::QueryGeneration));
        }

        let settings = &self.ctx.config.query_generation;
        let candidates = if settings.deduplicate {
            queries.unique_queries.clone()
        } else {
            queries
                .ordered_results
                .iter()
                .filter_map(|result| result.query_text.clone())
                .collect()
        };

        let mut outcome = QueryPipelineOutcome {
            queries,
            task_ids,
            ..QueryPipelineOutcome::default()
        };

        let selected = match (&self.reviewer, settings.human_review) {
            (Some(reviewer), true) => {
                let reviewer = reviewer.clone();
                let offered = candidates.clone();
                let picked = run_blocking(move || Ok(reviewer.review(&offered))).await?;
                narrow_to_selection(&candidates, &picked)
            }
            _ => candidates,
        };
        if selected.is_empty() {
            tracing::info!("reviewer selected no queries; skipping retrieval");
            outcome.review_aborted = true;
            return Ok(outcome);
        }

        let max_rows = settings.max_rows_per_query;
        let total = selected.len();
        for (index, query) in selected.into_iter().enumerate() {
            if cancellation.is_cancelled() {
                return Err(CoreError::new(CoreErrorKind::Cancelled, "retrieval cancelled")
                    .for_task(TaskKind::QueryGeneration));
            }
            let documents = self.ctx.documents.clone();
            let search = query.clone();
            let found = store_call(&self.ctx, "find_ids", move || {
                documents.find_ids(&search, max_rows)
            })
            .await;
            match found {
                Ok(ids) => {
                    let found_count = ids.len();
                    let added = outcome.document_ids.extend_from(ids);
                    tracing::debug!(query = %query, found = found_count, added, "query executed");
                    outcome.executed_queries.push(query);
                }
                Err(error) => {
                    tracing::warn!(
                        query = %query,
                        kind = ?error.kind,
                        message = %error.message,
                        "query search failed"
                    );
                    outcome.failed_queries.push(FailedQuery {
                        query,
                        error: error.to_string(),
                    });
                }
            }
            self.ctx.progress.on_progress(
                PipelineStage::QueryGeneration.as_str(),
                0.5 + fraction(index + 1, total) * 0.4,
                &format!("executed query {}/{total}", index + 1),
            );
        }

        if !outcome.document_ids.is_empty() {
            outcome.documents = self.fetch_documents(&outcome.document_ids).await?;
        }
        self.ctx.progress.on_progress(
            PipelineStage::QueryGeneration.as_str(),
            1.0,
            &format!("retrieved {} documents", outcome.documents.len()),
        );
        Ok(outcome)
    }

    async fn enqueue_query_task(
        &self,
        question: &str,
        model: &str,
        variant: usize,
        run: Option<RunId>,
    ) -> OrchestrationResult<TaskId> {
        let payload = serde_json::to_value(QueryTaskInput {
            question: question.to_string(),
            model: model.to_string(),
            variant: variant as u32,
        })
        .map_err(|error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("failed to encode query task payload: {error}"),
            )
        })?;
        let queue = self.ctx.queue.clone();
        run_blocking(move || {
            queue.enqueue_for_run(run, TaskKind::QueryGeneration, payload, TaskPriority::High)
        })
        .await
    }

    async fn fetch_documents(
        &self,
        ids: &DocumentIdSet,
    ) -> OrchestrationResult<Vec<DocumentRecord>> {
        let documents = self.ctx.documents.clone();
        let batch_size = self.ctx.config.query_generation.fetch_batch_size;
        let wanted: Vec<DocumentId> = ids.to_vec();
        let fetched = store_call(&self.ctx, "fetch_by_ids", move || {
            documents.fetch_by_ids(&wanted, batch_size)
        })
        .await?;
        if fetched.len() < ids.len() {
            tracing::debug!(
                requested = ids.len(),
                fetched = fetched.len(),
                "some document ids did not resolve"
            );
        }
        Ok(fetched)
    }
}

fn failed_result(model: &str, started: Instant, error: &str) -> QueryGenerationResult {
    QueryGenerationResult {
        model_id: model.to_string(),
        query_text: None,
        latency: started.elapsed(),
        error: Some(error.to_string()),
    }
}

/// Keeps candidates the reviewer picked, in candidate order. Edited or unknown picks are
/// ignored.
fn narrow_to_selection(candidates: &[String], picked: &[String]) -> Vec<String> {
    let mut chosen = UniqueQueries::new();
    for query in picked {
        chosen.insert(query);
    }
    candidates
        .iter()
        .filter(|candidate| chosen.contains(candidate))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::narrow_to_selection;

    #[test]
    fn selection_keeps_candidate_order() {
        let candidates = vec!["a & b".to_string(), "c".to_string(), "d | e".to_string()];
        let picked = vec!["D | E".to_string(), "a & b".to_string(), "zzz".to_string()];
        assert_eq!(
            narrow_to_selection(&candidates, &picked),
            vec!["a & b".to_string(), "d | e".to_string()]
        );
    }
}
