use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::querygen::dedup::UniqueQueries;

/// One model's attempt to turn the research question into a database query.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueryGenerationResult {
    pub model_id: String,
    pub query_text: Option<String>,
    pub latency: Duration,
    pub error: Option<String>,
}

impl QueryGenerationResult {
    pub fn succeeded(&self) -> bool {
        self.query_text.is_some()
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MultiModelQueryResult {
    pub ordered_results: Vec<QueryGenerationResult>,
    /// First-seen spelling of each distinct query, in generation order.
    pub unique_queries: Vec<String>,
    pub total_queries: usize,
    pub model_count: usize,
}

impl MultiModelQueryResult {
    pub fn from_results(ordered_results: Vec<QueryGenerationResult>) -> Self {
        let mut unique = UniqueQueries::new();
        let mut total_queries = 0;
        let mut models = HashSet::new();

        for result in &ordered_results {
            models.insert(result.model_id.as_str());
            if let Some(text) = result.query_text.as_deref() {
                total_queries += 1;
                unique.insert(text);
            }
        }

        let model_count = models.len();
        Self {
            unique_queries: unique.into_vec(),
            total_queries,
            model_count,
            ordered_results,
        }
    }

    pub fn failed_models(&self) -> Vec<&str> {
        let mut failed: Vec<&str> = Vec::new();
        for result in &self.ordered_results {
            let model = result.model_id.as_str();
            let any_success = self
                .ordered_results
                .iter()
                .any(|other| other.model_id == model && other.succeeded());
            if !any_success && !failed.contains(&model) {
                failed.push(model);
            }
        }
        failed
    }

    pub fn all_failed(&self) -> bool {
        self.total_queries == 0
    }
}
