use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::CoreError;
use crate::models::error::config_error;

pub const MAX_MODELS: usize = 3;
pub const MAX_QUERIES_PER_MODEL: usize = 3;

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanternConfig {
    pub queue: QueueConfig,
    pub orchestrator: OrchestratorConfig,
    pub query_generation: QueryGenerationConfig,
}

impl LanternConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, CoreError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|error| config_error(format!("invalid configuration: {error}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        self.queue.validate()?;
        self.orchestrator.validate()?;
        self.query_generation.validate()?;

        if self.queue.lease_duration() <= self.orchestrator.inference_timeout() {
            return Err(config_error(format!(
                "lease duration ({} ms) must exceed the inference timeout ({} ms)",
                self.queue.lease_duration_ms, self.orchestrator.inference_timeout_ms
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub lease_duration_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            lease_duration_ms: 120_000,
        }
    }
}

impl QueueConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.max_attempts == 0 {
            return Err(config_error("queue.max_attempts must be at least 1"));
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(config_error(
                "queue.base_backoff_ms must not exceed queue.max_backoff_ms",
            ));
        }
        if self.lease_duration_ms == 0 {
            return Err(config_error("queue.lease_duration_ms must be positive"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Workers per stage; inference-bound work is still serialized by the inference gate.
    pub worker_concurrency: usize,
    pub store_concurrency: usize,
    pub inference_timeout_ms: u64,
    pub store_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Minimum 1-5 relevance score a document needs to reach citation extraction.
    pub relevance_threshold: u8,
    pub counterfactual_enabled: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 2,
            store_concurrency: 4,
            inference_timeout_ms: 60_000,
            store_timeout_ms: 10_000,
            poll_interval_ms: 50,
            relevance_threshold: 3,
            counterfactual_enabled: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.worker_concurrency == 0 || self.store_concurrency == 0 {
            return Err(config_error("orchestrator concurrency limits must be at least 1"));
        }
        if self.inference_timeout_ms == 0 || self.store_timeout_ms == 0 {
            return Err(config_error("orchestrator timeouts must be positive"));
        }
        if self.poll_interval_ms == 0 {
            return Err(config_error("orchestrator.poll_interval_ms must be positive"));
        }
        if !(1..=5).contains(&self.relevance_threshold) {
            return Err(config_error("orchestrator.relevance_threshold must be between 1 and 5"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// The inference backend is a single local resource; models are queried one at a time.
    #[default]
    Serial,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryGenerationConfig {
    pub enabled: bool,
    pub models: Vec<String>,
    pub queries_per_model: usize,
    pub execution_mode: ExecutionMode,
    pub deduplicate: bool,
    pub human_review: bool,
    pub show_all_queries: bool,
    pub max_rows_per_query: usize,
    pub fetch_batch_size: usize,
}

impl Default for QueryGenerationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            models: vec!["medgemma4B_it_q8:latest".to_string()],
            queries_per_model: 1,
            execution_mode: ExecutionMode::Serial,
            deduplicate: true,
            human_review: false,
            show_all_queries: false,
            max_rows_per_query: 100,
            fetch_batch_size: 50,
        }
    }
}

impl QueryGenerationConfig {
    /// Models actually attempted: every configured model when multi-model generation is
    /// enabled, otherwise only the first.
    pub fn active_models(&self) -> &[String] {
        if self.enabled {
            &self.models
        } else {
            &self.models[..self.models.len().min(1)]
        }
    }

    pub fn attempts_per_model(&self) -> usize {
        if self.enabled {
            self.queries_per_model
        } else {
            1
        }
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.models.is_empty() {
            return Err(config_error(
                "query_generation.models must list at least one model",
            ));
        }
        if self.enabled && self.models.len() > MAX_MODELS {
            return Err(config_error(format!(
                "query_generation.models supports at most {MAX_MODELS} models, got {}",
                self.models.len()
            )));
        }
        let mut seen = HashSet::new();
        for model in &self.models {
            if model.trim().is_empty() {
                return Err(config_error("query_generation.models contains an empty id"));
            }
            if !seen.insert(model.as_str()) {
                return Err(config_error(format!(
                    "query_generation.models lists '{model}' more than once"
                )));
            }
        }
        if !(1..=MAX_QUERIES_PER_MODEL).contains(&self.queries_per_model) {
            return Err(config_error(format!(
                "query_generation.queries_per_model must be between 1 and {MAX_QUERIES_PER_MODEL}"
            )));
        }
        if self.max_rows_per_query == 0 || self.fetch_batch_size == 0 {
            return Err(config_error(
                "query_generation row cap and fetch batch size must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{LanternConfig, QueryGenerationConfig};
    use crate::models::CoreErrorKind;

    #[test]
    fn defaults_validate() {
        LanternConfig::default().validate().unwrap();
    }

    #[test]
    fn json_overrides_merge_with_defaults() {
        let config = LanternConfig::from_json_str(
            r#"{"query_generation": {"models": ["a", "b"], "queries_per_model": 2}}"#,
        )
        .unwrap();
        assert_eq!(config.query_generation.models, vec!["a", "b"]);
        assert_eq!(config.query_generation.queries_per_model, 2);
        assert_eq!(config.queue.max_attempts, 3);
    }

    #[test]
    fn enabled_without_models_is_fatal() {
        let config = LanternConfig {
            query_generation: QueryGenerationConfig {
                models: Vec::new(),
                ..QueryGenerationConfig::default()
            },
            ..LanternConfig::default()
        };
        assert_eq!(
            config.validate().unwrap_err().kind,
            CoreErrorKind::FatalConfig
        );
    }

    #[test]
    fn lease_must_outlive_inference_timeout() {
        let mut config = LanternConfig::default();
        config.queue.lease_duration_ms = config.orchestrator.inference_timeout_ms;
        assert_eq!(
            config.validate().unwrap_err().kind,
            CoreErrorKind::FatalConfig
        );
    }

    #[test]
    fn disabled_generation_uses_only_first_model() {
        let config = QueryGenerationConfig {
            enabled: false,
            models: vec!["a".to_string(), "b".to_string()],
            queries_per_model: 3,
            ..QueryGenerationConfig::default()
        };
        assert_eq!(config.active_models(), ["a".to_string()]);
        assert_eq!(config.attempts_per_model(), 1);
    }
}
