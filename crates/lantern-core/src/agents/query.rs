use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agents::agent::encode_output;
use crate::agents::inference::{cancel_through, first_nonempty_line, invoke_model};
use crate::agents::{
    Agent, AgentDescriptor, AgentRequest, AgentResult, CancelHandle, InferenceBackend,
};
use crate::models::error::config_error;
use crate::models::{CoreError, CoreErrorKind, TaskKind};
use crate::querygen::expression::has_searchable_terms;

const QUERY_DESCRIPTOR: AgentDescriptor = AgentDescriptor {
    kind: TaskKind::QueryGeneration,
    name: "query-generation",
};

const QUERY_PREFIXES: &[&str] = &["query:", "search query:", "boolean query:"];

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueryTaskInput {
    pub question: String,
    pub model: String,
    #[serde(default)]
    pub variant: u32,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueryTaskOutput {
    pub query: String,
}

/// Turns a research question into one boolean search expression. The model is chosen per
/// task, so one agent serves every configured model.
pub struct QueryAgent {
    backend: Arc<dyn InferenceBackend>,
    models: Vec<String>,
    timeout: Duration,
}

impl QueryAgent {
    pub fn new(backend: Arc<dyn InferenceBackend>, models: Vec<String>, timeout: Duration) -> Self {
        Self {
            backend,
            models,
            timeout,
        }
    }
}

impl Agent for QueryAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &QUERY_DESCRIPTOR
    }

    fn execute(&self, request: &AgentRequest) -> AgentResult<serde_json::Value> {
        let input: QueryTaskInput = request.decode()?;
        let prompt = build_query_prompt(&input.question, input.variant);
        let raw = invoke_model(
            self.backend.as_ref(),
            &input.model,
            &prompt,
            self.timeout,
            &request.handle,
        )?;
        let query = parse_query_output(&raw).map_err(|error| error.for_model(&input.model))?;
        tracing::debug!(
            task_id = request.task_id.0,
            model = %input.model,
            variant = input.variant,
            query = %query,
            "generated query"
        );
        encode_output(request.kind, &QueryTaskOutput { query })
    }

    fn test_connection(&self) -> AgentResult<()> {
        let mut last_error = None;
        for model in &self.models {
            match self.backend.ping(model) {
                Ok(()) => return Ok(()),
                Err(error) => {
                    tracing::warn!(model = %model, error = %error, "query model unreachable");
                    last_error = Some(error.into_core(model));
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| config_error("no query generation models are configured"))
            .for_task(TaskKind::QueryGeneration))
    }

    fn supports_cancel(&self) -> bool {
        self.backend.supports_cancel()
    }

    fn cancel(&self, handle: &CancelHandle) -> AgentResult<()> {
        cancel_through(self.backend.as_ref(), &QUERY_DESCRIPTOR, handle)
    }
}

pub fn build_query_prompt(question: &str, variant: u32) -> String {
    let angle = match variant {
        0 => "Use the most specific terms from the question.",
        1 => "Include common synonyms for the key concepts, joined with |.",
        _ => "Focus on the outcome or intervention the question asks about.",
    };
    format!(
        "Convert the research question into a boolean search query for a literature \
         database. Join required terms with & and alternatives with |. {angle} \
         Reply with the query only, on a single line.\n\nQuestion: {question}\nQuery:"
    )
}

/// Extracts the query expression from raw model output.
pub fn parse_query_output(output: &str) -> AgentResult<String> {
    let Some(line) = first_nonempty_line(output) else {
        return Err(parse_error("model returned no output"));
    };

    let mut query = line;
    for prefix in QUERY_PREFIXES {
        if query.len() >= prefix.len()
            && query.is_char_boundary(prefix.len())
            && query[..prefix.len()].eq_ignore_ascii_case(prefix)
        {
            query = query[prefix.len()..].trim();
            break;
        }
    }
    let query = query.trim_matches(|c: char| c == '`' || c == '"').trim();

    if !has_searchable_terms(query) {
        return Err(parse_error(format!("no usable search terms in '{line}'")));
    }
    Ok(query.to_string())
}

fn parse_error(message: impl Into<String>) -> CoreError {
    CoreError::new(CoreErrorKind::QueryParseError, message).for_task(TaskKind::QueryGeneration)
}

#[cfg(test)]
mod tests {
    use super::{build_query_prompt, parse_query_output};
    use crate::models::CoreErrorKind;

    #[test]
    fn strips_prefix_and_fences() {
        let raw = "```\nQuery: `cancer & therapy`\n```";
        assert_eq!(parse_query_output(raw).unwrap(), "cancer & therapy");
    }

    #[test]
    fn takes_first_usable_line() {
        let raw = "\n  aspirin & (stroke | infarction)\nExplanation: covers both outcomes";
        assert_eq!(
            parse_query_output(raw).unwrap(),
            "aspirin & (stroke | infarction)"
        );
    }

    #[test]
    fn empty_output_is_a_parse_error() {
        let error = parse_query_output("   \n").unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::QueryParseError);

        let error = parse_query_output("Query: & |").unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::QueryParseError);
    }

    #[test]
    fn variants_change_the_prompt() {
        assert_ne!(build_query_prompt("q", 0), build_query_prompt("q", 1));
        assert!(build_query_prompt("does x cause y", 2).contains("does x cause y"));
    }
}
