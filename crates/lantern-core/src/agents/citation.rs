use serde::{Deserialize, Serialize};

use crate::agents::agent::encode_output;
use crate::agents::inference::{cancel_through, first_nonempty_line};
use crate::agents::{Agent, AgentDescriptor, AgentRequest, AgentResult, CancelHandle, ModelBinding};
use crate::models::{CoreError, CoreErrorKind, DocumentId, DocumentRecord, TaskKind};

const CITATION_DESCRIPTOR: AgentDescriptor = AgentDescriptor {
    kind: TaskKind::CitationExtraction,
    name: "citation-extraction",
};

const NO_CITATION: &str = "NONE";

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CitationTaskInput {
    pub question: String,
    pub document: DocumentRecord,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CitationTaskOutput {
    pub document_id: DocumentId,
    pub title: String,
    pub passage: Option<String>,
}

pub struct CitationAgent {
    binding: ModelBinding,
}

impl CitationAgent {
    pub fn new(binding: ModelBinding) -> Self {
        Self { binding }
    }
}

impl Agent for CitationAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &CITATION_DESCRIPTOR
    }

    fn execute(&self, request: &AgentRequest) -> AgentResult<serde_json::Value> {
        let input: CitationTaskInput = request.decode()?;
        let prompt = format!(
            "Quote the sentence or passage from the abstract that best supports an answer to \
             the research question. Reply with the quote only, or {NO_CITATION} if the \
             abstract contains no supporting passage.\n\nQuestion: {}\nAbstract: {}\nQuote:",
            input.question, input.document.abstract_text
        );
        let raw = self.binding.invoke_recoverable(&prompt, &request.handle)?;
        let passage = parse_citation(&raw).map_err(|error| error.for_model(self.binding.model()))?;
        encode_output(
            request.kind,
            &CitationTaskOutput {
                document_id: input.document.id,
                title: input.document.title,
                passage,
            },
        )
    }

    fn test_connection(&self) -> AgentResult<()> {
        self.binding.ping()
    }

    fn supports_cancel(&self) -> bool {
        self.binding.backend().supports_cancel()
    }

    fn cancel(&self, handle: &CancelHandle) -> AgentResult<()> {
        cancel_through(self.binding.backend(), &CITATION_DESCRIPTOR, handle)
    }
}

/// `Ok(None)` when the model reports that nothing in the abstract supports the question.
pub fn parse_citation(output: &str) -> AgentResult<Option<String>> {
    let Some(line) = first_nonempty_line(output) else {
        return Err(CoreError::new(
            CoreErrorKind::AgentFailure,
            "model returned no citation output",
        ));
    };
    let passage = line.trim_matches(|c: char| c == '"' || c == '\u{201c}' || c == '\u{201d}');
    let passage = passage.trim();
    if passage.is_empty() || passage.trim_end_matches('.').eq_ignore_ascii_case(NO_CITATION) {
        return Ok(None);
    }
    Ok(Some(passage.to_string()))
}

#[cfg(test)]
mod tests {
    use super::parse_citation;

    #[test]
    fn none_marker_means_no_passage() {
        assert_eq!(parse_citation("NONE").unwrap(), None);
        assert_eq!(parse_citation("none.\n").unwrap(), None);
    }

    #[test]
    fn quotes_are_stripped() {
        assert_eq!(
            parse_citation("\"Mortality fell by 12%.\"").unwrap(),
            Some("Mortality fell by 12%.".to_string())
        );
    }

    #[test]
    fn blank_output_is_retryable() {
        let error = parse_citation(" \n ").unwrap_err();
        assert!(error.is_retryable());
    }
}
