use serde::{Deserialize, Serialize};

use crate::agents::agent::encode_output;
use crate::agents::inference::cancel_through;
use crate::agents::{Agent, AgentDescriptor, AgentRequest, AgentResult, CancelHandle, ModelBinding};
use crate::models::{CoreError, CoreErrorKind, DocumentId, DocumentRecord, TaskKind};

const SCORING_DESCRIPTOR: AgentDescriptor = AgentDescriptor {
    kind: TaskKind::RelevanceScoring,
    name: "relevance-scoring",
};

pub const MIN_SCORE: u8 = 1;
pub const MAX_SCORE: u8 = 5;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ScoringTaskInput {
    pub question: String,
    pub document: DocumentRecord,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ScoringTaskOutput {
    pub document_id: DocumentId,
    pub score: u8,
}

pub struct ScoringAgent {
    binding: ModelBinding,
}

impl ScoringAgent {
    pub fn new(binding: ModelBinding) -> Self {
        Self { binding }
    }
}

impl Agent for ScoringAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &SCORING_DESCRIPTOR
    }

    fn execute(&self, request: &AgentRequest) -> AgentResult<serde_json::Value> {
        let input: ScoringTaskInput = request.decode()?;
        let prompt = format!(
            "Rate how relevant the document is to the research question on a scale from \
             {MIN_SCORE} (unrelated) to {MAX_SCORE} (directly answers it). Reply with the \
             number only.\n\nQuestion: {}\nTitle: {}\nAbstract: {}\nScore:",
            input.question, input.document.title, input.document.abstract_text
        );
        let raw = self.binding.invoke_recoverable(&prompt, &request.handle)?;
        let score = parse_score(&raw).ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::AgentFailure,
                format!("no score between {MIN_SCORE} and {MAX_SCORE} in '{}'", raw.trim()),
            )
            .for_model(self.binding.model())
        })?;
        encode_output(
            request.kind,
            &ScoringTaskOutput {
                document_id: input.document.id,
                score,
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
        cancel_through(self.binding.backend(), &SCORING_DESCRIPTOR, handle)
    }
}

/// First standalone integer in the output that lies inside the score range.
pub fn parse_score(output: &str) -> Option<u8> {
    output
        .split(|c: char| !c.is_ascii_digit())
        .filter(|token| !token.is_empty())
        .filter_map(|token| token.parse::<u8>().ok())
        .find(|score| (MIN_SCORE..=MAX_SCORE).contains(score))
}
