use serde::{Deserialize, Serialize};

use crate::agents::agent::encode_output;
use crate::agents::inference::cancel_through;
use crate::agents::{Agent, AgentDescriptor, AgentRequest, AgentResult, CancelHandle, ModelBinding};
use crate::models::{CoreError, CoreErrorKind, DocumentId, TaskKind};

const REPORT_DESCRIPTOR: AgentDescriptor = AgentDescriptor {
    kind: TaskKind::ReportSynthesis,
    name: "report-synthesis",
};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReportCitation {
    pub document_id: DocumentId,
    pub title: String,
    pub passage: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReportTaskInput {
    pub question: String,
    pub citations: Vec<ReportCitation>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReportTaskOutput {
    pub report: String,
    pub cited: Vec<DocumentId>,
}

pub struct ReportAgent {
    binding: ModelBinding,
}

impl ReportAgent {
    pub fn new(binding: ModelBinding) -> Self {
        Self { binding }
    }
}

impl Agent for ReportAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &REPORT_DESCRIPTOR
    }

    fn execute(&self, request: &AgentRequest) -> AgentResult<serde_json::Value> {
        let input: ReportTaskInput = request.decode()?;
        let prompt = build_report_prompt(&input);
        let raw = self.binding.invoke_recoverable(&prompt, &request.handle)?;
        let report = raw.trim();
        if report.is_empty() {
            return Err(CoreError::new(CoreErrorKind::AgentFailure, "model returned an empty report")
                .for_model(self.binding.model()));
        }
        encode_output(
            request.kind,
            &ReportTaskOutput {
                report: report.to_string(),
                cited: input.citations.iter().map(|citation| citation.document_id).collect(),
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
        cancel_through(self.binding.backend(), &REPORT_DESCRIPTOR, handle)
    }
}

pub fn build_report_prompt(input: &ReportTaskInput) -> String {
    let mut prompt = format!(
        "Write a concise evidence report answering the research question. Cite sources by \
         their bracketed number and do not make claims the citations do not support.\n\n\
         Question: {}\n\nCitations:\n",
        input.question
    );
    for (index, citation) in input.citations.iter().enumerate() {
        prompt.push_str(&format!(
            "[{}] {}: {}\n",
            index + 1,
            citation.title,
            citation.passage
        ));
    }
    prompt.push_str("\nReport:");
    prompt
}

#[cfg(test)]
mod tests {
    use super::{ReportCitation, ReportTaskInput, build_report_prompt};
    use crate::models::DocumentId;

    #[test]
    fn prompt_numbers_citations_in_order() {
        let prompt = build_report_prompt(&ReportTaskInput {
            question: "Does aspirin prevent stroke?".to_string(),
            citations: vec![
                ReportCitation {
                    document_id: DocumentId(7),
                    title: "Trial A".to_string(),
                    passage: "Risk fell.".to_string(),
                },
                ReportCitation {
                    document_id: DocumentId(3),
                    title: "Trial B".to_string(),
                    passage: "No effect.".to_string(),
                },
            ],
        });
        let first = prompt.find("[1] Trial A").unwrap();
        let second = prompt.find("[2] Trial B").unwrap();
        assert!(first < second);
    }
}
