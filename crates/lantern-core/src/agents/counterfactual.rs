use serde::{Deserialize, Serialize};

use crate::agents::agent::encode_output;
use crate::agents::inference::cancel_through;
use crate::agents::{Agent, AgentDescriptor, AgentRequest, AgentResult, CancelHandle, ModelBinding};
use crate::models::{CoreError, CoreErrorKind, TaskKind};

const COUNTERFACTUAL_DESCRIPTOR: AgentDescriptor = AgentDescriptor {
    kind: TaskKind::CounterfactualAnalysis,
    name: "counterfactual-analysis",
};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CounterfactualTaskInput {
    pub question: String,
    pub report: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CounterfactualTaskOutput {
    pub questions: Vec<String>,
}

pub struct CounterfactualAgent {
    binding: ModelBinding,
}

impl CounterfactualAgent {
    pub fn new(binding: ModelBinding) -> Self {
        Self { binding }
    }
}

impl Agent for CounterfactualAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &COUNTERFACTUAL_DESCRIPTOR
    }

    fn execute(&self, request: &AgentRequest) -> AgentResult<serde_json::Value> {
        let input: CounterfactualTaskInput = request.decode()?;
        let prompt = format!(
            "List research questions whose answers would contradict the main claims of the \
             report below. One question per line, no numbering.\n\nOriginal question: {}\n\n\
             Report:\n{}\n\nQuestions:",
            input.question, input.report
        );
        let raw = self.binding.invoke_recoverable(&prompt, &request.handle)?;
        let questions = parse_question_lines(&raw);
        if questions.is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::AgentFailure,
                "model listed no counterfactual questions",
            )
            .for_model(self.binding.model()));
        }
        encode_output(request.kind, &CounterfactualTaskOutput { questions })
    }

    fn test_connection(&self) -> AgentResult<()> {
        self.binding.ping()
    }

    fn supports_cancel(&self) -> bool {
        self.binding.backend().supports_cancel()
    }

    fn cancel(&self, handle: &CancelHandle) -> AgentResult<()> {
        cancel_through(self.binding.backend(), &COUNTERFACTUAL_DESCRIPTOR, handle)
    }
}

pub fn parse_question_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| {
                    c == '-' || c == '*' || c == '•' || c == '.' || c == ')' || c.is_ascii_digit()
                })
                .trim()
        })
        .filter(|line| !line.is_empty() && !line.starts_with("```"))
        .map(str::to_string)
        .collect()
}
