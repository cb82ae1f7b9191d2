pub mod agent;
pub mod citation;
pub mod counterfactual;
pub mod inference;
pub mod query;
pub mod report;
pub mod scoring;

pub use agent::{
    Agent, AgentDescriptor, AgentRequest, AgentResult, CancelHandle, ensure_kind_supported,
    execute_with_kind_check,
};
pub use citation::{CitationAgent, CitationTaskInput, CitationTaskOutput, parse_citation};
pub use counterfactual::{
    CounterfactualAgent, CounterfactualTaskInput, CounterfactualTaskOutput, parse_question_lines,
};
pub use inference::{
    InferenceBackend, InferenceError, InferenceErrorKind, InferenceRequest, ModelBinding,
    invoke_model,
};
pub use query::{
    QueryAgent, QueryTaskInput, QueryTaskOutput, build_query_prompt, parse_query_output,
};
pub use report::{ReportAgent, ReportCitation, ReportTaskInput, ReportTaskOutput};
pub use scoring::{
    MAX_SCORE, MIN_SCORE, ScoringAgent, ScoringTaskInput, ScoringTaskOutput, parse_score,
};
