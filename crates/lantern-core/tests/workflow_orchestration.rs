use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lantern_core::agents::{
    Agent, CitationAgent, CounterfactualAgent, InferenceBackend, InferenceError,
    InferenceErrorKind, InferenceRequest, ModelBinding, QueryAgent, ReportAgent, ScoringAgent,
};
use lantern_core::config::LanternConfig;
use lantern_core::models::{
    CoreError, CoreErrorKind, DocumentId, DocumentRecord, PipelineStage, RunId, RunStatus,
    StageStatus, TaskKind, TaskState,
};
use lantern_core::orchestration::{
    Orchestrator, OrchestratorContext, ProgressSink, RunCancellation, tracing_progress,
};
use lantern_core::persistence::{RunStore, TaskScan, TaskStore};
use lantern_core::registry::AgentRegistry;
use lantern_core::sqlite::SqliteStore;

const QUERY_MODEL: &str = "query-model";
const WORKER_MODEL: &str = "worker-model";

/// Answers each pipeline prompt with a canned reply and tracks how many calls overlap.
#[derive(Default)]
struct PipelineBackend {
    ping_fails: bool,
    scoring_fails: bool,
    citation_fails: bool,
    prompts: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl InferenceBackend for PipelineBackend {
    fn invoke(&self, request: &InferenceRequest<'_>) -> Result<String, InferenceError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt.to_string());
        thread::sleep(Duration::from_millis(4));
        let reply = self.reply(request.prompt);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        reply
    }
}

impl PipelineBackend {
    fn reply(&self, prompt: &str) -> Result<String, InferenceError> {
        let unavailable = || Err(InferenceError::new(InferenceErrorKind::Unavailable, "offline"));
        if prompt.contains("single word: ready") {
            return if self.ping_fails { unavailable() } else { Ok("ready".to_string()) };
        }
        if prompt.contains("boolean search query") {
            return Ok("Query: aspirin & stroke".to_string());
        }
        if prompt.starts_with("Rate how relevant") {
            if self.scoring_fails || prompt.contains("Title: Broken") {
                return unavailable();
            }
            let score = if prompt.contains("Title: Tangential") { "1" } else { "4" };
            return Ok(score.to_string());
        }
        if prompt.starts_with("Quote the sentence") {
            if self.citation_fails {
                return unavailable();
            }
            return Ok("\"Aspirin lowered stroke risk.\"".to_string());
        }
        if prompt.contains("evidence report") {
            return Ok("Aspirin reduces stroke risk [1].".to_string());
        }
        if prompt.starts_with("List research questions") {
            let questions = "- Does placebo match the effect?\n- Is the benefit age-dependent?";
            return Ok(questions.to_string());
        }
        unavailable()
    }
}

fn test_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("lantern-{test_name}-{nanos}.sqlite3"))
}

fn document(id: i64, title: &str) -> DocumentRecord {
    DocumentRecord {
        id: DocumentId(id),
        title: title.to_string(),
        abstract_text: format!("Trial {id}: aspirin and stroke outcomes in adults."),
        authors: Some("Doe J".to_string()),
        year: Some(2020),
    }
}

fn test_config() -> LanternConfig {
    let mut config = LanternConfig::default();
    config.queue.base_backoff_ms = 1;
    config.queue.max_backoff_ms = 4;
    config.queue.lease_duration_ms = 10_000;
    config.orchestrator.inference_timeout_ms = 2_000;
    config.orchestrator.poll_interval_ms = 5;
    config.orchestrator.worker_concurrency = 3;
    config.query_generation.models = vec![QUERY_MODEL.to_string()];
    config
}

fn pipeline_agents(backend: Arc<PipelineBackend>, config: &LanternConfig) -> Vec<Arc<dyn Agent>> {
    let timeout = config.orchestrator.inference_timeout();
    let binding = ModelBinding::new(backend.clone(), WORKER_MODEL, timeout);
    vec![
        Arc::new(QueryAgent::new(
            backend,
            config.query_generation.models.clone(),
            timeout,
        )),
        Arc::new(ScoringAgent::new(binding.clone())),
        Arc::new(CitationAgent::new(binding.clone())),
        Arc::new(ReportAgent::new(binding.clone())),
        Arc::new(CounterfactualAgent::new(binding)),
    ]
}

struct Harness {
    store: Arc<SqliteStore>,
    orchestrator: Orchestrator,
}

fn harness_with(
    test_name: &str,
    config: LanternConfig,
    backend: Arc<PipelineBackend>,
    documents: &[DocumentRecord],
    progress: Arc<dyn ProgressSink>,
) -> Harness {
    lantern_core::logging::init_tracing();
    let store = Arc::new(SqliteStore::new(test_db_path(test_name)));
    store.migrate_to_latest().expect("migrations should apply");
    store.insert_documents(documents).unwrap();
    let registry = AgentRegistry::new(pipeline_agents(backend, &config)).unwrap();
    let ctx = OrchestratorContext::new(
        config,
        store.clone(),
        store.clone(),
        store.clone(),
        registry,
        progress,
    )
    .unwrap();
    Harness {
        store,
        orchestrator: Orchestrator::new(ctx),
    }
}

fn harness(
    test_name: &str,
    backend: Arc<PipelineBackend>,
    documents: &[DocumentRecord],
) -> Harness {
    harness_with(test_name, test_config(), backend, documents, tracing_progress())
}

fn stage_status(
    run: &lantern_core::models::WorkflowRun,
    stage: PipelineStage,
) -> Option<StageStatus> {
    run.stage(stage).map(|outcome| outcome.status)
}

#[tokio::test]
async fn healthy_pipeline_succeeds_end_to_end() {
    let backend = Arc::new(PipelineBackend::default());
    let harness = harness(
        "workflow-success",
        backend,
        &[document(1, "Trial One"), document(2, "Tangential"), document(3, "Trial Three")],
    );

    let outcome = harness
        .orchestrator
        .run_workflow("Does aspirin prevent stroke?", &RunCancellation::new())
        .await
        .unwrap();

    assert_eq!(outcome.run.status, RunStatus::Succeeded);
    let retrieval = outcome.retrieval.as_ref().unwrap();
    assert_eq!(retrieval.executed_queries, vec!["aspirin & stroke".to_string()]);
    assert_eq!(retrieval.document_ids.len(), 3);

    assert_eq!(outcome.scores.len(), 3);
    assert_eq!(outcome.scores[2].document_id, DocumentId(2));
    assert_eq!(outcome.scores[2].score, 1);

    // Only documents at or above the threshold reach citation extraction.
    assert_eq!(outcome.citations.len(), 2);
    let report = outcome.report.as_ref().unwrap();
    assert!(report.report.contains("[1]"));
    assert_eq!(report.cited.len(), 2);
    assert!(outcome.counterfactual_questions.is_empty());

    for stage in [
        PipelineStage::QueryGeneration,
        PipelineStage::RelevanceScoring,
        PipelineStage::CitationExtraction,
        PipelineStage::ReportSynthesis,
    ] {
        assert_eq!(stage_status(&outcome.run, stage), Some(StageStatus::Completed));
    }

    assert_eq!(
        harness.store.run_status(outcome.run.id).unwrap(),
        Some(RunStatus::Succeeded)
    );
    assert_eq!(harness.store.run_stages(outcome.run.id).unwrap().len(), 4);
    let counts = harness.store.state_counts(Some(outcome.run.id)).unwrap();
    assert_eq!(counts.completed, counts.total());
}

#[tokio::test]
async fn counterfactual_stage_runs_when_enabled() {
    let backend = Arc::new(PipelineBackend::default());
    let mut config = test_config();
    config.orchestrator.counterfactual_enabled = true;
    let harness = harness_with(
        "workflow-counterfactual",
        config,
        backend,
        &[document(1, "Trial One")],
        tracing_progress(),
    );

    let outcome = harness
        .orchestrator
        .run_workflow("Does aspirin prevent stroke?", &RunCancellation::new())
        .await
        .unwrap();

    assert_eq!(outcome.run.status, RunStatus::Succeeded);
    assert_eq!(
        outcome.counterfactual_questions,
        vec![
            "Does placebo match the effect?".to_string(),
            "Is the benefit age-dependent?".to_string()
        ]
    );
    let low = harness
        .store
        .scan(&TaskScan::default().kinds([TaskKind::CounterfactualAnalysis]))
        .unwrap();
    assert_eq!(low.len(), 1);
    assert_eq!(low[0].priority, lantern_core::models::TaskPriority::Low);
}

#[tokio::test]
async fn some_scoring_failures_make_the_run_partial() {
    let backend = Arc::new(PipelineBackend::default());
    let harness = harness(
        "workflow-partial",
        backend,
        &[document(1, "Trial One"), document(2, "Broken"), document(3, "Trial Three")],
    );

    let outcome = harness
        .orchestrator
        .run_workflow("Does aspirin prevent stroke?", &RunCancellation::new())
        .await
        .unwrap();

    assert_eq!(outcome.run.status, RunStatus::Partial);
    let scoring = outcome.run.stage(PipelineStage::RelevanceScoring).unwrap();
    assert_eq!(scoring.status, StageStatus::Partial);
    assert_eq!(scoring.completed, 2);
    assert_eq!(scoring.dead, 1);
    assert!(
        scoring
            .message
            .as_deref()
            .is_some_and(|message| message.contains("ModelUnavailable"))
    );
    assert!(outcome.report.is_some());
}

#[tokio::test]
async fn failed_required_stage_fails_the_run() {
    let backend = Arc::new(PipelineBackend {
        scoring_fails: true,
        ..PipelineBackend::default()
    });
    let harness = harness(
        "workflow-failed",
        backend,
        &[document(1, "Trial One"), document(2, "Trial Two")],
    );

    let outcome = harness
        .orchestrator
        .run_workflow("Does aspirin prevent stroke?", &RunCancellation::new())
        .await
        .unwrap();

    assert_eq!(outcome.run.status, RunStatus::Failed);
    assert_eq!(
        stage_status(&outcome.run, PipelineStage::RelevanceScoring),
        Some(StageStatus::Failed)
    );
    assert_eq!(stage_status(&outcome.run, PipelineStage::CitationExtraction), None);
    assert!(outcome.report.is_none());
    assert_eq!(
        harness.store.run_status(outcome.run.id).unwrap(),
        Some(RunStatus::Failed)
    );
}

#[tokio::test]
async fn no_matching_documents_skips_downstream_stages() {
    let backend = Arc::new(PipelineBackend::default());
    let unrelated = DocumentRecord {
        abstract_text: "Statins and cholesterol.".to_string(),
        ..document(1, "Lipids")
    };
    let harness = harness("workflow-empty", backend, &[unrelated]);

    let outcome = harness
        .orchestrator
        .run_workflow("Does aspirin prevent stroke?", &RunCancellation::new())
        .await
        .unwrap();

    assert_eq!(outcome.run.status, RunStatus::Succeeded);
    for stage in [
        PipelineStage::RelevanceScoring,
        PipelineStage::CitationExtraction,
        PipelineStage::ReportSynthesis,
    ] {
        assert_eq!(stage_status(&outcome.run, stage), Some(StageStatus::Skipped));
    }
}

#[tokio::test]
async fn cancellation_mid_stage_abandons_pending_work() {
    let backend = Arc::new(PipelineBackend::default());
    let cancellation = RunCancellation::new();
    let trigger = cancellation.clone();
    let fired = Arc::new(AtomicBool::new(false));
    let progress: Arc<dyn ProgressSink> =
        Arc::new(move |stage: &str, _fraction: f64, _message: &str| {
            let scoring = stage == PipelineStage::RelevanceScoring.as_str();
            if scoring && !fired.swap(true, Ordering::SeqCst) {
                trigger.cancel();
            }
        });
    let documents: Vec<_> = (1..=8).map(|id| document(id, &format!("Trial {id}"))).collect();
    let harness = harness_with("workflow-cancel", test_config(), backend, &documents, progress);

    let outcome = harness
        .orchestrator
        .run_workflow("Does aspirin prevent stroke?", &cancellation)
        .await
        .unwrap();

    assert_eq!(outcome.run.status, RunStatus::Failed);
    let scoring = outcome.run.stage(PipelineStage::RelevanceScoring).unwrap();
    assert_eq!(scoring.status, StageStatus::Cancelled);
    assert!(scoring.completed >= 1);
    assert!(scoring.completed < documents.len());
    assert_eq!(stage_status(&outcome.run, PipelineStage::ReportSynthesis), None);

    let cancelled = harness
        .store
        .scan(
            &TaskScan::in_states([TaskState::Failed])
                .kinds([TaskKind::RelevanceScoring])
                .run(outcome.run.id),
        )
        .unwrap();
    assert!(!cancelled.is_empty());
    assert!(cancelled.iter().all(|task| task.error.as_deref() == Some("cancelled")));
    let leftover = harness
        .store
        .scan(&TaskScan::in_states([TaskState::Pending, TaskState::Leased]))
        .unwrap();
    assert!(leftover.is_empty());
}

#[tokio::test]
async fn inference_calls_never_overlap() {
    let backend = Arc::new(PipelineBackend::default());
    let mut config = test_config();
    config.orchestrator.worker_concurrency = 4;
    let documents: Vec<_> = (1..=6).map(|id| document(id, &format!("Trial {id}"))).collect();
    let harness = harness_with(
        "workflow-serial-inference",
        config,
        backend.clone(),
        &documents,
        tracing_progress(),
    );

    let outcome = harness
        .orchestrator
        .run_workflow("Does aspirin prevent stroke?", &RunCancellation::new())
        .await
        .unwrap();

    assert_eq!(outcome.run.status, RunStatus::Succeeded);
    assert!(backend.calls.load(Ordering::SeqCst) > documents.len());
    assert_eq!(backend.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connection_checks_wait_for_the_inference_gate() {
    let backend = Arc::new(PipelineBackend::default());
    let documents: Vec<_> = (1..=4).map(|id| document(id, &format!("Trial {id}"))).collect();
    let harness = harness("workflow-gated-checks", backend.clone(), &documents);
    let cancellation = RunCancellation::new();

    let (outcome, checks) = tokio::join!(
        harness
            .orchestrator
            .run_workflow("Does aspirin prevent stroke?", &cancellation),
        async {
            for _ in 0..30 {
                harness.orchestrator.test_connections().await?;
                tokio::task::yield_now().await;
            }
            Ok::<(), CoreError>(())
        }
    );

    assert_eq!(outcome.unwrap().run.status, RunStatus::Succeeded);
    checks.unwrap();
    assert_eq!(backend.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_citation_stage_reports_from_abstracts() {
    let backend = Arc::new(PipelineBackend {
        citation_fails: true,
        ..PipelineBackend::default()
    });
    let harness = harness(
        "workflow-citation-fallback",
        backend.clone(),
        &[document(1, "Trial One"), document(2, "Trial Two")],
    );

    let outcome = harness
        .orchestrator
        .run_workflow("Does aspirin prevent stroke?", &RunCancellation::new())
        .await
        .unwrap();

    assert_eq!(outcome.run.status, RunStatus::Partial);
    assert_eq!(
        stage_status(&outcome.run, PipelineStage::CitationExtraction),
        Some(StageStatus::Failed)
    );
    assert_eq!(
        stage_status(&outcome.run, PipelineStage::ReportSynthesis),
        Some(StageStatus::Completed)
    );
    let report = outcome.report.as_ref().unwrap();
    assert_eq!(report.cited.len(), 2);

    let prompts = backend.prompts.lock().unwrap();
    let report_prompt = prompts
        .iter()
        .find(|prompt| prompt.contains("evidence report"))
        .unwrap();
    assert!(report_prompt.contains("[1] Trial One: Trial 1: aspirin and stroke outcomes"));
    assert!(report_prompt.contains("[2] Trial Two: Trial 2: aspirin and stroke outcomes"));
    assert_eq!(
        harness.store.run_status(outcome.run.id).unwrap(),
        Some(RunStatus::Partial)
    );
}

#[tokio::test]
async fn connection_failure_stops_before_a_run_exists() {
    let backend = Arc::new(PipelineBackend {
        ping_fails: true,
        ..PipelineBackend::default()
    });
    let harness = harness("workflow-ping", backend, &[document(1, "Trial One")]);

    let error = harness
        .orchestrator
        .run_workflow("Does aspirin prevent stroke?", &RunCancellation::new())
        .await
        .unwrap_err();

    assert_eq!(error.kind, CoreErrorKind::ModelUnavailable);
    assert_eq!(error.task, Some(TaskKind::QueryGeneration));
    assert_eq!(harness.store.run_status(RunId(1)).unwrap(), None);
    assert_eq!(harness.store.state_counts(None).unwrap().total(), 0);
}

#[tokio::test]
async fn missing_stage_agent_is_a_config_error() {
    let backend = Arc::new(PipelineBackend::default());
    let mut config = test_config();
    config.orchestrator.counterfactual_enabled = true;
    let store = Arc::new(SqliteStore::new(test_db_path("workflow-missing-agent")));
    store.migrate_to_latest().unwrap();
    let mut agents = pipeline_agents(backend, &config);
    agents.retain(|agent| agent.descriptor().kind != TaskKind::CounterfactualAnalysis);
    let ctx = OrchestratorContext::new(
        config,
        store.clone(),
        store.clone(),
        store.clone(),
        AgentRegistry::new(agents).unwrap(),
        tracing_progress(),
    )
    .unwrap();

    let error = Orchestrator::new(ctx)
        .run_workflow("question", &RunCancellation::new())
        .await
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::FatalConfig);
    assert_eq!(store.state_counts(None).unwrap().total(), 0);
}

#[test]
fn duplicate_agent_registration_is_rejected() {
    let backend = Arc::new(PipelineBackend::default());
    let binding = ModelBinding::new(backend, WORKER_MODEL, Duration::from_secs(1));
    let agents: Vec<Arc<dyn Agent>> = vec![
        Arc::new(ScoringAgent::new(binding.clone())),
        Arc::new(ScoringAgent::new(binding)),
    ];
    let error = AgentRegistry::new(agents).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::InvalidInput);
}
