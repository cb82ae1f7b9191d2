use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lantern_core::models::{
    CoreError, CoreErrorKind, DocumentId, DocumentRecord, NewTask, PipelineStage, RunStatus,
    StageOutcome, StageStatus, TaskKind, TaskPriority, TaskState, WorkflowRun,
};
use lantern_core::persistence::{DocumentStore, MigrationStore, RunStore, TaskScan, TaskStore};
use lantern_core::sqlite::{SqliteStore, current_schema_version};
use serde_json::json;

fn test_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("lantern-{test_name}-{nanos}.sqlite3"))
}

fn migrated_store(test_name: &str) -> SqliteStore {
    let store = SqliteStore::new(test_db_path(test_name));
    store.migrate_to_latest().expect("migrations should apply");
    store
}

fn new_task(kind: TaskKind, priority: TaskPriority) -> NewTask {
    NewTask {
        run: None,
        kind,
        payload: json!({ "question": "does aspirin prevent stroke" }),
        priority,
        created_at: SystemTime::now(),
    }
}

fn document(id: i64, title: &str, abstract_text: &str) -> DocumentRecord {
    DocumentRecord {
        id: DocumentId(id),
        title: title.to_string(),
        abstract_text: abstract_text.to_string(),
        authors: Some("Doe J".to_string()),
        year: Some(2020),
    }
}

#[test]
fn queue_operations_require_migrated_schema() {
    let store = SqliteStore::new(test_db_path("unmigrated"));
    let error = store
        .append(&new_task(TaskKind::QueryGeneration, TaskPriority::High))
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);
    assert!(error.message.contains("not initialized"));
}

#[test]
fn migrate_up_and_down_round_trips_schema_version() {
    let store = migrated_store("migrate-round-trip");
    assert_eq!(store.current_version().unwrap(), current_schema_version());

    store.apply_migration(0).unwrap();
    assert_eq!(store.current_version().unwrap(), 0);

    store.apply_migration(current_schema_version()).unwrap();
    assert_eq!(store.current_version().unwrap(), current_schema_version());
}

#[test]
fn appended_tasks_survive_reopening_the_database() {
    let path = test_db_path("durable-reopen");
    let appended = {
        let store = SqliteStore::new(&path);
        store.migrate_to_latest().unwrap();
        store
            .append(&new_task(TaskKind::RelevanceScoring, TaskPriority::Normal))
            .unwrap()
    };

    let reopened = SqliteStore::new(&path);
    let record = reopened.get(appended.id).unwrap().expect("task persisted");
    assert_eq!(record.kind, TaskKind::RelevanceScoring);
    assert_eq!(record.priority, TaskPriority::Normal);
    assert_eq!(record.state, TaskState::Pending);
    assert_eq!(record.payload, appended.payload);
    assert_eq!(record.attempts, 0);
}

#[test]
fn failed_mutation_rolls_back() {
    let store = migrated_store("mutation-rollback");
    let task = store
        .append(&new_task(TaskKind::ReportSynthesis, TaskPriority::Normal))
        .unwrap();

    let error = store
        .update(task.id, &mut |record| {
            record.state = TaskState::Completed;
            record.attempts = 9;
            Err(CoreError::new(CoreErrorKind::LeaseLost, "simulated conflict"))
        })
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::LeaseLost);

    let unchanged = store.get(task.id).unwrap().unwrap();
    assert_eq!(unchanged.state, TaskState::Pending);
    assert_eq!(unchanged.attempts, 0);
}

#[test]
fn updating_unknown_task_is_not_found() {
    let store = migrated_store("update-unknown");
    let error = store
        .update(lantern_core::models::TaskId(4242), &mut |_| Ok(()))
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::NotFound);
}

#[test]
fn scan_orders_by_priority_then_insertion() {
    let store = migrated_store("scan-order");
    let low = store
        .append(&new_task(TaskKind::CitationExtraction, TaskPriority::Low))
        .unwrap();
    let normal_first = store
        .append(&new_task(TaskKind::CitationExtraction, TaskPriority::Normal))
        .unwrap();
    let high = store
        .append(&new_task(TaskKind::QueryGeneration, TaskPriority::High))
        .unwrap();
    let normal_second = store
        .append(&new_task(TaskKind::CitationExtraction, TaskPriority::Normal))
        .unwrap();

    let ordered: Vec<_> = store
        .scan(&TaskScan::default())
        .unwrap()
        .into_iter()
        .map(|record| record.id)
        .collect();
    assert_eq!(ordered, vec![high.id, normal_first.id, normal_second.id, low.id]);

    let citations_only = store
        .scan(
            &TaskScan::in_states([TaskState::Pending])
                .kinds([TaskKind::CitationExtraction])
                .limit(2),
        )
        .unwrap();
    assert_eq!(citations_only.len(), 2);
    assert_eq!(citations_only[0].id, normal_first.id);
}

#[test]
fn prune_terminal_removes_only_finished_tasks() {
    let store = migrated_store("prune-terminal");
    let finished = store
        .append(&new_task(TaskKind::RelevanceScoring, TaskPriority::Normal))
        .unwrap();
    let open = store
        .append(&new_task(TaskKind::RelevanceScoring, TaskPriority::Normal))
        .unwrap();
    store
        .update(finished.id, &mut |record| {
            record.state = TaskState::Completed;
            Ok(())
        })
        .unwrap();

    let pruned = store
        .prune_terminal(SystemTime::now() + Duration::from_secs(60))
        .unwrap();
    assert_eq!(pruned, 1);
    assert!(store.get(finished.id).unwrap().is_none());
    assert!(store.get(open.id).unwrap().is_some());

    let counts = store.state_counts(None).unwrap();
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.total(), 1);
}

#[test]
fn workflow_runs_persist_status_and_stages() {
    let store = migrated_store("workflow-runs");
    let run_id = store
        .create_run("does aspirin prevent stroke", SystemTime::now())
        .unwrap();
    assert_eq!(store.run_status(run_id).unwrap(), Some(RunStatus::Running));

    let mut run = WorkflowRun::start(run_id, "does aspirin prevent stroke");
    run.record_stage(StageOutcome {
        stage: PipelineStage::QueryGeneration,
        status: StageStatus::Completed,
        task_ids: Vec::new(),
        completed: 2,
        dead: 0,
        elapsed: Duration::from_millis(12),
        message: None,
    })
    .unwrap();
    run.finish().unwrap();
    store.update_run(&run).unwrap();

    assert_eq!(store.run_status(run_id).unwrap(), Some(RunStatus::Succeeded));
    let stages = store.run_stages(run_id).unwrap();
    assert_eq!(stages.len(), 1);
    assert_eq!(stages[0].completed, 2);
}

#[test]
fn find_ids_matches_boolean_expressions_case_insensitively() {
    let store = migrated_store("find-ids");
    store
        .insert_documents(&[
            document(1, "Cancer therapy outcomes", "Chemotherapy in adults."),
            document(2, "Radiation THERAPY", "Cancer patients treated with radiation."),
            document(3, "Diabetes management", "Insulin therapy."),
            document(4, "Cardiology review", "Stroke prevention with aspirin."),
        ])
        .unwrap();

    let ids = store.find_ids("cancer & therapy", 100).unwrap();
    assert_eq!(ids, vec![DocumentId(1), DocumentId(2)]);

    let ids = store.find_ids("insulin | aspirin", 100).unwrap();
    assert_eq!(ids, vec![DocumentId(3), DocumentId(4)]);

    let capped = store.find_ids("therapy", 2).unwrap();
    assert_eq!(capped.len(), 2);

    let error = store.find_ids("  &  ", 10).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::QueryParseError);
}

#[test]
fn find_ids_respects_parenthesized_grouping() {
    let store = migrated_store("find-ids-grouping");
    store
        .insert_documents(&[
            document(1, "Aspirin and stroke", "Secondary prevention trial."),
            document(2, "Myocardial infarction outcomes", "Registry follow-up."),
            document(3, "Aspirin dosing", "Myocardial infarction after surgery."),
        ])
        .unwrap();

    let ids = store.find_ids("aspirin & (stroke | infarction)", 100).unwrap();
    assert_eq!(ids, vec![DocumentId(1), DocumentId(3)]);

    let error = store.find_ids("aspirin & (stroke | infarction", 100).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::QueryParseError);
}

#[test]
fn find_ids_folds_non_ascii_case() {
    let store = migrated_store("find-ids-unicode");
    store
        .insert_documents(&[
            document(1, "ÉTUDE clinique", "Essai randomisé."),
            document(2, "Übersicht", "GROẞE Kohorte."),
            document(3, "Clinical study", "Randomized trial."),
        ])
        .unwrap();

    assert_eq!(store.find_ids("étude", 10).unwrap(), vec![DocumentId(1)]);
    assert_eq!(store.find_ids("ÉTUDE", 10).unwrap(), vec![DocumentId(1)]);
    assert_eq!(store.find_ids("übersicht & kohorte", 10).unwrap(), vec![DocumentId(2)]);
}

#[test]
fn fetch_by_ids_batches_and_skips_unknown_ids() {
    let store = migrated_store("fetch-by-ids");
    store
        .insert_documents(&[
            document(10, "A", "alpha"),
            document(11, "B", "beta"),
            document(12, "C", "gamma"),
        ])
        .unwrap();

    let mut fetched = store
        .fetch_by_ids(&[DocumentId(12), DocumentId(99), DocumentId(10), DocumentId(11)], 2)
        .unwrap();
    fetched.sort_by_key(|record| record.id);
    let ids: Vec<_> = fetched.iter().map(|record| record.id).collect();
    assert_eq!(ids, vec![DocumentId(10), DocumentId(11), DocumentId(12)]);

    let error = store.fetch_by_ids(&[DocumentId(10)], 0).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::InvalidInput);
    store.ping().unwrap();
}
