//! Integration tests for the job manager.

use std::path::Path;
use std::sync::Arc;

use engine_spine::config::Config;
use engine_spine::engine::Engine;
use engine_spine::error::Error;
use engine_spine::event::{Event, EventKind};
use engine_spine::model::*;
use engine_spine::receipt::{Receipt, ReceiptStatus, sha256_hex};
use engine_spine::stream::{EventStream, StreamMessage};
use serde_json::json;
use tempfile::TempDir;

fn test_config(dir: &Path) -> Config {
    let mut config = Config::new(
        format!("sqlite://{}", dir.join("engine.db").display()),
        dir.join("workspaces"),
    );
    config.heartbeat_interval_ms = 200;
    config
}

async fn test_engine() -> (TempDir, Engine) {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(&test_config(dir.path())).await.unwrap();
    (dir, engine)
}

async fn create(engine: &Engine, config: serde_json::Value) -> JobId {
    engine
        .jobs()
        .create(NewJob::new(config))
        .await
        .unwrap()
        .into_job()
        .job_id
}

async fn next_events(stream: &mut EventStream, n: usize) -> Vec<Event> {
    let mut out = Vec::new();
    while out.len() < n {
        match stream.next().await.unwrap() {
            Some(StreamMessage::Event(e)) => out.push(e),
            Some(StreamMessage::KeepAlive) => {}
            other => panic!("unexpected message: {other:?}"),
        }
    }
    out
}

fn state_change(event: &Event) -> (Option<JobState>, JobState) {
    match &event.kind {
        EventKind::JobStateChanged {
            old_state,
            new_state,
        } => (*old_state, *new_state),
        other => panic!("expected job.state_changed, got {other:?}"),
    }
}

fn read_receipt(job: &Job) -> (Vec<u8>, Receipt) {
    let bytes = std::fs::read(job.workspace_path.join("receipt.json")).unwrap();
    let receipt = serde_json::from_slice(&bytes).unwrap();
    (bytes, receipt)
}

// ---------------------------------------------------------------------------
// Lifecycle: create → claim → progress → complete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_claim_progress_complete_is_observed_in_order() {
    let (_dir, engine) = test_engine().await;
    let mut stream = engine.attach_stream(Some(0), None);
    assert!(stream.drain_replay().await.unwrap().is_empty());

    let j1 = engine
        .jobs()
        .create(NewJob::new(json!({"text": "a"})).idempotency_key("k1"))
        .await
        .unwrap();
    assert!(j1.is_created());
    let j1 = j1.into_job();
    assert_eq!(j1.state, JobState::Queued);

    let again = engine
        .jobs()
        .create(NewJob::new(json!({"text": "b"})).idempotency_key("k1"))
        .await
        .unwrap();
    assert!(!again.is_created());
    assert_eq!(again.job().job_id, j1.job_id);
    assert_eq!(again.job().config, json!({"text": "a"}));

    let running = engine.jobs().claim(&j1.job_id).await.unwrap();
    assert_eq!(running.state, JobState::Running);
    assert!(running.started_at.is_some());
    assert_eq!(running.claim_attempts, 1);

    engine
        .jobs()
        .emit_progress(&j1.job_id, ProgressUpdate::new("parsing").percent(50))
        .await
        .unwrap();

    let receipt = engine.jobs().complete(&j1.job_id, vec![]).await.unwrap();
    assert_eq!(receipt.receipt_status, ReceiptStatus::Completed);
    assert_eq!(receipt.job_id, j1.job_id);

    let events = next_events(&mut stream, 4).await;
    let seqs: Vec<i64> = events.iter().map(|e| e.sequence_number).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "not increasing: {seqs:?}");

    assert_eq!(state_change(&events[0]), (None, JobState::Queued));
    assert_eq!(
        state_change(&events[1]),
        (Some(JobState::Queued), JobState::Running)
    );
    assert!(matches!(
        &events[2].kind,
        EventKind::JobProgress { phase, progress_percent: Some(50), .. } if phase == "parsing"
    ));
    assert_eq!(
        state_change(&events[3]),
        (Some(JobState::Running), JobState::Completed)
    );

    let done = engine.jobs().get(&j1.job_id).await.unwrap();
    assert_eq!(done.state, JobState::Completed);
    assert!(done.completed_at.is_some());
}

#[tokio::test]
async fn create_provisions_exclusive_workspace() {
    let (_dir, engine) = test_engine().await;
    let a = engine.jobs().get(&create(&engine, json!({})).await).await.unwrap();
    let b = engine.jobs().get(&create(&engine, json!({})).await).await.unwrap();

    assert_ne!(a.job_id, b.job_id);
    assert_ne!(a.workspace_path, b.workspace_path);
    for sub in ["input", "output", "temp"] {
        assert!(a.workspace_path.join(sub).is_dir(), "missing {sub}");
    }
    assert!(!a.workspace_path.join("receipt.json").exists());
    assert_eq!(a.config_hash.len(), 16);
}

#[tokio::test]
async fn idempotent_create_ignores_new_config() {
    let (_dir, engine) = test_engine().await;
    let first = engine
        .jobs()
        .create(NewJob::new(json!({"v": 1})).idempotency_key("same"))
        .await
        .unwrap()
        .into_job();
    let second = engine
        .jobs()
        .create(NewJob::new(json!({"v": 2})).idempotency_key("same"))
        .await
        .unwrap()
        .into_job();

    assert_eq!(first.job_id, second.job_id);
    assert_eq!(second.config, json!({"v": 1}));
    assert_eq!(second.config_hash, first.config_hash);
    assert_eq!(engine.jobs().list(&[], 10).await.unwrap().len(), 1);
    // Only the original creation produced an event.
    assert_eq!(engine.db().current_max_sequence().await.unwrap(), 1);
}

#[tokio::test]
async fn view_exposes_job_fields() {
    let (_dir, engine) = test_engine().await;
    let id = create(&engine, json!({"mode": "fast"})).await;
    engine.jobs().claim(&id).await.unwrap();
    engine
        .jobs()
        .emit_progress(&id, ProgressUpdate::new("render").percent(30))
        .await
        .unwrap();

    let view = engine.jobs().view(&id).await.unwrap();
    assert_eq!(view.job_id, id);
    assert_eq!(view.state, JobState::Running);
    assert_eq!(view.config, json!({"mode": "fast"}));
    assert_eq!(view.progress_percent, Some(30));
    assert_eq!(view.progress_phase.as_deref(), Some("render"));
    assert!(view.error_code.is_none());
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_job_is_rejected() {
    let (_dir, engine) = test_engine().await;
    let err = engine.jobs().claim(&JobId::from("job_missing")).await.unwrap_err();
    assert!(matches!(err, Error::JobNotFound(_)));
    assert!(err.is_validation());
}

#[tokio::test]
async fn second_claim_is_rejected() {
    let (_dir, engine) = test_engine().await;
    let id = create(&engine, json!({})).await;
    engine.jobs().claim(&id).await.unwrap();

    let err = engine.jobs().claim(&id).await.unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: JobState::Running,
            to: JobState::Running
        }
    ));
    assert_eq!(engine.jobs().get(&id).await.unwrap().claim_attempts, 1);
}

#[tokio::test]
async fn queued_job_cannot_complete() {
    let (_dir, engine) = test_engine().await;
    let id = create(&engine, json!({})).await;

    let err = engine.jobs().complete(&id, vec![]).await.unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: JobState::Queued,
            to: JobState::Completed
        }
    ));

    let job = engine.jobs().get(&id).await.unwrap();
    assert_eq!(job.state, JobState::Queued);
    assert!(job.receipt_hash.is_none());
    assert!(!job.workspace_path.join("receipt.json").exists());
}

#[tokio::test]
async fn terminal_job_rejects_progress_logs_and_second_finish() {
    let (_dir, engine) = test_engine().await;
    let id = create(&engine, json!({})).await;
    engine.jobs().claim(&id).await.unwrap();
    engine.jobs().complete(&id, vec![]).await.unwrap();
    let before = engine.db().current_max_sequence().await.unwrap();

    let err = engine
        .jobs()
        .emit_progress(&id, ProgressUpdate::new("late"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::JobTerminal { state: JobState::Completed, .. }));

    let err = engine
        .jobs()
        .emit_log(&id, JobLogEntry::new(LogLevel::Info, "exec", "late"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::JobTerminal { .. }));

    let err = engine.jobs().fail(&id, "E_X", "late", None).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { from: JobState::Completed, .. }));

    assert_eq!(engine.db().current_max_sequence().await.unwrap(), before);
}

// ---------------------------------------------------------------------------
// Progress and logs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn progress_and_logs_share_a_per_job_counter() {
    let (_dir, engine) = test_engine().await;
    let a = create(&engine, json!({})).await;
    let b = create(&engine, json!({})).await;
    engine.jobs().claim(&a).await.unwrap();
    engine.jobs().claim(&b).await.unwrap();

    let p1 = engine.jobs().emit_progress(&a, ProgressUpdate::new("one")).await.unwrap();
    let l1 = engine
        .jobs()
        .emit_log(&a, JobLogEntry::new(LogLevel::Warn, "parser", "odd input").payload(json!({"line": 3})))
        .await
        .unwrap();
    let b1 = engine.jobs().emit_progress(&b, ProgressUpdate::new("one")).await.unwrap();
    let p2 = engine.jobs().emit_progress(&a, ProgressUpdate::new("two")).await.unwrap();

    assert_eq!(p1.job_sequence, Some(1));
    assert_eq!(l1.job_sequence, Some(2));
    assert_eq!(p2.job_sequence, Some(3));
    assert_eq!(b1.job_sequence, Some(1));
    assert!(p1.sequence_number < l1.sequence_number);
    assert!(b1.sequence_number < p2.sequence_number);

    let history = engine.db().events_since(0, Some(&a), None).await.unwrap();
    let state_changes: Vec<_> = history
        .iter()
        .filter(|e| e.event_type() == "job.state_changed")
        .collect();
    assert!(state_changes.iter().all(|e| e.job_sequence.is_none()));
}

#[tokio::test]
async fn progress_updates_job_row_and_keeps_unreported_fields() {
    let (_dir, engine) = test_engine().await;
    let id = create(&engine, json!({})).await;
    engine.jobs().claim(&id).await.unwrap();

    engine
        .jobs()
        .emit_progress(&id, ProgressUpdate::new("scan").percent(40).items(4, 10).eta_seconds(12))
        .await
        .unwrap();
    engine
        .jobs()
        .emit_progress(&id, ProgressUpdate::new("render"))
        .await
        .unwrap();

    let job = engine.jobs().get(&id).await.unwrap();
    assert_eq!(job.progress.phase.as_deref(), Some("render"));
    assert_eq!(job.progress.percent, Some(40));
    assert_eq!(job.progress.items_completed, Some(4));
    assert_eq!(job.progress.items_total, Some(10));
    assert!(job.last_heartbeat_at.is_some());
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_queued_job_goes_straight_to_cancelled() {
    let (_dir, engine) = test_engine().await;
    let id = create(&engine, json!({})).await;

    let receipt = engine.jobs().cancel(&id).await.unwrap();
    assert_eq!(receipt.receipt_status, ReceiptStatus::Cancelled);
    assert!(receipt.timestamps.started.is_none());

    let events = engine.db().events_since(0, Some(&id), None).await.unwrap();
    let changes: Vec<_> = events.iter().map(state_change).collect();
    assert_eq!(
        changes,
        vec![
            (None, JobState::Queued),
            (Some(JobState::Queued), JobState::Cancelled)
        ]
    );
    assert!(engine.jobs().is_cancellation_requested(&id).await.unwrap());
}

#[tokio::test]
async fn cancel_running_job_passes_through_cancelling() {
    let (_dir, engine) = test_engine().await;
    let id = create(&engine, json!({})).await;
    engine.jobs().claim(&id).await.unwrap();
    assert!(!engine.jobs().is_cancellation_requested(&id).await.unwrap());

    let receipt = engine.jobs().cancel(&id).await.unwrap();
    assert_eq!(receipt.receipt_status, ReceiptStatus::Cancelled);
    assert!(receipt.timestamps.started.is_some());

    let events = engine.db().events_since(0, Some(&id), None).await.unwrap();
    let changes: Vec<_> = events.iter().map(state_change).collect();
    assert_eq!(
        changes[2..],
        [
            (Some(JobState::Running), JobState::Cancelling),
            (Some(JobState::Cancelling), JobState::Cancelled)
        ]
    );
    assert_eq!(engine.jobs().get(&id).await.unwrap().state, JobState::Cancelled);
}

#[tokio::test]
async fn cancel_terminal_job_is_rejected() {
    let (_dir, engine) = test_engine().await;
    let id = create(&engine, json!({})).await;
    engine.jobs().cancel(&id).await.unwrap();

    let err = engine.jobs().cancel(&id).await.unwrap_err();
    assert!(matches!(err, Error::JobTerminal { state: JobState::Cancelled, .. }));
}

// ---------------------------------------------------------------------------
// Failure and receipts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fail_records_executor_error_unchanged() {
    let (_dir, engine) = test_engine().await;
    let id = create(&engine, json!({})).await;
    engine.jobs().claim(&id).await.unwrap();

    let receipt = engine
        .jobs()
        .fail(&id, "E_PARSE", "bad token at 3:14", Some(json!({"line": 3})))
        .await
        .unwrap();
    assert_eq!(receipt.receipt_status, ReceiptStatus::Failed);
    assert_eq!(receipt.exit_code.as_deref(), Some("E_PARSE"));

    let job = engine.jobs().get(&id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.error_code.as_deref(), Some("E_PARSE"));
    assert_eq!(job.error_message.as_deref(), Some("bad token at 3:14"));
    assert_eq!(job.error_details, Some(json!({"line": 3})));

    let (_, on_disk) = read_receipt(&job);
    assert_eq!(on_disk.error_code.as_deref(), Some("E_PARSE"));
    assert_eq!(on_disk.error_details, Some(json!({"line": 3})));
}

#[tokio::test]
async fn receipt_is_read_only_and_matches_stored_hash() {
    let (_dir, engine) = test_engine().await;
    let id = create(&engine, json!({"input_paths": ["a.txt", "b.txt"]})).await;
    engine.jobs().claim(&id).await.unwrap();

    let outputs = vec![OutputArtifact {
        path: "output/result.json".into(),
        size_bytes: 12,
        sha256: "ab".repeat(32),
    }];
    let receipt = engine.jobs().complete(&id, outputs.clone()).await.unwrap();
    assert_eq!(receipt.outputs, outputs);
    assert_eq!(receipt.inputs_summary["paths"], json!(["a.txt", "b.txt"]));
    assert_eq!(receipt.schema_version, "1.0");
    assert_ne!(receipt.run_id, id.as_str());

    let job = engine.jobs().get(&id).await.unwrap();
    let (bytes, on_disk) = read_receipt(&job);
    assert_eq!(on_disk, receipt);
    assert_eq!(job.receipt_hash.as_deref(), Some(sha256_hex(&bytes).as_str()));
    assert_eq!(job.receipt, Some(serde_json::from_slice::<serde_json::Value>(&bytes).unwrap()));

    let meta = std::fs::metadata(job.workspace_path.join("receipt.json")).unwrap();
    assert!(meta.permissions().readonly());
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(meta.permissions().mode() & 0o777, 0o444);
    }

    assert!(engine.jobs().verify_receipt(&id).await.unwrap());

    let artifacts = engine.jobs().artifacts(&id).await.unwrap();
    assert_eq!(artifacts.len(), 2);
    assert_eq!(artifacts[0].artifact_type, "receipt");
    assert_eq!(artifacts[0].sha256, job.receipt_hash);
    assert_eq!(artifacts[1].artifact_type, "output");
    assert_eq!(artifacts[1].name, "result.json");
    assert!(artifacts.iter().all(|a| a.status == "complete"));
}

#[cfg(unix)]
#[tokio::test]
async fn tampered_receipt_fails_verification() {
    use std::os::unix::fs::PermissionsExt;

    let (_dir, engine) = test_engine().await;
    let id = create(&engine, json!({})).await;
    engine.jobs().claim(&id).await.unwrap();
    engine.jobs().complete(&id, vec![]).await.unwrap();

    let path = engine.jobs().get(&id).await.unwrap().workspace_path.join("receipt.json");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
    std::fs::write(&path, b"{}").unwrap();

    assert!(!engine.jobs().verify_receipt(&id).await.unwrap());
}

#[tokio::test]
async fn concurrent_completions_leave_clean_workspaces() {
    let (_dir, engine) = test_engine().await;
    let engine = Arc::new(engine);

    let mut ids = Vec::new();
    for i in 0..12 {
        let id = create(&engine, json!({"n": i})).await;
        engine.jobs().claim(&id).await.unwrap();
        ids.push(id);
    }

    let mut handles = Vec::new();
    for id in ids.clone() {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            engine.jobs().complete(&id, vec![]).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for id in &ids {
        let job = engine.jobs().get(id).await.unwrap();
        assert_eq!(job.state, JobState::Completed);

        let mut names: Vec<String> = std::fs::read_dir(&job.workspace_path)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, ["input", "output", "receipt.json", "temp"]);

        let (bytes, receipt) = read_receipt(&job);
        assert_eq!(&receipt.job_id, id);
        assert_eq!(job.receipt_hash.as_deref(), Some(sha256_hex(&bytes).as_str()));
    }
}

// ---------------------------------------------------------------------------
// Queue reads and safe mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn next_queued_is_fifo_and_list_filters_by_state() {
    let (_dir, engine) = test_engine().await;
    let first = create(&engine, json!({})).await;
    let second = create(&engine, json!({})).await;
    let third = create(&engine, json!({})).await;

    assert_eq!(engine.jobs().next_queued().await.unwrap(), Some(first.clone()));
    engine.jobs().claim(&first).await.unwrap();
    assert_eq!(engine.jobs().next_queued().await.unwrap(), Some(second.clone()));

    let queued = engine.jobs().list(&[JobState::Queued], 10).await.unwrap();
    let queued_ids: Vec<_> = queued.into_iter().map(|j| j.job_id).collect();
    assert_eq!(queued_ids, vec![third, second]);

    let running = engine.jobs().list(&[JobState::Running], 10).await.unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(engine.jobs().list(&[], 2).await.unwrap().len(), 2);
}

#[tokio::test]
async fn safe_mode_blocks_claim_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.safe_mode = true;
    let engine = Engine::open(&config).await.unwrap();

    let id = create(&engine, json!({})).await;
    let err = engine.jobs().claim(&id).await.unwrap_err();
    assert!(matches!(err, Error::SafeMode));
    assert_eq!(engine.jobs().get(&id).await.unwrap().state, JobState::Queued);

    engine.jobs().cancel(&id).await.unwrap();

    engine.status().set_safe_mode(false);
    let other = create(&engine, json!({})).await;
    engine.jobs().claim(&other).await.unwrap();
}

fn quarantined_receipts(workspace: &Path) -> Vec<String> {
    std::fs::read_dir(workspace)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("receipt.quarantined."))
        .collect()
}

/// Run a statement on the engine's database from a separate connection.
async fn side_exec(dir: &Path, sql: &str) {
    let pool = sqlx::SqlitePool::connect(&test_config(dir).database_url)
        .await
        .unwrap();
    sqlx::query(sql).execute(&pool).await.unwrap();
    pool.close().await;
}

#[tokio::test]
async fn finish_rolled_back_after_receipt_write_can_be_retried() {
    let (dir, engine) = test_engine().await;
    let id = create(&engine, json!({})).await;
    engine.jobs().claim(&id).await.unwrap();
    let workspace = engine.jobs().get(&id).await.unwrap().workspace_path;

    // Artifact registration runs after the receipt is on disk.
    side_exec(dir.path(), "ALTER TABLE artifacts RENAME TO artifacts_offline").await;
    assert!(engine.jobs().complete(&id, vec![]).await.is_err());

    let job = engine.jobs().get(&id).await.unwrap();
    assert_eq!(job.state, JobState::Running);
    assert!(job.receipt_hash.is_none());
    assert!(!workspace.join("receipt.json").exists());
    assert_eq!(quarantined_receipts(&workspace).len(), 1);
    let events = engine.db().events_since(0, Some(&id), None).await.unwrap();
    assert_eq!(events.len(), 2);

    side_exec(dir.path(), "ALTER TABLE artifacts_offline RENAME TO artifacts").await;
    let receipt = engine.jobs().complete(&id, vec![]).await.unwrap();
    assert_eq!(receipt.receipt_status, ReceiptStatus::Completed);

    let job = engine.jobs().get(&id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert!(engine.jobs().verify_receipt(&id).await.unwrap());
    assert!(
        std::fs::metadata(workspace.join("receipt.json"))
            .unwrap()
            .permissions()
            .readonly()
    );
    let terminal = engine
        .db()
        .events_since(0, Some(&id), None)
        .await
        .unwrap()
        .iter()
        .filter(|e| matches!(&e.kind, EventKind::JobStateChanged { new_state, .. } if new_state.is_terminal()))
        .count();
    assert_eq!(terminal, 1);
}

#[tokio::test]
async fn stray_receipt_on_running_job_is_set_aside_at_finish() {
    let (_dir, engine) = test_engine().await;
    let id = create(&engine, json!({})).await;
    engine.jobs().claim(&id).await.unwrap();
    let workspace = engine.jobs().get(&id).await.unwrap().workspace_path;
    std::fs::write(workspace.join("receipt.json"), b"{}").unwrap();

    engine
        .jobs()
        .fail(&id, "E_INPUT", "bad input", None)
        .await
        .unwrap();

    assert!(engine.jobs().verify_receipt(&id).await.unwrap());
    let quarantined = quarantined_receipts(&workspace);
    assert_eq!(quarantined.len(), 1);
    assert_eq!(std::fs::read(workspace.join(&quarantined[0])).unwrap(), b"{}");
}
