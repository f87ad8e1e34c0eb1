//! Crash recovery tests: open an engine, abandon it mid-flight, reopen the
//! same store and check what the new process finds.

use std::path::Path;
use std::sync::Arc;

use engine_spine::config::Config;
use engine_spine::engine::{E_ENGINE_CRASH, Engine};
use engine_spine::event::{Event, EventKind};
use engine_spine::model::*;
use engine_spine::receipt::{Receipt, ReceiptStatus, sha256_hex};
use serde_json::json;

fn test_config(dir: &Path) -> Config {
    Config::new(
        format!("sqlite://{}", dir.join("engine.db").display()),
        dir.join("workspaces"),
    )
}

async fn create(engine: &Engine) -> JobId {
    engine
        .jobs()
        .create(NewJob::new(json!({})))
        .await
        .unwrap()
        .into_job()
        .job_id
}

/// Force a job into `cancelling` the way a process that died between the
/// two halves of a cancel would leave it.
async fn force_cancelling(config: &Config, id: &JobId) {
    let pool = sqlx::SqlitePool::connect(&config.database_url).await.unwrap();
    sqlx::query("UPDATE jobs SET state = 'cancelling' WHERE job_id = ?1")
        .bind(id.as_str())
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;
}

fn terminal_changes(events: &[Event]) -> usize {
    events
        .iter()
        .filter(|e| {
            matches!(
                &e.kind,
                EventKind::JobStateChanged { new_state, .. } if new_state.is_terminal()
            )
        })
        .count()
}

// ---------------------------------------------------------------------------
// Restart after a crash
// ---------------------------------------------------------------------------

#[tokio::test]
async fn restart_fails_orphans_and_leaves_terminal_jobs_alone() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let (running, cancelling, completed, cancelled, queued, seq_before) = {
        let engine = Engine::open(&config).await.unwrap();
        assert!(engine.recovered_jobs().is_empty());

        let running = create(&engine).await;
        engine.jobs().claim(&running).await.unwrap();

        let cancelling = create(&engine).await;
        engine.jobs().claim(&cancelling).await.unwrap();

        let completed = create(&engine).await;
        engine.jobs().claim(&completed).await.unwrap();
        engine.jobs().complete(&completed, vec![]).await.unwrap();

        let cancelled = create(&engine).await;
        engine.jobs().cancel(&cancelled).await.unwrap();

        let queued = create(&engine).await;

        let seq = engine.db().current_max_sequence().await.unwrap();
        let completed = engine.jobs().get(&completed).await.unwrap();
        // No shutdown, no close: the process just goes away.
        drop(engine);
        (running, cancelling, completed, cancelled, queued, seq)
    };
    force_cancelling(&config, &cancelling).await;

    {
        let engine = Engine::open(&config).await.unwrap();
        let recovered = engine.recovered_jobs().to_vec();
        assert_eq!(recovered, vec![running.clone(), cancelling.clone()]);

        for (id, from) in [(&running, "running"), (&cancelling, "cancelling")] {
            let job = engine.jobs().get(id).await.unwrap();
            assert_eq!(job.state, JobState::Failed);
            assert_eq!(job.error_code.as_deref(), Some(E_ENGINE_CRASH));
            assert_eq!(job.error_message.as_deref(), Some("Engine terminated unexpectedly"));
            assert_eq!(job.error_details, Some(json!({ "recovered_from_state": from })));

            let path = job.workspace_path.join("receipt.json");
            let bytes = std::fs::read(&path).unwrap();
            assert_eq!(job.receipt_hash.as_deref(), Some(sha256_hex(&bytes).as_str()));
            assert!(std::fs::metadata(&path).unwrap().permissions().readonly());

            let receipt: Receipt = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(receipt.receipt_status, ReceiptStatus::Failed);
            assert_eq!(receipt.exit_code.as_deref(), Some(E_ENGINE_CRASH));
        }

        assert_eq!(engine.jobs().get(&queued).await.unwrap().state, JobState::Queued);
        assert_eq!(engine.jobs().get(&cancelled).await.unwrap().state, JobState::Cancelled);

        // Recovery events continue the sequence; nothing is reused.
        let new_events = engine.db().events_since(seq_before, None, None).await.unwrap();
        let seqs: Vec<i64> = new_events.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![seq_before + 1, seq_before + 2]);
        assert_eq!(terminal_changes(&new_events), 2);

        let untouched = engine.jobs().get(&completed.job_id).await.unwrap();
        assert_eq!(untouched.state, JobState::Completed);
        assert_eq!(untouched.updated_at, completed.updated_at);
        assert_eq!(untouched.receipt_hash, completed.receipt_hash);
    }

    // A second restart finds nothing left to recover.
    let engine = Engine::open(&config).await.unwrap();
    assert!(engine.recovered_jobs().is_empty());

    let next = create(&engine).await;
    let last = engine.db().events_since(0, Some(&next), None).await.unwrap();
    assert_eq!(last[0].sequence_number, seq_before + 3);
}

#[tokio::test]
async fn recovery_is_a_no_op_when_nothing_was_running() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let engine = Engine::open(&config).await.unwrap();
    create(&engine).await;
    let seq = engine.db().current_max_sequence().await.unwrap();
    engine.close().await;

    let engine = Engine::open(&config).await.unwrap();
    assert!(engine.recovered_jobs().is_empty());
    assert!(engine.jobs().recover_orphaned_jobs().await.unwrap().is_empty());
    assert_eq!(engine.db().current_max_sequence().await.unwrap(), seq);
}

#[tokio::test]
async fn stale_receipt_from_uncommitted_finish_is_quarantined() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let workspace = {
        let engine = Engine::open(&config).await.unwrap();
        let id = create(&engine).await;
        engine.jobs().claim(&id).await.unwrap();
        let job = engine.jobs().get(&id).await.unwrap();
        // The old process got as far as writing the file.
        std::fs::write(job.workspace_path.join("receipt.json"), b"{\"partial\":true}").unwrap();
        drop(engine);
        job.workspace_path
    };

    let engine = Engine::open(&config).await.unwrap();
    assert_eq!(engine.recovered_jobs().len(), 1);
    let id = &engine.recovered_jobs()[0];
    assert!(engine.jobs().verify_receipt(id).await.unwrap());

    let quarantined: Vec<_> = std::fs::read_dir(&workspace)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("receipt.quarantined."))
        .collect();
    assert_eq!(quarantined.len(), 1);
    let stale = std::fs::read(workspace.join(&quarantined[0])).unwrap();
    assert_eq!(stale, b"{\"partial\":true}");
}

// ---------------------------------------------------------------------------
// Races
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_racing_recovery_finishes_the_job_once() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(Engine::open(&test_config(dir.path())).await.unwrap());
    let id = create(&engine).await;
    engine.jobs().claim(&id).await.unwrap();

    let cancel = {
        let engine = Arc::clone(&engine);
        let id = id.clone();
        tokio::spawn(async move { engine.jobs().cancel(&id).await })
    };
    let recover = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.jobs().recover_orphaned_jobs().await })
    };
    let cancel = cancel.await.unwrap();
    let recovered = recover.await.unwrap().unwrap();

    let job = engine.jobs().get(&id).await.unwrap();
    match job.state {
        JobState::Cancelled => {
            assert!(cancel.is_ok());
            assert!(recovered.is_empty());
        }
        JobState::Failed => {
            assert!(cancel.is_err());
            assert_eq!(recovered, vec![id.clone()]);
        }
        other => panic!("job left in {other}"),
    }

    let events = engine.db().events_since(0, Some(&id), None).await.unwrap();
    assert_eq!(terminal_changes(&events), 1);
    assert!(engine.jobs().verify_receipt(&id).await.unwrap());
}
