//! spine CLI: operator interface to the job/event engine.
//!
//! `serve`, `job submit` and `job cancel` open the engine (and therefore run
//! crash recovery), so they expect no other engine process on the same
//! database. The read-only commands only query the store.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use engine_spine::config::Config;
use engine_spine::db::Db;
use engine_spine::engine::Engine;
use engine_spine::model::{JobId, JobState, NewJob};
use engine_spine::receipt::ReceiptWriter;
use engine_spine::stream::StreamMessage;
use engine_spine::telemetry::{TelemetryConfig, init_telemetry};
use engine_spine::workspace::Workspace;

#[derive(Parser)]
#[command(name = "spine", about = "Job/event engine with durable replay and receipts")]
struct Cli {
    /// TOML config file; environment variables override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine: recover, heartbeat, and tail events until ctrl-c
    Serve {
        /// Replay from this sequence number before tailing
        #[arg(long)]
        since: Option<i64>,
        /// Grace period announced on shutdown, in milliseconds
        #[arg(long, default_value_t = 5_000)]
        grace_ms: u64,
    },
    /// Job operations
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// Print persisted events
    Events {
        /// Only events after this sequence number
        #[arg(long, default_value_t = 0)]
        since: i64,
        /// Only events for this job
        #[arg(long)]
        job: Option<String>,
        /// Maximum events to print
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Receipt operations
    Receipt {
        #[command(subcommand)]
        action: ReceiptAction,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Submit a new job
    Submit {
        /// JSON config for the job
        #[arg(long, default_value = "{}")]
        config: String,
        /// Idempotency key
        #[arg(long)]
        key: Option<String>,
    },
    /// List jobs
    List {
        /// Filter by state (repeatable)
        #[arg(long)]
        state: Vec<String>,
        /// Maximum jobs to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show a job
    Show { id: String },
    /// Cancel a job
    Cancel { id: String },
}

#[derive(Subcommand)]
enum ReceiptAction {
    /// Check a job's receipt file against its stored hash
    Verify { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let _guard = init_telemetry(TelemetryConfig::from(&config))?;

    match cli.command {
        Command::Serve { since, grace_ms } => cmd_serve(&config, since, grace_ms).await,
        Command::Job { action } => match action {
            JobAction::Submit { config: job_config, key } => {
                cmd_job_submit(&config, job_config, key).await
            }
            JobAction::List { state, limit } => cmd_job_list(&config, state, limit).await,
            JobAction::Show { id } => cmd_job_show(&config, id).await,
            JobAction::Cancel { id } => cmd_job_cancel(&config, id).await,
        },
        Command::Events { since, job, limit } => cmd_events(&config, since, job, limit).await,
        Command::Receipt {
            action: ReceiptAction::Verify { id },
        } => cmd_receipt_verify(&config, id).await,
    }
}

async fn open_db(config: &Config) -> anyhow::Result<Db> {
    let db = Db::connect(&config.database_url).await?;
    db.migrate().await?;
    Ok(db)
}

async fn cmd_serve(config: &Config, since: Option<i64>, grace_ms: u64) -> anyhow::Result<()> {
    let engine = Engine::open(config).await?;
    for id in engine.recovered_jobs() {
        println!("recovered: {id} (failed with E_ENGINE_CRASH)");
    }

    let mut stream = engine.attach_stream(since, None);
    engine.start_heartbeat();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            msg = stream.next() => match msg? {
                Some(StreamMessage::KeepAlive) => {}
                Some(msg) => print!("{}", msg.to_sse_frame()?),
                None => break,
            },
        }
    }

    engine
        .shutdown("operator interrupt", Duration::from_millis(grace_ms))
        .await?;
    engine.close().await;
    Ok(())
}

async fn cmd_job_submit(config: &Config, job_config: String, key: Option<String>) -> anyhow::Result<()> {
    let job_config: serde_json::Value = serde_json::from_str(&job_config)?;
    let mut new = NewJob::new(job_config);
    if let Some(key) = key {
        new = new.idempotency_key(key);
    }

    let engine = Engine::open(config).await?;
    let result = engine.jobs().create(new).await?;
    let label = if result.is_created() { "Created" } else { "Existing" };
    let job = result.into_job();
    println!("{label}: {} (state: {})", job.job_id, job.state);
    engine.close().await;
    Ok(())
}

async fn cmd_job_list(config: &Config, states: Vec<String>, limit: i64) -> anyhow::Result<()> {
    let states = states
        .iter()
        .map(|s| s.parse::<JobState>())
        .collect::<Result<Vec<_>, _>>()?;

    let db = open_db(config).await?;
    let jobs = db.list_jobs(&states, limit).await?;

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<32}  {:<10}  {:<8}  {:<16}  CREATED",
        "ID", "STATE", "PROGRESS", "ERROR"
    );
    println!("{}", "-".repeat(90));
    for job in &jobs {
        let progress = job
            .progress
            .percent
            .map(|p| format!("{p}%"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<32}  {:<10}  {:<8}  {:<16}  {}",
            job.job_id,
            job.state,
            progress,
            job.error_code.as_deref().unwrap_or("-"),
            job.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} job(s)", jobs.len());
    Ok(())
}

async fn cmd_job_show(config: &Config, id: String) -> anyhow::Result<()> {
    let db = open_db(config).await?;
    let job = db.get_job(&JobId::from(id)).await?;

    println!("ID:         {}", job.job_id);
    println!("State:      {}", job.state);
    println!("Config:     {}", serde_json::to_string_pretty(&job.config)?);
    println!("Config Hash: {}", job.config_hash);
    println!("Key:        {}", job.idempotency_key.as_deref().unwrap_or("-"));
    println!("Workspace:  {}", job.workspace_path.display());
    println!("Created:    {}", job.created_at);
    if let Some(started) = job.started_at {
        println!("Started:    {started}");
    }
    if let Some(completed) = job.completed_at {
        println!("Completed:  {completed}");
    }
    if let Some(phase) = &job.progress.phase {
        println!(
            "Progress:   {phase} {}",
            job.progress
                .percent
                .map(|p| format!("{p}%"))
                .unwrap_or_default()
        );
    }
    println!("Attempts:   {}", job.claim_attempts);
    if let Some(code) = &job.error_code {
        println!("---");
        println!("Error:      {code}: {}", job.error_message.as_deref().unwrap_or(""));
    }
    if let Some(hash) = &job.receipt_hash {
        println!("Receipt:    sha256:{hash}");
    }
    Ok(())
}

async fn cmd_job_cancel(config: &Config, id: String) -> anyhow::Result<()> {
    let engine = Engine::open(config).await?;
    let receipt = engine.jobs().cancel(&JobId::from(id)).await?;
    println!("Cancelled: {} (run {})", receipt.job_id, receipt.run_id);
    engine.close().await;
    Ok(())
}

async fn cmd_events(
    config: &Config,
    since: i64,
    job: Option<String>,
    limit: Option<i64>,
) -> anyhow::Result<()> {
    let db = open_db(config).await?;
    let job = job.map(JobId::from);
    let events = db.events_since(since, job.as_ref(), limit).await?;
    for event in &events {
        println!("{}", serde_json::to_string(event)?);
    }
    Ok(())
}

async fn cmd_receipt_verify(config: &Config, id: String) -> anyhow::Result<()> {
    let db = open_db(config).await?;
    let job = db.get_job(&JobId::from(id)).await?;
    let Some(expected) = job.receipt_hash.as_deref() else {
        anyhow::bail!("job {} has no receipt", job.job_id);
    };

    let path = Workspace::at(&job.workspace_path).receipt_path();
    if ReceiptWriter.verify(&path, expected).await? {
        println!("OK: {} matches sha256:{expected}", path.display());
        Ok(())
    } else {
        anyhow::bail!("MISMATCH: {} does not match sha256:{expected}", path.display())
    }
}
