//! Wiring: settings → Postgres adapters → provider → processor → worker.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{info, warn};

use feedq_ai::ChatFeedbackProvider;
use feedq_core::{JobId, SubjectId};
use feedq_infra::db;
use feedq_infra::jobs::{EnqueueOutcome, Job, JobProcessor, JobStore, PostgresJobStore};
use feedq_infra::workers::FeedbackWorker;
use feedq_infra::{Guard, PostgresResultSink, PostgresSubjectSource, Settings};

use crate::cli::{Cli, Command};

pub async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::from_env().context("invalid configuration")?;
    let database_url = settings.require_database_url()?;

    let max_connections = settings.guard.max_concurrency as u32 + 2;
    let pool = db::connect(database_url, max_connections)
        .await
        .context("failed to connect to database")?;
    db::apply_schema(&pool)
        .await
        .context("failed to apply schema")?;

    let store = Arc::new(PostgresJobStore::new(pool.clone()));

    match cli.command() {
        Command::Run => {
            let processor = build_processor(&settings, pool, store)?;
            let handle = FeedbackWorker::new(processor, settings.worker_config()).spawn();

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            info!("shutdown requested");
            handle.shutdown_and_wait().await;
        }
        Command::Once => {
            let processor = build_processor(&settings, pool, store)?;
            let outcome = processor.process_once(settings.batch_size).await?;
            println!("{}", serde_json::to_string(&outcome)?);
        }
        Command::Enqueue { subject_id, group } => {
            let mut job = Job::new(SubjectId::from_uuid(subject_id)).with_max_attempts(settings.max_attempts);
            if let Some(group) = group {
                job = job.with_group_key(group);
            }
            match store.enqueue(job).await? {
                EnqueueOutcome::Created(id) => info!(job_id = %id, "job enqueued"),
                EnqueueOutcome::Duplicate(id) => {
                    info!(job_id = %id, "subject already has an unfinished job")
                }
            }
        }
        Command::Stats => {
            let stats = store.stats().await?;
            println!("{}", serde_json::to_string(&stats)?);
        }
        Command::Show { job_id } => {
            let job = store
                .get(JobId::from_uuid(job_id))
                .await?
                .with_context(|| format!("job {job_id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
    }

    Ok(())
}

/// Assemble the processor over Postgres adapters and the HTTP provider.
pub fn build_processor(
    settings: &Settings,
    pool: PgPool,
    store: Arc<PostgresJobStore>,
) -> Result<Arc<JobProcessor>> {
    if !settings.provider.enabled {
        warn!("AI_ENABLED is off; claimed jobs will be dead-lettered with REAL_DISABLED");
    }

    let provider = ChatFeedbackProvider::from_config(settings.provider.clone())
        .context("failed to build feedback provider")?;

    Ok(Arc::new(JobProcessor::new(
        store,
        Arc::new(PostgresSubjectSource::new(pool.clone())),
        Arc::new(PostgresResultSink::new(pool)),
        Arc::new(provider),
        Arc::new(Guard::new(settings.guard.clone())),
        settings.processor_config(),
    )))
}
