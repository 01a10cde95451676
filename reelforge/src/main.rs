mod cli;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use reelforge::config::AppConfig;
use reelforge::credentials::KeyRotationManager;
use reelforge::database::repositories::{SqlxJobRepository, SqlxRotationRepository};
use reelforge::database::{init_pool, run_migrations};
use reelforge::logging::{LOG_RETENTION_DAYS, cleanup_old_logs, init_logging};
use reelforge::pipeline::{
    CircuitBreaker, Collaborators, ConcurrencyLimiter, GenerationProcessor, JobQueue,
    Orchestrator, ProviderConfigSource,
};
use reelforge::providers::ProviderFactory;
use reelforge::providers::scraper::ApifyScraper;
use reelforge::records::airtable::{AirtableClient, GENERATION_TABLE};
use reelforge::utils::http_client::build_http_client;

use crate::cli::{Args, Commands, RotationAction};

/// Ceiling for outbound requests that do not set their own timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = AppConfig::from_env()?;
    if let Some(concurrency) = args.concurrency.filter(|c| *c > 0) {
        config.concurrency = concurrency;
    }

    let _log_guard = init_logging(&config.log_dir)?;
    if let Err(e) = cleanup_old_logs(Path::new(&config.log_dir), LOG_RETENTION_DAYS).await {
        warn!(error = %e, "Failed to clean up old log files");
    }

    info!(database_url = %config.database_url, "Connecting to database");
    let pool = init_pool(&config.database_url)
        .await
        .context("failed to open database")?;
    run_migrations(&pool).await?;

    let queue = Arc::new(JobQueue::new(Arc::new(SqlxJobRepository::new(pool.clone()))));
    let rotation = Arc::new(KeyRotationManager::new(Arc::new(
        SqlxRotationRepository::new(pool.clone()),
    )));

    match args.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&config, queue, rotation).await?,
        Commands::Stats => {
            let counts = queue.stats().await?;
            println!(
                "pending: {} | processing: {} | completed: {} | failed: {} | total: {}",
                counts.pending,
                counts.processing,
                counts.completed,
                counts.failed,
                counts.total()
            );
        }
        Commands::Cleanup { days } => {
            let days = days.unwrap_or(config.retention_days);
            let deleted = queue.cleanup(days).await?;
            println!("Deleted {deleted} finished jobs older than {days} days");
        }
        Commands::Recover { stale_secs } => {
            let stale_after = stale_secs
                .map(Duration::from_secs)
                .unwrap_or(config.stale_after);
            let recovered = queue.recover_stale(stale_after).await?;
            println!("Recovered {recovered} abandoned jobs");
        }
        Commands::Rotation { action } => match action {
            RotationAction::Stats => {
                let stats = rotation.stats().await?;
                if stats.is_empty() {
                    println!("No rotation state recorded");
                }
                for s in stats {
                    println!(
                        "{}: key #{} | {} requests | updated {}",
                        s.provider,
                        s.current_key,
                        s.request_count,
                        s.updated_at.to_rfc3339()
                    );
                }
            }
            RotationAction::Reset { provider: Some(provider) } => {
                if rotation.reset(&provider).await? {
                    println!("Reset rotation for {provider}");
                } else {
                    println!("No rotation state for {provider}");
                }
            }
            RotationAction::Reset { provider: None } => {
                let removed = rotation.reset_all().await?;
                println!("Reset rotation for {removed} providers");
            }
        },
    }

    pool.close().await;
    Ok(())
}

async fn run(
    config: &AppConfig,
    queue: Arc<JobQueue>,
    rotation: Arc<KeyRotationManager>,
) -> anyhow::Result<()> {
    config.validate_for_run()?;
    let (Some(airtable_token), Some(base_id), Some(apify_token)) = (
        config.airtable_token.as_deref(),
        config.airtable_base_id.as_deref(),
        config.apify_token.as_deref(),
    ) else {
        anyhow::bail!("missing Airtable or Apify credentials");
    };

    let client = build_http_client(HTTP_TIMEOUT, config.concurrency.max(1) * 2)?;
    let airtable = Arc::new(AirtableClient::new(client.clone(), airtable_token, base_id));
    let scraper = Arc::new(ApifyScraper::new(client.clone(), apify_token));
    let factory = ProviderFactory::new(
        client.clone(),
        rotation,
        config.fal_keys.clone(),
        config.wavespeed_keys.clone(),
    );

    let collaborators = Collaborators {
        config_source: Arc::new(ProviderConfigSource::new(airtable.clone(), factory)),
        work_source: airtable.clone(),
        sink: airtable.clone(),
        handler: Arc::new(GenerationProcessor::new(
            airtable,
            scraper,
            client,
            GENERATION_TABLE,
        )),
    };

    let orchestrator = Orchestrator::new(
        queue,
        Arc::new(ConcurrencyLimiter::new(config.concurrency)),
        Arc::new(CircuitBreaker::new(
            config.breaker_threshold,
            config.breaker_cooldown,
        )),
        collaborators,
        config.orchestrator_config(),
    );

    tokio::select! {
        result = orchestrator.run() => {
            let summary = result?;
            println!("{summary}");
        }
        _ = tokio::signal::ctrl_c() => {
            error!("Interrupted, in-flight jobs will be recovered on the next run");
        }
    }
    Ok(())
}
