//! Reconciliation daemon: polls the projection task queue and applies due
//! tasks to the search index until shut down.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use openshelf_infra::{ElasticsearchProjection, PostgresTaskStore, Settings};
use openshelf_projection::{ProjectionWorker, RetryPolicy, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    openshelf_observability::init();

    let settings = Settings::from_env();
    info!(
        batch_size = settings.batch_size,
        max_retries = settings.max_retries,
        poll_interval_secs = settings.poll_interval_secs,
        index = %settings.search_index,
        "starting projection reconciliation worker"
    );

    let pool = PgPoolOptions::new()
        .max_connections(settings.pool_size)
        .connect(&settings.database_url)
        .await?;
    PostgresTaskStore::run_migrations(&pool).await?;

    let store = PostgresTaskStore::new(pool);
    let index = ElasticsearchProjection::new(
        reqwest::Client::new(),
        &settings.search_url,
        &settings.search_index,
    );

    let config = WorkerConfig::default()
        .with_batch_size(settings.batch_size)
        .with_max_retries(settings.max_retries)
        .with_retry_policy(RetryPolicy::default());
    let worker = ProjectionWorker::new(store, index, config);

    let mut ticker = tokio::time::interval(Duration::from_secs(settings.poll_interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match worker.run().await {
                    Ok(outcome) if outcome.processed > 0 => {
                        info!(
                            processed = outcome.processed,
                            completed = outcome.completed,
                            rescheduled = outcome.rescheduled,
                            dead_lettered = outcome.dead_lettered,
                            "batch drained"
                        );
                    }
                    Ok(_) => {}
                    // Storage errors are transient as far as the loop is
                    // concerned; the next tick retries from scratch.
                    Err(err) => error!(%err, "batch run failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received; stopping");
                break;
            }
        }
    }

    Ok(())
}
