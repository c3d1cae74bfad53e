//! Lovebird reconciliation worker.
//!
//! Long-running process that applies the time-driven half of the billing
//! engine: expiring lapsed subscriptions, resetting daily usage counters,
//! purging aged webhook audit rows, and surfacing subscriptions stuck in
//! billing retry. Gateway-driven transitions stay in the API process; this
//! binary only runs the clocks.

mod jobs;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    if let Err(error) = run().await {
        error!(error = %error, "Reconciliation worker terminated");
        std::process::exit(1);
    }

    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL environment variable must be set")?;

    let pool = lovebird_shared::db::create_pool(&database_url)
        .await
        .context("Failed to connect to database")?;

    lovebird_shared::db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    info!("Starting reconciliation worker");

    let expiry_sweep = tokio::spawn(jobs::expiry_sweep_task(pool.clone()));
    let quota_reset = tokio::spawn(jobs::quota_reset_task(pool.clone()));
    let billing_retry = tokio::spawn(jobs::billing_retry_task(pool.clone()));
    let pending_sync = tokio::spawn(jobs::pending_sync_task(pool.clone()));
    let audit_retention = tokio::spawn(jobs::audit_retention_task(pool));

    info!("Reconciliation tasks scheduled");

    // Tasks loop forever; any of them resolving means something went wrong
    tokio::select! {
        result = expiry_sweep => result?,
        result = quota_reset => result?,
        result = billing_retry => result?,
        result = pending_sync => result?,
        result = audit_retention => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, stopping worker");
            return Ok(());
        }
    }

    anyhow::bail!("A reconciliation task stopped unexpectedly")
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
