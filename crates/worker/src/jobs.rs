//! Scheduled reconciliation jobs.
//!
//! Each task owns an interval loop and catches its own failures: a job that
//! errors logs and waits for the next firing instead of taking the worker
//! down. State transitions go through the same service layer the webhook
//! router uses, so a sweep and a notification can race safely.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use lovebird_billing::audit::AuditService;
use lovebird_billing::ledger::LedgerService;
use lovebird_billing::snapshot::SnapshotService;
use lovebird_billing::{BillingResult, NoopPublisher, SubscriptionService};

const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const BILLING_RETRY_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
const PENDING_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);
const AUDIT_RETENTION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const QUOTA_RESET_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

const AUDIT_RETENTION_DAYS: i64 = 30;
const PENDING_SYNC_BATCH: i64 = 10;

/// Background task: hourly sweep closing subscriptions whose paid period
/// has elapsed
pub async fn expiry_sweep_task(pool: PgPool) {
    let mut interval = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);

    loop {
        interval.tick().await;

        match run_expiry_sweep(&pool).await {
            Ok(expired) if expired > 0 => {
                info!(expired, "Expiry sweep closed lapsed subscriptions");
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Expiry sweep failed");
            }
        }
    }
}

async fn run_expiry_sweep(pool: &PgPool) -> BillingResult<u64> {
    let subscriptions = SubscriptionService::new(pool.clone(), Arc::new(NoopPublisher));
    let lapsed = subscriptions.lapsed_subscriptions().await?;

    let mut expired = 0u64;
    for subscription in lapsed {
        // Per-row so the entitlement reset fires for every affected user
        match subscriptions.mark_expired(subscription.user_id).await {
            Ok(Some(_)) => expired += 1,
            // Raced with a renewal or a cancel; nothing left to do
            Ok(None) => {}
            Err(e) => {
                warn!(
                    user_id = %subscription.user_id,
                    error = %e,
                    "Failed to expire lapsed subscription"
                );
            }
        }
    }

    Ok(expired)
}

/// Background task: daily usage-counter reset at UTC midnight
pub async fn quota_reset_task(pool: PgPool) {
    let first_firing =
        tokio::time::Instant::now() + until_next_midnight_utc(OffsetDateTime::now_utc());
    let mut interval = tokio::time::interval_at(first_firing, QUOTA_RESET_INTERVAL);

    loop {
        interval.tick().await;

        let snapshots = SnapshotService::new(pool.clone());
        match snapshots.reset_daily_counters().await {
            Ok(reset) => {
                info!(reset, "Daily usage counters reset");
            }
            Err(e) => {
                error!(error = %e, "Daily quota reset failed");
            }
        }
    }
}

/// Background task: daily purge of webhook audit rows past retention
pub async fn audit_retention_task(pool: PgPool) {
    let mut interval = tokio::time::interval(AUDIT_RETENTION_INTERVAL);

    loop {
        interval.tick().await;

        let audit = AuditService::new(pool.clone());
        match audit.purge_older_than_days(AUDIT_RETENTION_DAYS).await {
            Ok(purged) if purged > 0 => {
                info!(purged, "Purged aged webhook audit rows");
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Audit retention purge failed");
            }
        }
    }
}

/// Background task: observation pass over subscriptions sitting in billing
/// retry. The gateways drive recovery through notifications; this job only
/// surfaces rows for operators.
pub async fn billing_retry_task(pool: PgPool) {
    let mut interval = tokio::time::interval(BILLING_RETRY_INTERVAL);

    loop {
        interval.tick().await;

        let subscriptions = SubscriptionService::new(pool.clone(), Arc::new(NoopPublisher));
        match subscriptions.subscriptions_in_billing_retry().await {
            Ok(retrying) if retrying.is_empty() => {}
            Ok(retrying) => {
                warn!(
                    count = retrying.len(),
                    "Subscriptions in billing retry grace"
                );
                for subscription in retrying {
                    debug!(
                        user_id = %subscription.user_id,
                        current_period_end = %subscription.current_period_end,
                        "Awaiting billing retry outcome"
                    );
                }
            }
            Err(e) => {
                error!(error = %e, "Billing retry observation failed");
            }
        }
    }
}

/// Background task: observation pass over ledger rows that never reached a
/// terminal status
pub async fn pending_sync_task(pool: PgPool) {
    let mut interval = tokio::time::interval(PENDING_SYNC_INTERVAL);

    loop {
        interval.tick().await;

        let ledger = LedgerService::new(pool.clone());
        match ledger.pending_transactions(PENDING_SYNC_BATCH).await {
            Ok(pending) if pending.is_empty() => {}
            Ok(pending) => {
                warn!(
                    count = pending.len(),
                    "Transactions awaiting a terminal status"
                );
                for transaction in pending {
                    debug!(
                        external_transaction_id = %transaction.external_transaction_id,
                        created_at = %transaction.created_at,
                        "Transaction never finalized"
                    );
                }
            }
            Err(e) => {
                error!(error = %e, "Pending transaction scan failed");
            }
        }
    }
}

/// Time remaining until the next UTC midnight
fn until_next_midnight_utc(now: OffsetDateTime) -> Duration {
    let next_day = now.date().next_day().unwrap_or(now.date());
    let midnight = next_day.midnight().assume_utc();
    let gap = (midnight - now).whole_seconds().max(1);

    Duration::from_secs(gap as u64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Allow unwrap() in tests for cleaner test code
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_until_next_midnight_spans_remaining_day() {
        let now = datetime!(2025-03-10 22:30:00 UTC);
        let gap = until_next_midnight_utc(now);
        assert_eq!(gap, Duration::from_secs(90 * 60));
    }

    #[test]
    fn test_until_next_midnight_just_after_midnight() {
        let now = datetime!(2025-03-10 00:00:01 UTC);
        let gap = until_next_midnight_utc(now);
        assert_eq!(gap, Duration::from_secs(24 * 60 * 60 - 1));
    }
}
