#!/usr/bin/env rust-script
//! Subscription Reconciliation Script
//!
//! Fixes database/gateway drift for Lovebird subscriptions.
//! Uses the payment gateway as the source of truth for card-billed rows.
//!
//! ## Usage
//! ```bash
//! # Dry run (preview changes without applying)
//! cargo run --bin reconcile_subscriptions --dry-run
//!
//! # Apply fixes
//! cargo run --bin reconcile_subscriptions --apply
//! ```
//!
//! ## Environment Variables
//! - DATABASE_URL: PostgreSQL connection string
//! - STRIPE_SECRET_KEY: Stripe API key (production or test mode)
//!
//! ## Actions Performed
//! 1. Expire active subscriptions whose paid period has lapsed
//! 2. Adopt gateway status/period for card subscriptions that drifted
//! 3. Backfill missing entitlement snapshots for entitled users
//!
//! App Store rows carry no stored receipt, so their drift heals through
//! server notifications; the gateway cross-check here covers card rows only.

use std::env;
use std::error::Error;

#[derive(Debug)]
struct ReconciliationAction {
    user_id: uuid::Uuid,
    tier: String,
    action_type: String,
    current_state: String,
    new_state: String,
    reason: String,
    adopt_status: Option<String>,
    adopt_period_end: Option<time::OffsetDateTime>,
    adopt_cancel_flag: Option<bool>,
}

fn status_for_gateway(gateway_status: &str) -> &'static str {
    match gateway_status {
        "active" | "trialing" => "active",
        "past_due" => "billing_retry",
        _ => "cancelled",
    }
}

fn baseline_for_tier(tier: &str) -> (i32, i32) {
    match tier {
        "premium" => (4, 10),
        "plus" => (1, 5),
        _ => (0, 1),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    println!("Lovebird Subscription Reconciliation");
    println!("================================\n");

    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let dry_run = !args.contains(&"--apply".to_string());

    if dry_run {
        println!("🔍 DRY RUN MODE - No changes will be applied");
        println!("   Use --apply flag to execute changes\n");
    } else {
        println!("⚠️  LIVE MODE - Changes will be applied to the database\n");
    }

    // Load environment variables
    dotenvy::dotenv().ok();

    let database_url = env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set");

    let stripe_key = env::var("STRIPE_SECRET_KEY")
        .expect("STRIPE_SECRET_KEY must be set");

    // Initialize database connection
    let pool = sqlx::postgres::PgPool::connect(&database_url).await?;

    // Initialize Stripe client
    let stripe_client = stripe::Client::new(stripe_key);

    println!("✓ Connected to database");
    println!("✓ Connected to Stripe API\n");

    let mut actions = Vec::new();

    // ========================================================================
    // Action 1: Expire active subscriptions whose paid period has lapsed
    // ========================================================================
    println!("Scanning for active subscriptions past their period end...");

    let lapsed: Vec<(uuid::Uuid, String, time::OffsetDateTime)> = sqlx::query_as(
        r#"
        SELECT user_id, tier, current_period_end
        FROM subscriptions
        WHERE status = 'active'
          AND current_period_end < NOW()
        "#,
    )
    .fetch_all(&pool)
    .await?;

    for (user_id, tier, period_end) in lapsed {
        actions.push(ReconciliationAction {
            user_id,
            tier: tier.clone(),
            action_type: "EXPIRE".to_string(),
            current_state: format!("active ({}) until {}", tier, period_end),
            new_state: "expired".to_string(),
            reason: "Paid period elapsed without renewal".to_string(),
            adopt_status: None,
            adopt_period_end: None,
            adopt_cancel_flag: None,
        });
    }

    println!("  Found {} subscriptions to expire", actions.len());

    // ========================================================================
    // Action 2: Adopt gateway state for card subscriptions that drifted
    // ========================================================================
    println!("\nScanning for card subscriptions out of sync with Stripe...");

    let card_rows: Vec<(uuid::Uuid, String, String, time::OffsetDateTime, bool, String)> =
        sqlx::query_as(
            r#"
            SELECT user_id, tier, status, current_period_end, cancel_at_period_end,
                   stripe_subscription_id
            FROM subscriptions
            WHERE stripe_subscription_id IS NOT NULL
              AND status IN ('active', 'billing_retry')
            "#,
        )
        .fetch_all(&pool)
        .await?;

    let mut drifted = 0;
    for (user_id, tier, db_status, db_period_end, db_cancel_flag, gateway_id) in card_rows {
        let sub_id: stripe::SubscriptionId = match gateway_id.parse() {
            Ok(id) => id,
            Err(e) => {
                println!("  ⚠ Skipping {}: invalid gateway id ({})", user_id, e);
                continue;
            }
        };

        let remote = match stripe::Subscription::retrieve(&stripe_client, &sub_id, &[]).await {
            Ok(subscription) => subscription,
            Err(e) => {
                println!("  ⚠ Skipping {}: gateway lookup failed ({})", user_id, e);
                continue;
            }
        };

        let remote_status = status_for_gateway(&remote.status.to_string());
        let remote_period_end =
            match time::OffsetDateTime::from_unix_timestamp(remote.current_period_end) {
                Ok(ts) => ts,
                Err(_) => {
                    println!("  ⚠ Skipping {}: unparseable gateway period end", user_id);
                    continue;
                }
            };

        let period_gap = (remote_period_end - db_period_end).whole_seconds().abs();
        let status_drift = remote_status != db_status;
        let flag_drift = remote.cancel_at_period_end != db_cancel_flag;

        if !status_drift && !flag_drift && period_gap < 60 {
            continue;
        }

        drifted += 1;
        actions.push(ReconciliationAction {
            user_id,
            tier,
            action_type: "SYNC".to_string(),
            current_state: format!("{} until {}", db_status, db_period_end),
            new_state: format!("{} until {}", remote_status, remote_period_end),
            reason: "Gateway state differs from stored row".to_string(),
            adopt_status: Some(remote_status.to_string()),
            adopt_period_end: Some(remote_period_end),
            adopt_cancel_flag: Some(remote.cancel_at_period_end),
        });
    }

    println!("  Found {} card subscriptions to sync", drifted);

    // ========================================================================
    // Action 3: Backfill missing entitlement snapshots
    // ========================================================================
    println!("\nScanning for entitled users without an entitlement snapshot...");

    let missing: Vec<(uuid::Uuid, String)> = sqlx::query_as(
        r#"
        SELECT s.user_id, s.tier
        FROM subscriptions s
        WHERE s.status IN ('active', 'billing_retry')
          AND NOT EXISTS (
              SELECT 1 FROM entitlement_snapshots e
              WHERE e.user_id = s.user_id
          )
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let backfills = missing.len();
    for (user_id, tier) in missing {
        let (boosts, super_likes) = baseline_for_tier(&tier);
        actions.push(ReconciliationAction {
            user_id,
            tier: tier.clone(),
            action_type: "BACKFILL".to_string(),
            current_state: "no snapshot".to_string(),
            new_state: format!("{} baseline ({} boosts, {} super likes)", tier, boosts, super_likes),
            reason: "Entitled subscription without a snapshot row".to_string(),
            adopt_status: None,
            adopt_period_end: None,
            adopt_cancel_flag: None,
        });
    }

    println!("  Found {} snapshots to backfill", backfills);

    // ========================================================================
    // Report: billing retry rows past their period end (no auto-fix)
    // ========================================================================
    let stale_retries: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM subscriptions
        WHERE status = 'billing_retry'
          AND current_period_end < NOW()
        "#,
    )
    .fetch_one(&pool)
    .await?;

    if stale_retries > 0 {
        println!(
            "\n⚠ {} billing_retry subscriptions past period end; closure arrives via gateway notifications",
            stale_retries
        );
    }

    // ========================================================================
    // Summary and Execution
    // ========================================================================
    println!("\n========================================");
    println!("Reconciliation Plan");
    println!("========================================\n");

    if actions.is_empty() {
        println!("✓ No reconciliation actions needed!");
        return Ok(());
    }

    println!("Found {} actions to perform:\n", actions.len());

    for (i, action) in actions.iter().enumerate() {
        println!("{}. {} - user {}", i + 1, action.action_type, action.user_id);
        println!("   Tier: {}", action.tier);
        println!("   Current: {}", action.current_state);
        println!("   New: {}", action.new_state);
        println!("   Reason: {}", action.reason);
        println!();
    }

    if dry_run {
        println!("This was a dry run. No changes were applied.");
        println!("Run with --apply flag to execute these changes.");
        return Ok(());
    }

    // Execute reconciliation actions
    println!("========================================");
    println!("Executing Reconciliation");
    println!("========================================\n");

    for action in &actions {
        match action.action_type.as_str() {
            "EXPIRE" => {
                println!("Expiring subscription for user {}...", action.user_id);

                // Status-keyed so a renewal that landed mid-run wins
                let updated = sqlx::query(
                    r#"
                    UPDATE subscriptions
                    SET status = 'expired',
                        updated_at = NOW()
                    WHERE user_id = $1
                      AND status = 'active'
                      AND current_period_end < NOW()
                    "#,
                )
                .bind(action.user_id)
                .execute(&pool)
                .await?;

                if updated.rows_affected() == 0 {
                    println!("  ⚠ Row changed since scan, skipped");
                    continue;
                }

                reset_snapshot_to_free(&pool, action.user_id).await?;
                println!("  ✓ Expired and reset entitlements");
            }
            "SYNC" => {
                println!("Syncing gateway state for user {}...", action.user_id);

                sqlx::query(
                    r#"
                    UPDATE subscriptions
                    SET status = $2,
                        current_period_end = $3,
                        cancel_at_period_end = $4,
                        updated_at = NOW()
                    WHERE user_id = $1
                    "#,
                )
                .bind(action.user_id)
                .bind(action.adopt_status.as_deref().unwrap_or("active"))
                .bind(action.adopt_period_end)
                .bind(action.adopt_cancel_flag.unwrap_or(false))
                .execute(&pool)
                .await?;

                if action.adopt_status.as_deref() == Some("cancelled") {
                    reset_snapshot_to_free(&pool, action.user_id).await?;
                }

                println!("  ✓ Adopted gateway state");
            }
            "BACKFILL" => {
                println!("Backfilling snapshot for user {}...", action.user_id);

                let (boosts, super_likes) = baseline_for_tier(&action.tier);
                sqlx::query(
                    r#"
                    INSERT INTO entitlement_snapshots
                        (user_id, boosts_remaining, super_likes_remaining)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (user_id) DO NOTHING
                    "#,
                )
                .bind(action.user_id)
                .bind(boosts)
                .bind(super_likes)
                .execute(&pool)
                .await?;

                println!("  ✓ Snapshot created at tier baseline");
            }
            _ => {
                println!("  ⚠ Unknown action type: {}", action.action_type);
            }
        }
    }

    println!("\n========================================");
    println!("Reconciliation Complete");
    println!("========================================");
    println!("✓ Applied {} actions successfully", actions.len());

    Ok(())
}

async fn reset_snapshot_to_free(
    pool: &sqlx::postgres::PgPool,
    user_id: uuid::Uuid,
) -> Result<(), Box<dyn Error>> {
    sqlx::query(
        r#"
        INSERT INTO entitlement_snapshots
            (user_id, boosts_remaining, super_likes_remaining)
        VALUES ($1, 0, 1)
        ON CONFLICT (user_id) DO UPDATE
        SET boosts_remaining = 0,
            super_likes_remaining = 1,
            daily_likes_used = 0,
            daily_super_likes_used = 0,
            daily_messages_used = 0,
            last_reset_at = NOW(),
            updated_at = NOW()
        "#,
    )
    .bind(user_id)
    .execute(pool)
    .await?;

    Ok(())
}
