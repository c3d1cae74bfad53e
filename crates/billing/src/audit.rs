//! Webhook audit log
//!
//! Append-only record of every inbound gateway notification. Claiming an
//! event with a stable id is an atomic insert against the partial unique
//! index on `event_id`, which is what makes replay detection safe under
//! concurrent delivery: exactly one claim wins, the loser sees a duplicate.
//! Rows without an event id (App Store legacy notifications) always insert;
//! their replay safety lives in the transaction ledger.

use sqlx::PgPool;
use uuid::Uuid;

use lovebird_shared::types::{GatewayKind, WebhookEvent, WebhookStatus};

use crate::error::BillingResult;

/// Outcome of claiming an inbound event
#[derive(Debug)]
pub enum ClaimOutcome {
    /// Event claimed; the id is the audit row to finalize later
    Claimed(Uuid),
    /// A row with this event id already exists
    Duplicate,
}

/// Service for the webhook audit log
#[derive(Clone)]
pub struct AuditService {
    pool: PgPool,
}

impl AuditService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert the audit row in `processing` status, claiming the event id
    /// when one is present.
    pub async fn claim(
        &self,
        gateway: GatewayKind,
        event_id: Option<&str>,
        notification_type: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<ClaimOutcome> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events (gateway, event_id, notification_type, payload, status)
            VALUES ($1, $2, $3, $4, 'processing')
            ON CONFLICT (event_id) WHERE event_id IS NOT NULL DO NOTHING
            RETURNING id
            "#,
        )
        .bind(gateway)
        .bind(event_id)
        .bind(notification_type)
        .bind(payload)
        .fetch_optional(&self.pool)
        .await?;

        match claimed {
            Some((id,)) => Ok(ClaimOutcome::Claimed(id)),
            None => {
                tracing::info!(
                    gateway = %gateway,
                    event_id = ?event_id,
                    "Webhook event already claimed, acknowledging duplicate"
                );
                Ok(ClaimOutcome::Duplicate)
            }
        }
    }

    /// Finalize an audit row as processed or failed
    pub async fn finalize(
        &self,
        audit_id: Uuid,
        status: WebhookStatus,
        error: Option<&str>,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = $2, error = $3, processed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(audit_id)
        .bind(status)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(audit_id = %audit_id, "Audit row vanished before finalize");
        }

        Ok(())
    }

    /// Delete audit rows older than the retention window
    pub async fn purge_older_than_days(&self, days: i64) -> BillingResult<u64> {
        let result = sqlx::query(
            "DELETE FROM webhook_events WHERE created_at < NOW() - ($1 * INTERVAL '1 day')",
        )
        .bind(days)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Recent failures for operator inspection
    pub async fn recent_failures(&self, limit: i64) -> BillingResult<Vec<WebhookEvent>> {
        let events = sqlx::query_as::<_, WebhookEvent>(
            r#"
            SELECT * FROM webhook_events
            WHERE status = 'failed'
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}
