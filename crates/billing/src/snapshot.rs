//! Entitlement snapshot service
//!
//! Persisted consumable balances and daily usage counters, distinct from the
//! pure tier matrix. The app decrements balances on the hot path; lifecycle
//! transitions rewrite the baseline and the worker zeroes daily counters.

use lovebird_shared::types::{EntitlementSnapshot, SubscriptionTier};
use sqlx::PgPool;
use uuid::Uuid;

use crate::entitlements::EntitlementMatrix;
use crate::error::BillingResult;

/// Consumable balances a tier starts each period with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotBaseline {
    pub boosts: i32,
    pub super_likes: i32,
}

/// Baseline balances derived from the tier matrix
pub fn baseline_for(tier: SubscriptionTier) -> SnapshotBaseline {
    let matrix = EntitlementMatrix::for_tier(tier);
    SnapshotBaseline {
        boosts: matrix.monthly_boosts as i32,
        super_likes: matrix.daily_super_likes as i32,
    }
}

/// Snapshot persistence service
#[derive(Clone)]
pub struct SnapshotService {
    pool: PgPool,
}

impl SnapshotService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Rewrite a user's snapshot to the tier baseline: balances set from the
    /// matrix, daily counters zeroed. Called on activation, plan change,
    /// cancellation (Free baseline), and expiry.
    pub async fn reset_to_tier(
        &self,
        user_id: Uuid,
        tier: SubscriptionTier,
    ) -> BillingResult<()> {
        let baseline = baseline_for(tier);

        sqlx::query(
            r#"
            INSERT INTO entitlement_snapshots (
                user_id, boosts_remaining, super_likes_remaining,
                daily_likes_used, daily_super_likes_used, daily_messages_used,
                last_reset_at, updated_at
            ) VALUES ($1, $2, $3, 0, 0, 0, NOW(), NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                boosts_remaining = EXCLUDED.boosts_remaining,
                super_likes_remaining = EXCLUDED.super_likes_remaining,
                daily_likes_used = 0,
                daily_super_likes_used = 0,
                daily_messages_used = 0,
                last_reset_at = NOW(),
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(baseline.boosts)
        .bind(baseline.super_likes)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            user_id = %user_id,
            tier = %tier,
            boosts = baseline.boosts,
            super_likes = baseline.super_likes,
            "Snapshot reset to tier baseline"
        );
        Ok(())
    }

    /// Credit purchased consumables on top of the current balances. Creates
    /// the row if the user has never held a snapshot.
    pub async fn grant_consumables(
        &self,
        user_id: Uuid,
        boosts: i32,
        super_likes: i32,
    ) -> BillingResult<EntitlementSnapshot> {
        let snapshot: EntitlementSnapshot = sqlx::query_as(
            r#"
            INSERT INTO entitlement_snapshots (
                user_id, boosts_remaining, super_likes_remaining,
                daily_likes_used, daily_super_likes_used, daily_messages_used,
                last_reset_at, updated_at
            ) VALUES ($1, $2, $3, 0, 0, 0, NOW(), NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                boosts_remaining = entitlement_snapshots.boosts_remaining + EXCLUDED.boosts_remaining,
                super_likes_remaining = entitlement_snapshots.super_likes_remaining + EXCLUDED.super_likes_remaining,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(boosts)
        .bind(super_likes)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            user_id = %user_id,
            boosts = boosts,
            super_likes = super_likes,
            boosts_remaining = snapshot.boosts_remaining,
            super_likes_remaining = snapshot.super_likes_remaining,
            "Granted consumables"
        );
        Ok(snapshot)
    }

    /// Zero the daily usage counters for every user. Returns rows touched.
    /// Run by the worker at midnight UTC; safe to repeat.
    pub async fn reset_daily_counters(&self) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE entitlement_snapshots
            SET daily_likes_used = 0,
                daily_super_likes_used = 0,
                daily_messages_used = 0,
                last_reset_at = NOW(),
                updated_at = NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Fetch a user's snapshot, if one exists
    pub async fn get(&self, user_id: Uuid) -> BillingResult<Option<EntitlementSnapshot>> {
        let snapshot =
            sqlx::query_as("SELECT * FROM entitlement_snapshots WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(snapshot)
    }

    /// Spend one boost. Returns false when the balance is already zero; the
    /// decrement and the balance check are a single conditional update.
    pub async fn consume_boost(&self, user_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE entitlement_snapshots
            SET boosts_remaining = boosts_remaining - 1, updated_at = NOW()
            WHERE user_id = $1 AND boosts_remaining > 0
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Spend one super like, same contract as `consume_boost`
    pub async fn consume_super_like(&self, user_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE entitlement_snapshots
            SET super_likes_remaining = super_likes_remaining - 1,
                daily_super_likes_used = daily_super_likes_used + 1,
                updated_at = NOW()
            WHERE user_id = $1 AND super_likes_remaining > 0
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_tracks_the_matrix() {
        let free = baseline_for(SubscriptionTier::Free);
        assert_eq!(free.boosts, 0);
        assert_eq!(free.super_likes, 1);

        let premium = baseline_for(SubscriptionTier::Premium);
        let matrix = EntitlementMatrix::for_tier(SubscriptionTier::Premium);
        assert_eq!(premium.boosts, matrix.monthly_boosts as i32);
        assert_eq!(premium.super_likes, matrix.daily_super_likes as i32);
    }

    #[test]
    fn test_baseline_monotonic_across_tiers() {
        let tiers = SubscriptionTier::all();
        for pair in tiers.windows(2) {
            let lower = baseline_for(pair[0]);
            let upper = baseline_for(pair[1]);
            assert!(lower.boosts <= upper.boosts);
            assert!(lower.super_likes <= upper.super_likes);
        }
    }
}
