//! Subscription lifecycle state machine
//!
//! One row per user; rows are never hard-deleted, they move through
//! statuses instead. Every transition is a conditional UPDATE keyed on the
//! status it expects to find, so a transition that lost a race reports a
//! no-op (`rows_affected == 0`) instead of overwriting newer state. Webhook
//! renewals additionally require period-end monotonicity, which keeps a
//! stale or replayed RENEWED from resurrecting a cancelled row or rewinding
//! the period.
//!
//! ## Design Principles
//!
//! - No cross-request locking: the conditional UPDATEs are the concurrency
//!   control.
//! - Lifecycle events are published after the row change commits; a lost
//!   event is survivable, a lost state change is not.
//! - Snapshot baselines are rewritten whenever the effective tier changes
//!   (activation, plan change, immediate cancel, expiry). Notification
//!   renewals extend the period only, so purchased consumable balances
//!   survive a renewal.

use std::sync::Arc;

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use lovebird_shared::types::{GatewayKind, Subscription, SubscriptionTier};

use crate::error::{BillingError, BillingResult};
use crate::events::{EventPublisher, PaymentEvent};
use crate::gateway::PaymentGateway;
use crate::snapshot::SnapshotService;

/// Input for [`SubscriptionService::activate_or_renew`]
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub user_id: Uuid,
    pub tier: SubscriptionTier,
    pub period_end: OffsetDateTime,
    pub is_trial: bool,
    pub is_intro_offer: bool,
    pub trial_end: Option<OffsetDateTime>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub apple_product_id: Option<String>,
    pub apple_transaction_id: Option<String>,
    pub apple_original_transaction_id: Option<String>,
}

impl Default for NewSubscription {
    fn default() -> Self {
        Self {
            user_id: Uuid::nil(),
            tier: SubscriptionTier::Free,
            period_end: OffsetDateTime::UNIX_EPOCH,
            is_trial: false,
            is_intro_offer: false,
            trial_end: None,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            apple_product_id: None,
            apple_transaction_id: None,
            apple_original_transaction_id: None,
        }
    }
}

/// Service owning all subscription state transitions
#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
    snapshots: SnapshotService,
    events: Arc<dyn EventPublisher>,
}

impl SubscriptionService {
    pub fn new(pool: PgPool, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            snapshots: SnapshotService::new(pool.clone()),
            pool,
            events,
        }
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub async fn get(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let subscription =
            sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(subscription)
    }

    /// Resolve a gateway correlation id to its subscription.
    ///
    /// App Store notifications correlate by original transaction id, Stripe
    /// notifications by subscription id. No match is a normal outcome:
    /// gateways may reference subscriptions this system has not seen yet.
    pub async fn find_by_correlation(
        &self,
        gateway: GatewayKind,
        correlation_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let query = match gateway {
            GatewayKind::Apple => {
                "SELECT * FROM subscriptions WHERE apple_original_transaction_id = $1"
            }
            GatewayKind::Stripe => "SELECT * FROM subscriptions WHERE stripe_subscription_id = $1",
        };

        let subscription = sqlx::query_as::<_, Subscription>(query)
            .bind(correlation_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(subscription)
    }

    /// ACTIVE rows whose paid period has lapsed (expiry sweep input)
    pub async fn lapsed_subscriptions(&self) -> BillingResult<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE status = 'active' AND current_period_end < NOW()
            ORDER BY current_period_end ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(subscriptions)
    }

    /// BILLING_RETRY rows still inside their paid period (observation job)
    pub async fn subscriptions_in_billing_retry(&self) -> BillingResult<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE status = 'billing_retry' AND current_period_end > NOW()
            ORDER BY current_period_end ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(subscriptions)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Activate a subscription from a verified purchase, or renew it if one
    /// already exists for the user.
    ///
    /// Upsert keyed on `user_id`: promotes to ACTIVE, extends the period,
    /// clears any scheduled cancellation, and rewrites the snapshot baseline
    /// for the purchased tier.
    pub async fn activate_or_renew(&self, new: NewSubscription) -> BillingResult<Subscription> {
        let now = OffsetDateTime::now_utc();
        if new.period_end <= now {
            return Err(BillingError::Validation(
                "periodEnd must be in the future".to_string(),
            ));
        }

        // Only used to pick the right lifecycle event; the upsert below is
        // the atomic part
        let renewal = self
            .get(new.user_id)
            .await?
            .is_some_and(|existing| existing.status_parsed().is_entitled());

        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions (
                user_id, tier, status, current_period_start, current_period_end,
                cancel_at_period_end, auto_renew, is_trial, is_intro_offer,
                stripe_customer_id, stripe_subscription_id,
                apple_product_id, apple_transaction_id, apple_original_transaction_id,
                last_renewed_at, trial_end
            )
            VALUES ($1, $2, 'active', NOW(), $3, FALSE, TRUE, $4, $5,
                    $6, $7, $8, $9, $10, NOW(), $11)
            ON CONFLICT (user_id) DO UPDATE SET
                tier = EXCLUDED.tier,
                status = 'active',
                current_period_start = NOW(),
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = FALSE,
                auto_renew = TRUE,
                is_trial = EXCLUDED.is_trial,
                is_intro_offer = EXCLUDED.is_intro_offer,
                stripe_customer_id =
                    COALESCE(EXCLUDED.stripe_customer_id, subscriptions.stripe_customer_id),
                stripe_subscription_id =
                    COALESCE(EXCLUDED.stripe_subscription_id, subscriptions.stripe_subscription_id),
                apple_product_id =
                    COALESCE(EXCLUDED.apple_product_id, subscriptions.apple_product_id),
                apple_transaction_id =
                    COALESCE(EXCLUDED.apple_transaction_id, subscriptions.apple_transaction_id),
                apple_original_transaction_id =
                    COALESCE(EXCLUDED.apple_original_transaction_id,
                             subscriptions.apple_original_transaction_id),
                cancelled_at = NULL,
                last_renewed_at = NOW(),
                trial_end = EXCLUDED.trial_end,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(new.user_id)
        .bind(new.tier)
        .bind(new.period_end)
        .bind(new.is_trial)
        .bind(new.is_intro_offer)
        .bind(&new.stripe_customer_id)
        .bind(&new.stripe_subscription_id)
        .bind(&new.apple_product_id)
        .bind(&new.apple_transaction_id)
        .bind(&new.apple_original_transaction_id)
        .bind(new.trial_end)
        .fetch_one(&self.pool)
        .await?;

        self.snapshots.reset_to_tier(new.user_id, new.tier).await?;

        if renewal {
            self.events.publish(PaymentEvent::SubscriptionRenewed {
                user_id: new.user_id,
                tier: new.tier,
                current_period_end: new.period_end,
            });
        } else {
            self.events.publish(PaymentEvent::SubscriptionActivated {
                user_id: new.user_id,
                tier: new.tier,
            });
        }

        tracing::info!(
            user_id = %new.user_id,
            tier = %new.tier,
            period_end = %new.period_end,
            renewal = renewal,
            "Subscription activated"
        );

        Ok(subscription)
    }

    /// Extend a subscription's period from a gateway RENEWED notification.
    ///
    /// Conditional on the row not being cancelled and on the new period end
    /// being strictly later than the stored one. Unknown correlation ids and
    /// stale or replayed renewals come back as `None`.
    pub async fn renew_from_notification(
        &self,
        gateway: GatewayKind,
        correlation_id: &str,
        new_period_end: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        let query = match gateway {
            GatewayKind::Apple => {
                r#"
                UPDATE subscriptions
                SET status = 'active',
                    current_period_start = current_period_end,
                    current_period_end = $2,
                    is_trial = FALSE,
                    last_renewed_at = NOW(),
                    updated_at = NOW()
                WHERE apple_original_transaction_id = $1
                  AND status <> 'cancelled'
                  AND current_period_end < $2
                RETURNING *
                "#
            }
            GatewayKind::Stripe => {
                r#"
                UPDATE subscriptions
                SET status = 'active',
                    current_period_start = current_period_end,
                    current_period_end = $2,
                    is_trial = FALSE,
                    last_renewed_at = NOW(),
                    updated_at = NOW()
                WHERE stripe_subscription_id = $1
                  AND status <> 'cancelled'
                  AND current_period_end < $2
                RETURNING *
                "#
            }
        };

        let renewed = sqlx::query_as::<_, Subscription>(query)
            .bind(correlation_id)
            .bind(new_period_end)
            .fetch_optional(&self.pool)
            .await?;

        match renewed {
            Some(subscription) => {
                self.events.publish(PaymentEvent::SubscriptionRenewed {
                    user_id: subscription.user_id,
                    tier: subscription.tier_parsed(),
                    current_period_end: new_period_end,
                });

                tracing::info!(
                    user_id = %subscription.user_id,
                    correlation_id = %correlation_id,
                    new_period_end = %new_period_end,
                    "Subscription renewed from notification"
                );

                Ok(Some(subscription))
            }
            None => {
                tracing::warn!(
                    gateway = %gateway,
                    correlation_id = %correlation_id,
                    "Renewal matched no row (unknown correlation, cancelled, or stale period), skipping"
                );
                Ok(None)
            }
        }
    }

    /// Cancel a subscription.
    ///
    /// `immediate = true` revokes now: status CANCELLED, tier downgraded to
    /// Free, snapshot reset to the Free baseline. `immediate = false` only
    /// schedules the cancellation; status and tier hold until period end.
    pub async fn cancel(&self, user_id: Uuid, immediate: bool) -> BillingResult<Subscription> {
        let query = if immediate {
            r#"
            UPDATE subscriptions
            SET status = 'cancelled',
                cancelled_at = NOW(),
                tier = 'free',
                cancel_at_period_end = FALSE,
                auto_renew = FALSE,
                updated_at = NOW()
            WHERE user_id = $1 AND status IN ('active', 'billing_retry')
            RETURNING *
            "#
        } else {
            r#"
            UPDATE subscriptions
            SET cancel_at_period_end = TRUE,
                auto_renew = FALSE,
                updated_at = NOW()
            WHERE user_id = $1 AND status IN ('active', 'billing_retry')
            RETURNING *
            "#
        };

        let subscription = sqlx::query_as::<_, Subscription>(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound("No active subscription to cancel".to_string())
            })?;

        if immediate {
            self.snapshots
                .reset_to_tier(user_id, SubscriptionTier::Free)
                .await?;
        }

        self.events
            .publish(PaymentEvent::SubscriptionCancelled { user_id, immediate });

        tracing::info!(
            user_id = %user_id,
            immediate = immediate,
            "Subscription cancelled"
        );

        Ok(subscription)
    }

    /// Clear a scheduled cancellation. Valid only while the row is still
    /// ACTIVE with `cancel_at_period_end` set.
    pub async fn reactivate(&self, user_id: Uuid) -> BillingResult<Subscription> {
        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET cancel_at_period_end = FALSE,
                auto_renew = TRUE,
                updated_at = NOW()
            WHERE user_id = $1 AND status = 'active' AND cancel_at_period_end = TRUE
            RETURNING *
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            BillingError::NotFound("No cancellation scheduled to reactivate".to_string())
        })?;

        self.events
            .publish(PaymentEvent::SubscriptionReactivated { user_id });

        tracing::info!(user_id = %user_id, "Subscription reactivated");

        Ok(subscription)
    }

    /// Transition to EXPIRED and reset the snapshot to the Free baseline.
    /// No-op (`None`) unless the row is currently ACTIVE or BILLING_RETRY.
    pub async fn mark_expired(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let expired = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET status = 'expired',
                cancel_at_period_end = FALSE,
                auto_renew = FALSE,
                updated_at = NOW()
            WHERE user_id = $1 AND status IN ('active', 'billing_retry')
            RETURNING *
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match expired {
            Some(subscription) => {
                self.snapshots
                    .reset_to_tier(user_id, SubscriptionTier::Free)
                    .await?;

                self.events
                    .publish(PaymentEvent::SubscriptionExpired { user_id });

                tracing::info!(user_id = %user_id, "Subscription expired");

                Ok(Some(subscription))
            }
            None => {
                tracing::debug!(
                    user_id = %user_id,
                    "Expiry matched no active row, skipping"
                );
                Ok(None)
            }
        }
    }

    /// Move an ACTIVE row into the billing-retry grace state. Paid
    /// entitlements continue until the already-paid period runs out.
    pub async fn mark_billing_retry(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let updated = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET status = 'billing_retry', updated_at = NOW()
            WHERE user_id = $1 AND status = 'active'
            RETURNING *
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(subscription) => {
                self.events
                    .publish(PaymentEvent::SubscriptionBillingRetry { user_id });

                tracing::warn!(user_id = %user_id, "Subscription entered billing retry");

                Ok(Some(subscription))
            }
            None => {
                tracing::debug!(
                    user_id = %user_id,
                    "Billing retry matched no active row, skipping"
                );
                Ok(None)
            }
        }
    }

    /// Record the gateway's auto-renew preference. The cancellation flag
    /// mirrors it: auto-renew off means the subscription lapses at period
    /// end.
    pub async fn set_auto_renew(
        &self,
        user_id: Uuid,
        enabled: bool,
    ) -> BillingResult<Option<Subscription>> {
        let updated = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET auto_renew = $2,
                cancel_at_period_end = NOT $2,
                updated_at = NOW()
            WHERE user_id = $1 AND status IN ('active', 'billing_retry')
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(enabled)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(subscription) => {
                self.events
                    .publish(PaymentEvent::AutoRenewChanged { user_id, enabled });

                tracing::info!(
                    user_id = %user_id,
                    enabled = enabled,
                    "Auto-renew preference updated"
                );

                Ok(Some(subscription))
            }
            None => {
                tracing::debug!(
                    user_id = %user_id,
                    "Auto-renew change matched no active row, skipping"
                );
                Ok(None)
            }
        }
    }

    /// Change the plan on an existing ACTIVE subscription.
    ///
    /// When the row is on the card rail the change is forwarded to the
    /// gateway first with the requested proration behavior; proration is
    /// never computed locally. Entitlements re-resolve immediately for
    /// upgrades and downgrades alike.
    pub async fn update_plan(
        &self,
        card_gateway: &dyn PaymentGateway,
        user_id: Uuid,
        new_tier: SubscriptionTier,
        prorate: bool,
        cancel_at_period_end: Option<bool>,
    ) -> BillingResult<Subscription> {
        if !new_tier.is_paid() {
            return Err(BillingError::Validation(
                "Downgrading to free is a cancellation, not a plan change".to_string(),
            ));
        }

        let existing = self
            .get(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("No subscription for user".to_string()))?;

        if !existing.status_parsed().is_entitled() {
            return Err(BillingError::NotFound(
                "No active subscription to change plan on".to_string(),
            ));
        }

        let previous_tier = existing.tier_parsed();

        if let Some(stripe_subscription_id) = &existing.stripe_subscription_id {
            if previous_tier != new_tier {
                card_gateway
                    .update_subscription(stripe_subscription_id, new_tier, prorate)
                    .await?;
            }
        }

        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET tier = $2,
                cancel_at_period_end = COALESCE($3, cancel_at_period_end),
                auto_renew = CASE WHEN $3 IS NULL THEN auto_renew ELSE NOT $3 END,
                updated_at = NOW()
            WHERE user_id = $1 AND status IN ('active', 'billing_retry')
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(new_tier)
        .bind(cancel_at_period_end)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            BillingError::NotFound("Subscription changed state during plan update".to_string())
        })?;

        if previous_tier != new_tier {
            self.snapshots.reset_to_tier(user_id, new_tier).await?;

            self.events.publish(PaymentEvent::PlanChanged {
                user_id,
                previous_tier,
                new_tier,
            });
        }

        tracing::info!(
            user_id = %user_id,
            previous_tier = %previous_tier,
            new_tier = %new_tier,
            prorate = prorate,
            "Subscription plan updated"
        );

        Ok(subscription)
    }

    /// Fold a gateway-side subscription update (plan switched in the Stripe
    /// portal, renewal preference changed in App Store settings) onto the
    /// local row. Absent fields keep their stored values.
    pub async fn apply_gateway_update(
        &self,
        user_id: Uuid,
        tier: Option<SubscriptionTier>,
        cancel_at_period_end: Option<bool>,
        new_period_end: Option<OffsetDateTime>,
    ) -> BillingResult<Option<Subscription>> {
        let previous = self.get(user_id).await?;

        let updated = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET tier = COALESCE($2, tier),
                cancel_at_period_end = COALESCE($3, cancel_at_period_end),
                auto_renew = CASE WHEN $3 IS NULL THEN auto_renew ELSE NOT $3 END,
                current_period_end = COALESCE($4, current_period_end),
                updated_at = NOW()
            WHERE user_id = $1 AND status IN ('active', 'billing_retry')
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(tier)
        .bind(cancel_at_period_end)
        .bind(new_period_end)
        .fetch_optional(&self.pool)
        .await?;

        let Some(subscription) = updated else {
            tracing::debug!(
                user_id = %user_id,
                "Gateway update matched no active row, skipping"
            );
            return Ok(None);
        };

        let previous_tier = previous
            .as_ref()
            .map(|p| p.tier_parsed())
            .unwrap_or_default();
        let new_tier = subscription.tier_parsed();

        if previous_tier != new_tier {
            self.snapshots.reset_to_tier(user_id, new_tier).await?;

            self.events.publish(PaymentEvent::PlanChanged {
                user_id,
                previous_tier,
                new_tier,
            });
        } else if let Some(enabled) = cancel_at_period_end.map(|flag| !flag) {
            self.events
                .publish(PaymentEvent::AutoRenewChanged { user_id, enabled });
        }

        tracing::info!(
            user_id = %user_id,
            tier = %subscription.tier,
            cancel_at_period_end = subscription.cancel_at_period_end,
            "Applied gateway subscription update"
        );

        Ok(Some(subscription))
    }
}
