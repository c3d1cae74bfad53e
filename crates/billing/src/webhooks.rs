//! Webhook event router
//!
//! Normalizes raw gateway notifications into a closed set of types and
//! drives the matching state-machine and ledger operations. `route` never
//! returns an error: webhook handling failures are invisible to end users
//! by design, so every internal failure is folded into the outcome and the
//! audit row, and scheduled reconciliation corrects state later.
//!
//! ## Design Principles
//!
//! - Decode and signature verification happen before anything is written.
//! - Events with a stable id are claimed atomically in the audit log; a
//!   replay acknowledges as a duplicate without re-running side effects.
//! - Per-type required-field validation fails only the offending event.
//! - Notifications referencing subscriptions this system has not seen
//!   (out-of-order delivery) are logged no-ops, not errors.

use std::sync::Arc;

use sqlx::PgPool;

use lovebird_shared::types::{GatewayKind, TransactionKind, WebhookStatus};

use crate::audit::{AuditService, ClaimOutcome};
use crate::error::{BillingError, BillingResult};
use crate::events::{EventPublisher, PaymentEvent};
use crate::gateway::{NotificationData, PaymentGateway};
use crate::ledger::{LedgerService, NewTransaction};
use crate::subscriptions::SubscriptionService;

// =============================================================================
// Notification types
// =============================================================================

/// Closed set of notification types the router acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationType {
    Renewed,
    Expired,
    Refund,
    FailedToRenew,
    RenewalStatusChanged,
    SubscriptionUpdated,
    SubscriptionDeleted,
    /// Anything not in the alias table; acknowledged and ignored
    Unknown(String),
}

/// Raw gateway names resolved to router types. App Store legacy names are
/// SCREAMING_SNAKE, Stripe names are dotted lowercase, so one table serves
/// both gateways without collisions.
static NOTIFICATION_ALIASES: &[(&str, NotificationType)] = &[
    // App Store
    ("DID_RENEW", NotificationType::Renewed),
    ("INTERACTIVE_RENEWAL", NotificationType::Renewed),
    ("DID_RECOVER", NotificationType::Renewed),
    ("EXPIRED", NotificationType::Expired),
    ("CANCEL", NotificationType::Refund),
    ("REFUND", NotificationType::Refund),
    ("DID_FAIL_TO_RENEW", NotificationType::FailedToRenew),
    ("DID_CHANGE_RENEWAL_STATUS", NotificationType::RenewalStatusChanged),
    ("DID_CHANGE_RENEWAL_PREF", NotificationType::SubscriptionUpdated),
    // Stripe
    ("invoice.paid", NotificationType::Renewed),
    ("invoice.payment_succeeded", NotificationType::Renewed),
    ("invoice.payment_failed", NotificationType::FailedToRenew),
    ("charge.refunded", NotificationType::Refund),
    ("customer.subscription.updated", NotificationType::SubscriptionUpdated),
    ("customer.subscription.deleted", NotificationType::SubscriptionDeleted),
];

impl NotificationType {
    /// Resolve a raw gateway notification name
    pub fn resolve(raw: &str) -> Self {
        NOTIFICATION_ALIASES
            .iter()
            .find(|(name, _)| *name == raw)
            .map(|(_, notification_type)| notification_type.clone())
            .unwrap_or_else(|| Self::Unknown(raw.to_string()))
    }
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Renewed => write!(f, "renewed"),
            Self::Expired => write!(f, "expired"),
            Self::Refund => write!(f, "refund"),
            Self::FailedToRenew => write!(f, "failed_to_renew"),
            Self::RenewalStatusChanged => write!(f, "renewal_status_changed"),
            Self::SubscriptionUpdated => write!(f, "subscription_updated"),
            Self::SubscriptionDeleted => write!(f, "subscription_deleted"),
            Self::Unknown(raw) => write!(f, "unknown({})", raw),
        }
    }
}

/// What `route` did with one notification
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    /// Whether the gateway should consider this delivery handled
    pub processed: bool,
    pub notification_type: NotificationType,
    pub action_taken: String,
    pub error: Option<String>,
}

impl RouteOutcome {
    fn handled(notification_type: NotificationType, action: impl Into<String>) -> Self {
        Self {
            processed: true,
            notification_type,
            action_taken: action.into(),
            error: None,
        }
    }

    fn rejected(
        notification_type: NotificationType,
        action: impl Into<String>,
        error: &BillingError,
    ) -> Self {
        Self {
            processed: false,
            notification_type,
            action_taken: action.into(),
            error: Some(error.to_string()),
        }
    }
}

// =============================================================================
// Router
// =============================================================================

/// Routes inbound gateway notifications to state transitions
pub struct WebhookRouter {
    stripe: Arc<dyn PaymentGateway>,
    apple: Arc<dyn PaymentGateway>,
    subscriptions: SubscriptionService,
    ledger: LedgerService,
    audit: AuditService,
    events: Arc<dyn EventPublisher>,
}

impl WebhookRouter {
    pub fn new(
        pool: PgPool,
        stripe: Arc<dyn PaymentGateway>,
        apple: Arc<dyn PaymentGateway>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            stripe,
            apple,
            subscriptions: SubscriptionService::new(pool.clone(), events.clone()),
            ledger: LedgerService::new(pool.clone()),
            audit: AuditService::new(pool),
            events,
        }
    }

    fn adapter(&self, gateway: GatewayKind) -> &dyn PaymentGateway {
        match gateway {
            GatewayKind::Stripe => self.stripe.as_ref(),
            GatewayKind::Apple => self.apple.as_ref(),
        }
    }

    /// Process one inbound notification end to end.
    ///
    /// Infallible by contract: decode failures, validation failures, and
    /// dispatch failures all come back inside the outcome.
    pub async fn route(
        &self,
        gateway: GatewayKind,
        payload: &[u8],
        signature: Option<&str>,
    ) -> RouteOutcome {
        let notification = match self.adapter(gateway).decode_webhook(payload, signature) {
            Ok(notification) => notification,
            Err(e) => {
                tracing::warn!(gateway = %gateway, error = %e, "Webhook rejected at decode");
                return RouteOutcome::rejected(
                    NotificationType::Unknown("undecodable".to_string()),
                    "rejected",
                    &e,
                );
            }
        };

        let notification_type = NotificationType::resolve(&notification.raw_type);

        let audit_id = match self
            .audit
            .claim(
                gateway,
                notification.event_id.as_deref(),
                &notification.raw_type,
                &notification.payload,
            )
            .await
        {
            Ok(ClaimOutcome::Claimed(id)) => id,
            Ok(ClaimOutcome::Duplicate) => {
                return RouteOutcome::handled(notification_type, "duplicate");
            }
            Err(e) => {
                // Without a claim there is no replay protection; refuse so
                // the gateway redelivers
                tracing::error!(
                    gateway = %gateway,
                    error = %e,
                    "Failed to claim webhook event"
                );
                return RouteOutcome::rejected(notification_type, "claim_failed", &e);
            }
        };

        let dispatched = self
            .dispatch(gateway, &notification_type, &notification.data)
            .await;

        match dispatched {
            Ok(action) => {
                if let Err(e) = self
                    .audit
                    .finalize(audit_id, WebhookStatus::Processed, None)
                    .await
                {
                    tracing::warn!(audit_id = %audit_id, error = %e, "Failed to finalize audit row");
                }

                tracing::info!(
                    gateway = %gateway,
                    notification_type = %notification_type,
                    action = %action,
                    "Webhook processed"
                );

                RouteOutcome::handled(notification_type, action)
            }
            Err(e) => {
                if let Err(finalize_err) = self
                    .audit
                    .finalize(audit_id, WebhookStatus::Failed, Some(&e.to_string()))
                    .await
                {
                    tracing::warn!(
                        audit_id = %audit_id,
                        error = %finalize_err,
                        "Failed to finalize audit row"
                    );
                }

                tracing::error!(
                    gateway = %gateway,
                    notification_type = %notification_type,
                    error = %e,
                    "Webhook dispatch failed"
                );

                RouteOutcome::rejected(notification_type, "failed", &e)
            }
        }
    }

    /// Validate the fields a notification type needs, then run its
    /// transition. Returns the action taken for the outcome and audit trail.
    async fn dispatch(
        &self,
        gateway: GatewayKind,
        notification_type: &NotificationType,
        data: &NotificationData,
    ) -> BillingResult<String> {
        match notification_type {
            NotificationType::Renewed => {
                let correlation_id = require(data.correlation_id.as_deref(), notification_type, "correlation id")?;
                let expires_at = data.expires_at.ok_or_else(|| {
                    BillingError::Validation(format!(
                        "{} notification missing expiry date",
                        notification_type
                    ))
                })?;

                let Some(subscription) = self
                    .subscriptions
                    .renew_from_notification(gateway, correlation_id, expires_at)
                    .await?
                else {
                    return Ok("no_match".to_string());
                };

                // Bookkeeping write; the renewal itself already committed
                if let (Some(transaction_id), Some(product_id)) =
                    (&data.transaction_id, &data.product_id)
                {
                    let record = self
                        .ledger
                        .record_if_new(NewTransaction {
                            user_id: subscription.user_id,
                            external_transaction_id: transaction_id.clone(),
                            external_original_transaction_id: Some(correlation_id.to_string()),
                            product_id: product_id.clone(),
                            kind: TransactionKind::Subscription,
                            amount_cents: data.amount_cents,
                            currency: data.currency.clone(),
                        })
                        .await;

                    if let Err(e) = record {
                        tracing::warn!(
                            transaction_id = %transaction_id,
                            error = %e,
                            "Failed to record renewal transaction"
                        );
                    }
                }

                Ok("renewed".to_string())
            }

            NotificationType::Expired | NotificationType::SubscriptionDeleted => {
                let correlation_id = require(data.correlation_id.as_deref(), notification_type, "correlation id")?;

                let Some(subscription) = self
                    .subscriptions
                    .find_by_correlation(gateway, correlation_id)
                    .await?
                else {
                    tracing::warn!(
                        gateway = %gateway,
                        correlation_id = %correlation_id,
                        "Expiry notification matched no subscription, skipping"
                    );
                    return Ok("no_match".to_string());
                };

                match self.subscriptions.mark_expired(subscription.user_id).await? {
                    Some(_) => Ok("expired".to_string()),
                    None => Ok("no_match".to_string()),
                }
            }

            NotificationType::Refund => {
                let transaction_id = require(data.transaction_id.as_deref(), notification_type, "transaction id")?;

                let transaction = self.ledger.mark_refunded(transaction_id).await?;

                // A refunded subscription payment revokes access now; a
                // refunded consumable only flips the ledger row
                if transaction.kind_parsed() == Some(TransactionKind::Subscription) {
                    match self.subscriptions.cancel(transaction.user_id, true).await {
                        Ok(_) => {}
                        Err(BillingError::NotFound(_)) => {
                            tracing::info!(
                                user_id = %transaction.user_id,
                                "Refunded subscription already terminal"
                            );
                        }
                        Err(e) => return Err(e),
                    }
                }

                self.events.publish(PaymentEvent::RefundProcessed {
                    user_id: transaction.user_id,
                    external_transaction_id: transaction_id.to_string(),
                });

                Ok("refunded".to_string())
            }

            NotificationType::FailedToRenew => {
                let correlation_id = require(data.correlation_id.as_deref(), notification_type, "correlation id")?;

                let Some(subscription) = self
                    .subscriptions
                    .find_by_correlation(gateway, correlation_id)
                    .await?
                else {
                    tracing::warn!(
                        gateway = %gateway,
                        correlation_id = %correlation_id,
                        "Renewal failure matched no subscription, skipping"
                    );
                    return Ok("no_match".to_string());
                };

                match self
                    .subscriptions
                    .mark_billing_retry(subscription.user_id)
                    .await?
                {
                    Some(_) => Ok("billing_retry".to_string()),
                    None => Ok("no_match".to_string()),
                }
            }

            NotificationType::RenewalStatusChanged => {
                let correlation_id = require(data.correlation_id.as_deref(), notification_type, "correlation id")?;
                let enabled = data.auto_renew.ok_or_else(|| {
                    BillingError::Validation(format!(
                        "{} notification missing auto-renew status",
                        notification_type
                    ))
                })?;

                let Some(subscription) = self
                    .subscriptions
                    .find_by_correlation(gateway, correlation_id)
                    .await?
                else {
                    tracing::warn!(
                        gateway = %gateway,
                        correlation_id = %correlation_id,
                        "Renewal status change matched no subscription, skipping"
                    );
                    return Ok("no_match".to_string());
                };

                match self
                    .subscriptions
                    .set_auto_renew(subscription.user_id, enabled)
                    .await?
                {
                    Some(_) => Ok("auto_renew_updated".to_string()),
                    None => Ok("no_match".to_string()),
                }
            }

            NotificationType::SubscriptionUpdated => {
                let correlation_id = require(data.correlation_id.as_deref(), notification_type, "correlation id")?;

                let Some(subscription) = self
                    .subscriptions
                    .find_by_correlation(gateway, correlation_id)
                    .await?
                else {
                    tracing::warn!(
                        gateway = %gateway,
                        correlation_id = %correlation_id,
                        "Subscription update matched no subscription, skipping"
                    );
                    return Ok("no_match".to_string());
                };

                match self
                    .subscriptions
                    .apply_gateway_update(
                        subscription.user_id,
                        data.tier,
                        data.cancel_at_period_end,
                        data.expires_at,
                    )
                    .await?
                {
                    Some(_) => Ok("subscription_synced".to_string()),
                    None => Ok("no_match".to_string()),
                }
            }

            NotificationType::Unknown(raw) => {
                tracing::info!(raw_type = %raw, "Ignoring unhandled notification type");
                Ok("ignored".to_string())
            }
        }
    }
}

fn require<'a>(
    value: Option<&'a str>,
    notification_type: &NotificationType,
    field: &str,
) -> BillingResult<&'a str> {
    value.ok_or_else(|| {
        BillingError::Validation(format!(
            "{} notification missing {}",
            notification_type, field
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_apple_aliases() {
        assert_eq!(
            NotificationType::resolve("DID_RENEW"),
            NotificationType::Renewed
        );
        assert_eq!(
            NotificationType::resolve("DID_RECOVER"),
            NotificationType::Renewed
        );
        assert_eq!(
            NotificationType::resolve("CANCEL"),
            NotificationType::Refund
        );
        assert_eq!(
            NotificationType::resolve("DID_FAIL_TO_RENEW"),
            NotificationType::FailedToRenew
        );
        assert_eq!(
            NotificationType::resolve("DID_CHANGE_RENEWAL_STATUS"),
            NotificationType::RenewalStatusChanged
        );
    }

    #[test]
    fn test_resolve_stripe_aliases() {
        assert_eq!(
            NotificationType::resolve("invoice.paid"),
            NotificationType::Renewed
        );
        assert_eq!(
            NotificationType::resolve("invoice.payment_failed"),
            NotificationType::FailedToRenew
        );
        assert_eq!(
            NotificationType::resolve("customer.subscription.deleted"),
            NotificationType::SubscriptionDeleted
        );
        assert_eq!(
            NotificationType::resolve("charge.refunded"),
            NotificationType::Refund
        );
    }

    #[test]
    fn test_resolve_unknown_preserves_raw_name() {
        assert_eq!(
            NotificationType::resolve("PRICE_INCREASE_CONSENT"),
            NotificationType::Unknown("PRICE_INCREASE_CONSENT".to_string())
        );
        assert_eq!(
            NotificationType::resolve("payment_intent.created"),
            NotificationType::Unknown("payment_intent.created".to_string())
        );
    }

    #[test]
    fn test_alias_table_has_no_duplicate_names() {
        let mut names: Vec<&str> = NOTIFICATION_ALIASES.iter().map(|(name, _)| *name).collect();
        names.sort_unstable();
        let before = names.len();
        names.dedup();
        assert_eq!(before, names.len());
    }

    #[test]
    fn test_require_reports_type_and_field() {
        let err = require(None, &NotificationType::Renewed, "correlation id")
            .err()
            .map(|e| e.to_string())
            .unwrap_or_default();
        assert!(err.contains("renewed"));
        assert!(err.contains("correlation id"));

        assert_eq!(
            require(Some("sub_1"), &NotificationType::Renewed, "correlation id").ok(),
            Some("sub_1")
        );
    }
}
