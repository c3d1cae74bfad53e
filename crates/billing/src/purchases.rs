//! Receipt-driven purchase intake.
//!
//! The client-initiated flow: verify the receipt with the gateway, resolve
//! the product against the catalog, then either activate a subscription or
//! credit a consumable, with the transaction ledger as the replay guard.
//!
//! ## Design Principles
//!
//! - **Verify before writing**: nothing touches the database until the
//!   gateway has vouched for the receipt. Store-side rejections surface as
//!   `Validation` errors carrying the store's reason.
//! - **Ordering differs per product kind**: subscriptions activate before
//!   their ledger row is written, so a replay after a partial failure still
//!   restores the entitlement. Consumables record before granting, so a
//!   replayed receipt never double-credits.
//! - **Replays are not errors**: resubmitting an already-processed receipt
//!   returns `already_processed = true` with the original transaction.

use std::sync::Arc;

use sqlx::PgPool;
use time::Duration;
use uuid::Uuid;

use lovebird_shared::types::{Subscription, Transaction, TransactionKind};

use crate::catalog::{self, ConsumableProduct, Product, SubscriptionProduct};
use crate::error::{BillingError, BillingResult};
use crate::events::{EventPublisher, PaymentEvent};
use crate::gateway::{PaymentGateway, ReceiptVerification};
use crate::ledger::{LedgerService, NewTransaction};
use crate::subscriptions::{NewSubscription, SubscriptionService};

/// Result of submitting a store receipt.
#[derive(Debug, Clone)]
pub struct PurchaseOutcome {
    /// True when this receipt's transaction was already in the ledger.
    pub already_processed: bool,
    /// Present when the receipt carried a subscription product.
    pub subscription: Option<Subscription>,
    /// The ledger row backing this purchase.
    pub transaction: Transaction,
}

/// Orchestrates receipt submission end to end.
#[derive(Clone)]
pub struct PurchaseService {
    gateway: Arc<dyn PaymentGateway>,
    subscriptions: SubscriptionService,
    ledger: LedgerService,
    events: Arc<dyn EventPublisher>,
}

impl PurchaseService {
    pub fn new(
        pool: PgPool,
        gateway: Arc<dyn PaymentGateway>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            gateway,
            subscriptions: SubscriptionService::new(pool.clone(), events.clone()),
            ledger: LedgerService::new(pool),
            events,
        }
    }

    /// Submit a store receipt on behalf of a user.
    ///
    /// Verifies the receipt, matches it against the product catalog, and
    /// either activates/renews a subscription or credits a consumable.
    /// Submitting the same receipt twice is safe.
    pub async fn submit_receipt(
        &self,
        user_id: Uuid,
        receipt_data: &str,
    ) -> BillingResult<PurchaseOutcome> {
        let verification = self.gateway.verify_receipt(receipt_data).await?;

        if !verification.valid {
            let reason = verification
                .reason
                .unwrap_or_else(|| "Receipt rejected by the store".to_string());
            tracing::warn!(user_id = %user_id, reason = %reason, "Receipt failed verification");
            return Err(BillingError::Validation(reason));
        }

        let product = catalog::lookup(&verification.product_id).ok_or_else(|| {
            BillingError::Validation(format!(
                "Unknown product '{}' on verified receipt",
                verification.product_id
            ))
        })?;

        match product {
            Product::Subscription(sub) => {
                self.process_subscription(user_id, sub, verification).await
            }
            Product::Consumable(consumable) => {
                self.process_consumable(user_id, consumable, verification)
                    .await
            }
        }
    }

    async fn process_subscription(
        &self,
        user_id: Uuid,
        product: &'static SubscriptionProduct,
        verification: ReceiptVerification,
    ) -> BillingResult<PurchaseOutcome> {
        let period_end = verification
            .expires_at
            .unwrap_or_else(|| verification.purchased_at + Duration::days(product.period.days()));

        // The original transaction id anchors later renewal notifications.
        // First purchases carry none, so the transaction id itself is the
        // anchor.
        let original_id = verification
            .external_original_transaction_id
            .clone()
            .unwrap_or_else(|| verification.external_transaction_id.clone());

        let subscription = self
            .subscriptions
            .activate_or_renew(NewSubscription {
                user_id,
                tier: product.tier,
                period_end,
                is_trial: verification.is_trial,
                is_intro_offer: verification.is_intro_offer,
                trial_end: verification.is_trial.then_some(period_end),
                apple_product_id: Some(verification.product_id.clone()),
                apple_transaction_id: Some(verification.external_transaction_id.clone()),
                apple_original_transaction_id: Some(original_id.clone()),
                ..Default::default()
            })
            .await?;

        let outcome = self
            .ledger
            .record_if_new(NewTransaction {
                user_id,
                external_transaction_id: verification.external_transaction_id.clone(),
                external_original_transaction_id: Some(original_id),
                product_id: verification.product_id.clone(),
                kind: TransactionKind::Subscription,
                amount_cents: None,
                currency: None,
            })
            .await?;

        self.warn_on_foreign_replay(user_id, &outcome.transaction, outcome.created);

        Ok(PurchaseOutcome {
            already_processed: !outcome.created,
            subscription: Some(subscription),
            transaction: outcome.transaction,
        })
    }

    async fn process_consumable(
        &self,
        user_id: Uuid,
        product: &'static ConsumableProduct,
        verification: ReceiptVerification,
    ) -> BillingResult<PurchaseOutcome> {
        let outcome = self
            .ledger
            .record_if_new(NewTransaction {
                user_id,
                external_transaction_id: verification.external_transaction_id.clone(),
                external_original_transaction_id: verification
                    .external_original_transaction_id
                    .clone(),
                product_id: verification.product_id.clone(),
                kind: TransactionKind::Consumable,
                amount_cents: None,
                currency: None,
            })
            .await?;

        if outcome.created {
            self.ledger.grant_consumable(user_id, product).await?;
            self.events.publish(PaymentEvent::ConsumableGranted {
                user_id,
                product_id: product.product_id.to_string(),
                boosts: product.boosts,
                super_likes: product.super_likes,
            });
        } else {
            tracing::info!(
                user_id = %user_id,
                external_transaction_id = %verification.external_transaction_id,
                "Consumable receipt already processed, skipping grant"
            );
        }

        self.warn_on_foreign_replay(user_id, &outcome.transaction, outcome.created);

        Ok(PurchaseOutcome {
            already_processed: !outcome.created,
            subscription: None,
            transaction: outcome.transaction,
        })
    }

    /// A replayed transaction owned by a different account usually means a
    /// shared or resold receipt.
    fn warn_on_foreign_replay(&self, user_id: Uuid, transaction: &Transaction, created: bool) {
        if !created && transaction.user_id != user_id {
            tracing::warn!(
                user_id = %user_id,
                owner_id = %transaction.user_id,
                external_transaction_id = %transaction.external_transaction_id,
                "Receipt transaction already belongs to another user"
            );
        }
    }
}
