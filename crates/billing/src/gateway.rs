//! Payment gateway abstraction
//!
//! One trait covering both payment rails — Stripe card billing and App Store
//! in-app purchases — so the lifecycle services and the webhook router never
//! reach for a concrete client. Operations a gateway cannot perform (the App
//! Store has no billing portal, Stripe has no receipts) return a `Gateway`
//! error rather than panicking or silently succeeding.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use lovebird_shared::types::{GatewayKind, SubscriptionTier};

use crate::error::{BillingError, BillingResult};

// =============================================================================
// Wire DTOs
// =============================================================================

/// Outcome of verifying a store receipt.
///
/// Transport and signature failures surface as `Gateway` errors;
/// business-rule rejections (forged receipt, no transactions) come back as
/// `valid = false` with a reason, so callers can relay a specific message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptVerification {
    pub valid: bool,
    /// Rejection reason when `valid = false`
    pub reason: Option<String>,
    pub external_transaction_id: String,
    /// Anchor id that survives renewals; None for one-time purchases
    pub external_original_transaction_id: Option<String>,
    pub product_id: String,
    pub purchased_at: OffsetDateTime,
    /// None for consumables
    pub expires_at: Option<OffsetDateTime>,
    pub is_trial: bool,
    pub is_intro_offer: bool,
    pub sandbox: bool,
}

impl ReceiptVerification {
    /// A business-rule rejection; transaction fields are placeholders and
    /// must not be read when `valid = false`
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
            external_transaction_id: String::new(),
            external_original_transaction_id: None,
            product_id: String::new(),
            purchased_at: OffsetDateTime::UNIX_EPOCH,
            expires_at: None,
            is_trial: false,
            is_intro_offer: false,
            sandbox: false,
        }
    }
}

/// Subscription details as the gateway reports them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySubscription {
    pub gateway_subscription_id: String,
    pub status: String,
    pub tier: Option<SubscriptionTier>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

/// Hosted checkout session handed to the client for payment collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSessionInfo {
    pub session_id: String,
    pub url: String,
}

/// Hosted billing-portal session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalSessionInfo {
    pub url: String,
}

/// Card-on-file summary for display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentMethodSummary {
    pub id: String,
    pub brand: Option<String>,
    pub last4: Option<String>,
    pub exp_month: Option<i64>,
    pub exp_year: Option<i64>,
    pub is_default: bool,
}

/// One line of billing history (an invoice or charge)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingHistoryEntry {
    pub occurred_at: OffsetDateTime,
    pub description: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub reference: Option<String>,
}

/// A decoded, signature-verified webhook notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayNotification {
    pub gateway: GatewayKind,
    /// Gateway event id when the gateway assigns one (Stripe does, legacy
    /// App Store notifications do not); drives replay detection
    pub event_id: Option<String>,
    /// Raw notification type string exactly as the gateway sent it
    pub raw_type: String,
    pub data: NotificationData,
    /// Full decoded payload, persisted on the audit row
    pub payload: serde_json::Value,
}

/// Normalized fields extracted from a notification. Everything is optional
/// at this layer; the router validates per notification type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationData {
    /// Identifier that locates the subscription row: the App Store original
    /// transaction id or the Stripe subscription id
    pub correlation_id: Option<String>,
    /// Per-event transaction id for the ledger
    pub transaction_id: Option<String>,
    pub product_id: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
    pub auto_renew: Option<bool>,
    pub tier: Option<SubscriptionTier>,
    pub cancel_at_period_end: Option<bool>,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
}

// =============================================================================
// Gateway trait
// =============================================================================

/// Uniform interface over a payment rail
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn kind(&self) -> GatewayKind;

    /// Verify an opaque client-submitted receipt with the store
    async fn verify_receipt(&self, receipt_data: &str) -> BillingResult<ReceiptVerification>;

    /// Create a customer record at the gateway; returns the gateway id
    async fn create_customer(&self, user_id: Uuid, email: &str) -> BillingResult<String>;

    /// Create a subscription directly against a stored payment method
    async fn create_subscription(
        &self,
        customer_id: &str,
        tier: SubscriptionTier,
        trial_days: Option<u32>,
    ) -> BillingResult<GatewaySubscription>;

    /// Move an existing gateway subscription to a different plan
    async fn update_subscription(
        &self,
        gateway_subscription_id: &str,
        new_tier: SubscriptionTier,
        prorate: bool,
    ) -> BillingResult<GatewaySubscription>;

    /// Cancel at the gateway, immediately or at the period boundary
    async fn cancel_subscription(
        &self,
        gateway_subscription_id: &str,
        at_period_end: bool,
    ) -> BillingResult<()>;

    /// Hosted checkout for collecting payment and starting a subscription
    async fn create_checkout_session(
        &self,
        user_id: Uuid,
        email: &str,
        tier: SubscriptionTier,
        annual: bool,
    ) -> BillingResult<CheckoutSessionInfo>;

    /// Hosted self-service billing portal
    async fn create_portal_session(&self, customer_id: &str) -> BillingResult<PortalSessionInfo>;

    async fn list_payment_methods(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<PaymentMethodSummary>>;

    async fn list_billing_history(
        &self,
        customer_id: &str,
        limit: u32,
    ) -> BillingResult<Vec<BillingHistoryEntry>>;

    /// Verify and decode a raw webhook body. Synchronous: signature checks
    /// and JSON parsing never leave the process.
    fn decode_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> BillingResult<GatewayNotification>;
}

/// Error for operations a payment rail does not offer
pub(crate) fn unsupported(gateway: GatewayKind, operation: &str) -> BillingError {
    BillingError::Gateway(format!("{} gateway does not support {}", gateway, operation))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_data_defaults_to_empty() {
        let data = NotificationData::default();
        assert!(data.correlation_id.is_none());
        assert!(data.transaction_id.is_none());
        assert!(data.expires_at.is_none());
    }

    #[test]
    fn test_unsupported_error_names_the_gateway() {
        let err = unsupported(GatewayKind::Apple, "billing portal sessions");
        assert!(matches!(err, BillingError::Gateway(_)));
        assert!(err.to_string().contains("apple"));
    }
}
