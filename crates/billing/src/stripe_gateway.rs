//! Stripe gateway adapter
//!
//! Card-rail implementation of [`PaymentGateway`]. Webhook signatures are
//! verified with a direct HMAC check of the `Stripe-Signature` header and the
//! payload is decoded as plain JSON (workaround for async-stripe API version
//! incompatibility with current Stripe event schemas).

use std::collections::HashMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use stripe::{
    BillingPortalSession, CancelSubscription, CheckoutSession, CheckoutSessionMode,
    CreateBillingPortalSession, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCustomer, CreateSubscription, CreateSubscriptionItems, Customer, CustomerId,
    ListInvoices, ListPaymentMethods, PaymentMethod, PaymentMethodTypeFilter, Subscription,
    SubscriptionId, UpdateSubscription, UpdateSubscriptionItems,
};
// Import the proration behavior enum from the subscription module (not subscription_item)
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use time::OffsetDateTime;
use uuid::Uuid;

use lovebird_shared::types::{GatewayKind, SubscriptionTier};

use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    unsupported, BillingHistoryEntry, CheckoutSessionInfo, GatewayNotification,
    GatewaySubscription, NotificationData, PaymentGateway, PaymentMethodSummary,
    PortalSessionInfo, ReceiptVerification,
};

/// Maximum age of a webhook signature timestamp
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Stripe gateway
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Price IDs for each paid tier
    pub price_ids: PriceIds,
    /// Base URL for success/cancel/portal-return redirects
    pub app_base_url: String,
}

/// Stripe price IDs for the paid tiers
/// Tier hierarchy: Free (no price) → Plus → Premium
#[derive(Debug, Clone)]
pub struct PriceIds {
    pub plus: String,
    pub premium: String,

    // Annual prices (optional; discounted)
    pub plus_annual: Option<String>,
    pub premium_annual: Option<String>,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            price_ids: PriceIds {
                plus: std::env::var("STRIPE_PRICE_PLUS")
                    .map_err(|_| BillingError::Config("STRIPE_PRICE_PLUS not set".to_string()))?,
                premium: std::env::var("STRIPE_PRICE_PREMIUM").map_err(|_| {
                    BillingError::Config("STRIPE_PRICE_PREMIUM not set".to_string())
                })?,
                plus_annual: std::env::var("STRIPE_PRICE_PLUS_ANNUAL").ok(),
                premium_annual: std::env::var("STRIPE_PRICE_PREMIUM_ANNUAL").ok(),
            },
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        })
    }

    /// Get the price ID for a paid tier
    pub fn price_id_for_tier(&self, tier: SubscriptionTier, annual: bool) -> Option<&str> {
        match (tier, annual) {
            (SubscriptionTier::Plus, false) => Some(&self.price_ids.plus),
            (SubscriptionTier::Premium, false) => Some(&self.price_ids.premium),
            (SubscriptionTier::Plus, true) => self.price_ids.plus_annual.as_deref(),
            (SubscriptionTier::Premium, true) => self.price_ids.premium_annual.as_deref(),
            (SubscriptionTier::Free, _) => None,
        }
    }

    /// Get the tier for a price ID (handles both monthly and annual prices)
    pub fn tier_for_price_id(&self, price_id: &str) -> Option<SubscriptionTier> {
        if price_id == self.price_ids.plus {
            Some(SubscriptionTier::Plus)
        } else if price_id == self.price_ids.premium {
            Some(SubscriptionTier::Premium)
        } else if self.price_ids.plus_annual.as_deref() == Some(price_id) {
            Some(SubscriptionTier::Plus)
        } else if self.price_ids.premium_annual.as_deref() == Some(price_id) {
            Some(SubscriptionTier::Premium)
        } else {
            None
        }
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// Stripe implementation of [`PaymentGateway`]
#[derive(Clone)]
pub struct StripeGateway {
    client: stripe::Client,
    config: StripeConfig,
}

impl StripeGateway {
    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(&config.secret_key);
        Self { client, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    fn parse_customer_id(customer_id: &str) -> BillingResult<CustomerId> {
        customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::Gateway(format!("Invalid customer ID: {}", e)))
    }

    fn parse_subscription_id(subscription_id: &str) -> BillingResult<SubscriptionId> {
        subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::Gateway(format!("Invalid subscription ID: {}", e)))
    }

    fn to_gateway_subscription(&self, subscription: &Subscription) -> GatewaySubscription {
        let tier = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .and_then(|price| self.config.tier_for_price_id(price.id.as_str()));

        GatewaySubscription {
            gateway_subscription_id: subscription.id.to_string(),
            status: subscription.status.to_string(),
            tier,
            current_period_end: OffsetDateTime::from_unix_timestamp(
                subscription.current_period_end,
            )
            .ok(),
            cancel_at_period_end: subscription.cancel_at_period_end,
        }
    }

    /// Pull the router-relevant fields out of an event's data object
    fn extract_notification_data(
        &self,
        raw_type: &str,
        object: &serde_json::Value,
    ) -> NotificationData {
        let mut data = NotificationData::default();

        match raw_type {
            t if t.starts_with("customer.subscription.") => {
                data.correlation_id = object["id"].as_str().map(String::from);
                data.cancel_at_period_end = object["cancel_at_period_end"].as_bool();
                data.auto_renew = object["cancel_at_period_end"].as_bool().map(|c| !c);
                data.expires_at = object["current_period_end"]
                    .as_i64()
                    .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());
                let price_id = object["items"]["data"][0]["price"]["id"].as_str();
                data.product_id = price_id.map(String::from);
                data.tier = price_id.and_then(|p| self.config.tier_for_price_id(p));
            }
            "invoice.paid" | "invoice.payment_succeeded" => {
                data.correlation_id = object["subscription"].as_str().map(String::from);
                data.transaction_id = object["id"].as_str().map(String::from);
                data.amount_cents = object["amount_paid"].as_i64();
                data.currency = object["currency"].as_str().map(String::from);
                let line = &object["lines"]["data"][0];
                data.expires_at = line["period"]["end"]
                    .as_i64()
                    .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());
                let price_id = line["price"]["id"].as_str();
                data.product_id = price_id.map(String::from);
                data.tier = price_id.and_then(|p| self.config.tier_for_price_id(p));
            }
            "invoice.payment_failed" => {
                data.correlation_id = object["subscription"].as_str().map(String::from);
                data.transaction_id = object["id"].as_str().map(String::from);
            }
            "charge.refunded" => {
                // Ledger rows for card payments are keyed by invoice id
                data.transaction_id = object["invoice"]
                    .as_str()
                    .or_else(|| object["id"].as_str())
                    .map(String::from);
                data.amount_cents = object["amount_refunded"].as_i64();
                data.currency = object["currency"].as_str().map(String::from);
            }
            _ => {}
        }

        data
    }
}

/// Verify a `Stripe-Signature` header (`t=<ts>,v1=<hex>`) against the raw
/// payload. HMAC-SHA256 over `"{t}.{payload}"`, constant-time compare,
/// timestamp bounded by `SIGNATURE_TOLERANCE_SECS`.
fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        BillingError::Validation("Malformed Stripe-Signature header: missing timestamp".to_string())
    })?;
    if candidates.is_empty() {
        return Err(BillingError::Validation(
            "Malformed Stripe-Signature header: missing v1 signature".to_string(),
        ));
    }

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(BillingError::Validation(
            "Stripe webhook timestamp outside tolerance".to_string(),
        ));
    }

    for candidate in candidates {
        let Ok(sig_bytes) = hex::decode(candidate) else {
            continue;
        };
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|e| BillingError::Internal(format!("HMAC init failed: {}", e)))?;
        mac.update(format!("{}.", timestamp).as_bytes());
        mac.update(payload);
        if mac.verify_slice(&sig_bytes).is_ok() {
            return Ok(());
        }
    }

    Err(BillingError::Validation(
        "Stripe webhook signature verification failed".to_string(),
    ))
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Stripe
    }

    async fn verify_receipt(&self, _receipt_data: &str) -> BillingResult<ReceiptVerification> {
        Err(unsupported(GatewayKind::Stripe, "receipt verification"))
    }

    async fn create_customer(&self, user_id: Uuid, email: &str) -> BillingResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("platform".to_string(), "lovebird".to_string());

        let params = CreateCustomer {
            email: Some(email),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = Customer::create(&self.client, params).await?;

        tracing::info!(
            user_id = %user_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );

        Ok(customer.id.to_string())
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        tier: SubscriptionTier,
        trial_days: Option<u32>,
    ) -> BillingResult<GatewaySubscription> {
        let price_id = self
            .config
            .price_id_for_tier(tier, false)
            .ok_or_else(|| {
                BillingError::Validation(format!("No Stripe price for tier '{}'", tier))
            })?
            .to_string();

        let customer_id = Self::parse_customer_id(customer_id)?;

        let mut metadata = HashMap::new();
        metadata.insert("tier".to_string(), tier.to_string());

        let mut params = CreateSubscription::new(customer_id);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(price_id),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(metadata);
        params.trial_period_days = trial_days;

        let subscription = Subscription::create(&self.client, params).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            tier = %tier,
            "Created Stripe subscription"
        );

        Ok(self.to_gateway_subscription(&subscription))
    }

    async fn update_subscription(
        &self,
        gateway_subscription_id: &str,
        new_tier: SubscriptionTier,
        prorate: bool,
    ) -> BillingResult<GatewaySubscription> {
        let sub_id = Self::parse_subscription_id(gateway_subscription_id)?;

        let price_id = self
            .config
            .price_id_for_tier(new_tier, false)
            .ok_or_else(|| {
                BillingError::Validation(format!("No Stripe price for tier '{}'", new_tier))
            })?
            .to_string();

        // The item id is needed to swap the price in place
        let current = Subscription::retrieve(&self.client, &sub_id, &[]).await?;
        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| {
                BillingError::Internal("No subscription items found".to_string())
            })?;

        let mut metadata = HashMap::new();
        metadata.insert("tier".to_string(), new_tier.to_string());

        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                price: Some(price_id),
                ..Default::default()
            }]),
            metadata: Some(metadata),
            proration_behavior: Some(if prorate {
                SubscriptionProrationBehavior::CreateProrations
            } else {
                SubscriptionProrationBehavior::None
            }),
            ..Default::default()
        };

        let subscription = Subscription::update(&self.client, &sub_id, params).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            new_tier = %new_tier,
            prorate = prorate,
            "Updated Stripe subscription plan"
        );

        Ok(self.to_gateway_subscription(&subscription))
    }

    async fn cancel_subscription(
        &self,
        gateway_subscription_id: &str,
        at_period_end: bool,
    ) -> BillingResult<()> {
        let sub_id = Self::parse_subscription_id(gateway_subscription_id)?;

        if at_period_end {
            let params = UpdateSubscription {
                cancel_at_period_end: Some(true),
                ..Default::default()
            };
            Subscription::update(&self.client, &sub_id, params).await?;
        } else {
            let params = CancelSubscription {
                cancellation_details: None,
                invoice_now: None,
                prorate: None,
            };
            Subscription::cancel(&self.client, &sub_id, params).await?;
        }

        tracing::info!(
            subscription_id = %sub_id,
            at_period_end = at_period_end,
            "Cancelled Stripe subscription"
        );

        Ok(())
    }

    async fn create_checkout_session(
        &self,
        user_id: Uuid,
        email: &str,
        tier: SubscriptionTier,
        annual: bool,
    ) -> BillingResult<CheckoutSessionInfo> {
        let price_id = self
            .config
            .price_id_for_tier(tier, annual)
            .ok_or_else(|| {
                BillingError::Validation(format!(
                    "No Stripe price for tier '{}' (annual={})",
                    tier, annual
                ))
            })?
            .to_string();

        let base_url = &self.config.app_base_url;
        let success_url = format!(
            "{}/billing/success?session_id={{CHECKOUT_SESSION_ID}}",
            base_url
        );
        let cancel_url = format!("{}/billing/cancel", base_url);

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("tier".to_string(), tier.to_string());

        let params = CreateCheckoutSession {
            customer_email: Some(email),
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(vec![CreateCheckoutSessionLineItems {
                price: Some(price_id),
                quantity: Some(1),
                ..Default::default()
            }]),
            success_url: Some(&success_url),
            cancel_url: Some(&cancel_url),
            metadata: Some(metadata),
            allow_promotion_codes: Some(true),
            ..Default::default()
        };

        let session = CheckoutSession::create(&self.client, params).await?;

        tracing::info!(
            user_id = %user_id,
            session_id = %session.id,
            tier = %tier,
            annual = annual,
            "Created checkout session"
        );

        Ok(CheckoutSessionInfo {
            session_id: session.id.to_string(),
            url: session.url.unwrap_or_default(),
        })
    }

    async fn create_portal_session(&self, customer_id: &str) -> BillingResult<PortalSessionInfo> {
        let customer_id = Self::parse_customer_id(customer_id)?;
        let return_url = format!("{}/billing", self.config.app_base_url);

        let mut params = CreateBillingPortalSession::new(customer_id);
        params.return_url = Some(&return_url);

        let session = BillingPortalSession::create(&self.client, params).await?;

        tracing::info!(customer_id = %session.customer, "Created billing portal session");

        Ok(PortalSessionInfo { url: session.url })
    }

    async fn list_payment_methods(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<PaymentMethodSummary>> {
        let customer_id = Self::parse_customer_id(customer_id)?;

        // Default payment method lives on the customer, not the list
        let customer = Customer::retrieve(&self.client, &customer_id, &[]).await?;
        let default_id = customer
            .invoice_settings
            .and_then(|settings| settings.default_payment_method)
            .map(|pm| match pm {
                stripe::Expandable::Id(id) => id.to_string(),
                stripe::Expandable::Object(pm) => pm.id.to_string(),
            });

        let methods = PaymentMethod::list(
            &self.client,
            &ListPaymentMethods {
                customer: Some(customer_id),
                type_: Some(PaymentMethodTypeFilter::Card),
                ..Default::default()
            },
        )
        .await?;

        Ok(methods
            .data
            .into_iter()
            .map(|pm| {
                let id = pm.id.to_string();
                let card = pm.card;
                PaymentMethodSummary {
                    is_default: default_id.as_deref() == Some(id.as_str()),
                    brand: card.as_ref().map(|c| c.brand.to_string()),
                    last4: card.as_ref().map(|c| c.last4.to_string()),
                    exp_month: card.as_ref().map(|c| c.exp_month),
                    exp_year: card.as_ref().map(|c| c.exp_year),
                    id,
                }
            })
            .collect())
    }

    async fn list_billing_history(
        &self,
        customer_id: &str,
        limit: u32,
    ) -> BillingResult<Vec<BillingHistoryEntry>> {
        let customer_id = Self::parse_customer_id(customer_id)?;

        let invoices = stripe::Invoice::list(
            &self.client,
            &ListInvoices {
                customer: Some(customer_id),
                limit: Some(limit as u64),
                ..Default::default()
            },
        )
        .await?;

        let entries = invoices
            .data
            .into_iter()
            .map(|inv| {
                let status = match inv.status {
                    Some(stripe::InvoiceStatus::Draft) => "draft",
                    Some(stripe::InvoiceStatus::Open) => "open",
                    Some(stripe::InvoiceStatus::Paid) => "paid",
                    Some(stripe::InvoiceStatus::Void) => "void",
                    Some(stripe::InvoiceStatus::Uncollectible) => "uncollectible",
                    None => "unknown",
                };

                BillingHistoryEntry {
                    occurred_at: OffsetDateTime::from_unix_timestamp(inv.created.unwrap_or(0))
                        .unwrap_or_else(|_| OffsetDateTime::now_utc()),
                    description: inv
                        .description
                        .clone()
                        .unwrap_or_else(|| "Subscription payment".to_string()),
                    amount_cents: inv.amount_paid.unwrap_or(0),
                    currency: inv
                        .currency
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "usd".to_string()),
                    status: status.to_string(),
                    reference: Some(inv.id.to_string()),
                }
            })
            .collect();

        Ok(entries)
    }

    fn decode_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> BillingResult<GatewayNotification> {
        let signature = signature.ok_or_else(|| {
            BillingError::Validation("Missing Stripe-Signature header".to_string())
        })?;

        verify_signature(
            payload,
            signature,
            &self.config.webhook_secret,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;

        let event: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| BillingError::Validation(format!("Invalid webhook JSON: {}", e)))?;

        let raw_type = event["type"]
            .as_str()
            .ok_or_else(|| {
                BillingError::Validation("Webhook event missing 'type' field".to_string())
            })?
            .to_string();
        let event_id = event["id"].as_str().map(String::from);
        let object = &event["data"]["object"];
        let data = self.extract_notification_data(&raw_type, object);

        Ok(GatewayNotification {
            gateway: GatewayKind::Stripe,
            event_id,
            raw_type,
            data,
            payload: event,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_abc".to_string(),
            webhook_secret: "whsec_test_secret".to_string(),
            price_ids: PriceIds {
                plus: "price_plus_monthly".to_string(),
                premium: "price_premium_monthly".to_string(),
                plus_annual: Some("price_plus_annual".to_string()),
                premium_annual: None,
            },
            app_base_url: "http://localhost:3000".to_string(),
        }
    }

    fn sign(payload: &[u8], secret: &str, timestamp: i64) -> String {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key");
        mac.update(format!("{}.", timestamp).as_bytes());
        mac.update(payload);
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_price_tier_mapping_is_bidirectional() {
        let config = test_config();
        assert_eq!(
            config.price_id_for_tier(SubscriptionTier::Plus, false),
            Some("price_plus_monthly")
        );
        assert_eq!(
            config.tier_for_price_id("price_premium_monthly"),
            Some(SubscriptionTier::Premium)
        );
        assert_eq!(
            config.tier_for_price_id("price_plus_annual"),
            Some(SubscriptionTier::Plus)
        );
        assert_eq!(config.tier_for_price_id("price_unknown"), None);
        assert_eq!(config.price_id_for_tier(SubscriptionTier::Free, false), None);
        // Premium annual not configured
        assert_eq!(config.price_id_for_tier(SubscriptionTier::Premium, true), None);
    }

    #[test]
    fn test_verify_signature_accepts_valid_header() {
        let payload = br#"{"id":"evt_1"}"#;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let header = sign(payload, "whsec_test_secret", now);

        assert!(verify_signature(payload, &header, "whsec_test_secret", now).is_ok());
    }

    #[test]
    fn test_verify_signature_rejects_wrong_secret() {
        let payload = br#"{"id":"evt_1"}"#;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let header = sign(payload, "whsec_other", now);

        assert!(verify_signature(payload, &header, "whsec_test_secret", now).is_err());
    }

    #[test]
    fn test_verify_signature_rejects_stale_timestamp() {
        let payload = br#"{"id":"evt_1"}"#;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let stale = now - SIGNATURE_TOLERANCE_SECS - 1;
        let header = sign(payload, "whsec_test_secret", stale);

        assert!(verify_signature(payload, &header, "whsec_test_secret", now).is_err());
    }

    #[test]
    fn test_verify_signature_rejects_garbage_header() {
        let payload = br#"{"id":"evt_1"}"#;
        let now = OffsetDateTime::now_utc().unix_timestamp();

        assert!(verify_signature(payload, "not-a-header", "whsec_test_secret", now).is_err());
        assert!(verify_signature(payload, "t=,v1=", "whsec_test_secret", now).is_err());
    }

    #[test]
    fn test_decode_webhook_subscription_updated() {
        let gateway = StripeGateway::new(test_config());
        let body = serde_json::json!({
            "id": "evt_123",
            "type": "customer.subscription.updated",
            "data": {
                "object": {
                    "id": "sub_123",
                    "cancel_at_period_end": true,
                    "current_period_end": 1_900_000_000i64,
                    "items": {
                        "data": [{"price": {"id": "price_premium_monthly"}}]
                    }
                }
            }
        });
        let payload = serde_json::to_vec(&body).expect("serializable");
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let header = sign(&payload, "whsec_test_secret", now);

        let notification = gateway
            .decode_webhook(&payload, Some(&header))
            .expect("valid webhook");

        assert_eq!(notification.gateway, GatewayKind::Stripe);
        assert_eq!(notification.event_id.as_deref(), Some("evt_123"));
        assert_eq!(notification.raw_type, "customer.subscription.updated");
        assert_eq!(notification.data.correlation_id.as_deref(), Some("sub_123"));
        assert_eq!(notification.data.cancel_at_period_end, Some(true));
        assert_eq!(notification.data.auto_renew, Some(false));
        assert_eq!(notification.data.tier, Some(SubscriptionTier::Premium));
        assert!(notification.data.expires_at.is_some());
    }

    #[test]
    fn test_decode_webhook_invoice_paid() {
        let gateway = StripeGateway::new(test_config());
        let body = serde_json::json!({
            "id": "evt_inv",
            "type": "invoice.paid",
            "data": {
                "object": {
                    "id": "in_123",
                    "subscription": "sub_123",
                    "amount_paid": 999,
                    "currency": "usd",
                    "lines": {
                        "data": [{
                            "period": {"end": 1_900_000_000i64},
                            "price": {"id": "price_plus_monthly"}
                        }]
                    }
                }
            }
        });
        let payload = serde_json::to_vec(&body).expect("serializable");
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let header = sign(&payload, "whsec_test_secret", now);

        let notification = gateway
            .decode_webhook(&payload, Some(&header))
            .expect("valid webhook");

        assert_eq!(notification.data.correlation_id.as_deref(), Some("sub_123"));
        assert_eq!(notification.data.transaction_id.as_deref(), Some("in_123"));
        assert_eq!(notification.data.amount_cents, Some(999));
        assert_eq!(notification.data.tier, Some(SubscriptionTier::Plus));
    }

    #[test]
    fn test_decode_webhook_rejects_missing_signature() {
        let gateway = StripeGateway::new(test_config());
        let result = gateway.decode_webhook(br#"{"type":"x"}"#, None);
        assert!(matches!(result, Err(BillingError::Validation(_))));
    }

    #[test]
    fn test_decode_webhook_rejects_tampered_payload() {
        let gateway = StripeGateway::new(test_config());
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let header = sign(br#"{"type":"a"}"#, "whsec_test_secret", now);

        let result = gateway.decode_webhook(br#"{"type":"b"}"#, Some(&header));
        assert!(matches!(result, Err(BillingError::Validation(_))));
    }
}
