//! App Store gateway adapter
//!
//! IAP-rail implementation of [`PaymentGateway`]. Receipts are verified
//! against Apple's `verifyReceipt` endpoint with the production-first,
//! sandbox-on-21007 retry Apple requires. Server notifications are the
//! legacy JSON format authenticated by the shared secret in the body.
//!
//! Apple owns the billing relationship on this rail, so card-style
//! operations (checkout, portal, payment methods) are rejected as
//! unsupported.

use async_trait::async_trait;
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use lovebird_shared::types::{GatewayKind, SubscriptionTier};

use crate::catalog;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    unsupported, BillingHistoryEntry, CheckoutSessionInfo, GatewayNotification,
    GatewaySubscription, NotificationData, PaymentGateway, PaymentMethodSummary,
    PortalSessionInfo, ReceiptVerification,
};

const PRODUCTION_VERIFY_URL: &str = "https://buy.itunes.apple.com/verifyReceipt";
const SANDBOX_VERIFY_URL: &str = "https://sandbox.itunes.apple.com/verifyReceipt";

const VERIFY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// Receipt was generated in the sandbox environment
const STATUS_SANDBOX_RECEIPT: i64 = 21007;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the App Store gateway
#[derive(Debug, Clone)]
pub struct AppStoreConfig {
    /// App-specific shared secret from App Store Connect
    pub shared_secret: String,
}

impl AppStoreConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            shared_secret: std::env::var("APPLE_SHARED_SECRET")
                .map_err(|_| BillingError::Config("APPLE_SHARED_SECRET not set".to_string()))?,
        })
    }
}

// =============================================================================
// verifyReceipt response shapes
// =============================================================================

#[derive(Debug, Deserialize)]
struct VerifyReceiptResponse {
    status: i64,
    #[serde(default)]
    latest_receipt_info: Option<Vec<ReceiptInfo>>,
    #[serde(default)]
    receipt: Option<ReceiptBody>,
}

#[derive(Debug, Deserialize)]
struct ReceiptBody {
    #[serde(default)]
    in_app: Option<Vec<ReceiptInfo>>,
}

/// One transaction entry inside a verified receipt
///
/// Apple sends timestamps as millisecond strings and booleans as
/// "true"/"false" strings.
#[derive(Debug, Clone, Deserialize)]
struct ReceiptInfo {
    transaction_id: String,
    #[serde(default)]
    original_transaction_id: Option<String>,
    product_id: String,
    #[serde(default)]
    purchase_date_ms: Option<String>,
    #[serde(default)]
    expires_date_ms: Option<String>,
    #[serde(default)]
    is_trial_period: Option<String>,
    #[serde(default)]
    is_in_intro_offer_period: Option<String>,
}

fn parse_ms_string(value: &str) -> Option<OffsetDateTime> {
    let ms: i64 = value.parse().ok()?;
    OffsetDateTime::from_unix_timestamp(ms / 1000).ok()
}

/// Millisecond timestamps arrive as strings in receipts and as either
/// strings or numbers in notification payloads
fn parse_ms_value(value: &serde_json::Value) -> Option<OffsetDateTime> {
    match value {
        serde_json::Value::String(s) => parse_ms_string(s),
        serde_json::Value::Number(n) => {
            let ms = n.as_i64()?;
            OffsetDateTime::from_unix_timestamp(ms / 1000).ok()
        }
        _ => None,
    }
}

fn parse_flag_value(value: &serde_json::Value) -> Option<bool> {
    match value {
        serde_json::Value::Bool(b) => Some(*b),
        serde_json::Value::String(s) => match s.as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        serde_json::Value::Number(n) => n.as_i64().map(|v| v != 0),
        _ => None,
    }
}

/// Pick the most recent transaction: greatest expiry, then greatest
/// purchase time (consumables carry no expiry)
fn choose_latest(entries: &[ReceiptInfo]) -> Option<&ReceiptInfo> {
    entries.iter().max_by_key(|entry| {
        let expires = entry
            .expires_date_ms
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .unwrap_or(0);
        let purchased = entry
            .purchase_date_ms
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .unwrap_or(0);
        (expires, purchased)
    })
}

/// Store statuses that reject the receipt itself, as opposed to signalling
/// an infrastructure or configuration problem
fn rejection_reason(status: i64) -> Option<&'static str> {
    match status {
        21000 => Some("App Store could not read the receipt"),
        21002 => Some("Receipt data was malformed"),
        21003 => Some("Receipt could not be authenticated"),
        21006 => Some("Receipt is valid but the subscription has expired"),
        21008 => Some("Production receipt was sent to the sandbox environment"),
        21010 => Some("App Store account not found"),
        _ => None,
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// App Store implementation of [`PaymentGateway`]
#[derive(Clone)]
pub struct AppStoreGateway {
    client: reqwest::Client,
    config: AppStoreConfig,
}

impl AppStoreGateway {
    pub fn new(config: AppStoreConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(AppStoreConfig::from_env()?))
    }

    async fn post_verify(
        &self,
        url: &str,
        receipt_data: &str,
    ) -> BillingResult<VerifyReceiptResponse> {
        let body = serde_json::json!({
            "receipt-data": receipt_data,
            "password": self.config.shared_secret,
            "exclude-old-transactions": true,
        });

        let response = self
            .client
            .post(url)
            .timeout(VERIFY_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BillingError::Gateway(format!(
                "App Store verification returned HTTP {}",
                response.status()
            )));
        }

        Ok(response.json::<VerifyReceiptResponse>().await?)
    }

    fn build_verification(
        response: VerifyReceiptResponse,
        sandbox: bool,
    ) -> BillingResult<ReceiptVerification> {
        // Auto-renewable entries live in latest_receipt_info; consumables
        // only appear under receipt.in_app
        let entries = response
            .latest_receipt_info
            .filter(|list| !list.is_empty())
            .or(response.receipt.and_then(|r| r.in_app))
            .unwrap_or_default();

        let Some(entry) = choose_latest(&entries) else {
            return Ok(ReceiptVerification::invalid("Receipt contains no transactions"));
        };

        Ok(ReceiptVerification {
            valid: true,
            reason: None,
            external_transaction_id: entry.transaction_id.clone(),
            external_original_transaction_id: entry.original_transaction_id.clone(),
            product_id: entry.product_id.clone(),
            purchased_at: entry
                .purchase_date_ms
                .as_deref()
                .and_then(parse_ms_string)
                .unwrap_or_else(OffsetDateTime::now_utc),
            expires_at: entry.expires_date_ms.as_deref().and_then(parse_ms_string),
            is_trial: entry.is_trial_period.as_deref() == Some("true"),
            is_intro_offer: entry.is_in_intro_offer_period.as_deref() == Some("true"),
            sandbox,
        })
    }
}

#[async_trait]
impl PaymentGateway for AppStoreGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Apple
    }

    async fn verify_receipt(&self, receipt_data: &str) -> BillingResult<ReceiptVerification> {
        if receipt_data.trim().is_empty() {
            return Err(BillingError::Validation(
                "Receipt data must not be empty".to_string(),
            ));
        }

        let mut response = self.post_verify(PRODUCTION_VERIFY_URL, receipt_data).await?;
        let mut sandbox = false;

        // Apple's documented flow: always try production first, retry
        // against sandbox when it reports a sandbox receipt
        if response.status == STATUS_SANDBOX_RECEIPT {
            tracing::debug!("Receipt is from sandbox, retrying against sandbox endpoint");
            response = self.post_verify(SANDBOX_VERIFY_URL, receipt_data).await?;
            sandbox = true;
        }

        match response.status {
            0 => {}
            21004 => {
                return Err(BillingError::Config(
                    "App Store shared secret does not match".to_string(),
                ));
            }
            21005 => {
                return Err(BillingError::Gateway(
                    "App Store server is temporarily unavailable".to_string(),
                ));
            }
            status => {
                if let Some(reason) = rejection_reason(status) {
                    tracing::warn!(status = status, reason = %reason, "App Store rejected receipt");
                    return Ok(ReceiptVerification::invalid(reason));
                }
                return Err(BillingError::Gateway(format!(
                    "App Store receipt verification failed with status {}",
                    status
                )));
            }
        }

        let verification = Self::build_verification(response, sandbox)?;

        if verification.valid {
            tracing::info!(
                transaction_id = %verification.external_transaction_id,
                product_id = %verification.product_id,
                sandbox = verification.sandbox,
                "Verified App Store receipt"
            );
        }

        Ok(verification)
    }

    async fn create_customer(&self, _user_id: Uuid, _email: &str) -> BillingResult<String> {
        Err(unsupported(GatewayKind::Apple, "customer creation"))
    }

    async fn create_subscription(
        &self,
        _customer_id: &str,
        _tier: SubscriptionTier,
        _trial_days: Option<u32>,
    ) -> BillingResult<GatewaySubscription> {
        Err(unsupported(GatewayKind::Apple, "subscription creation"))
    }

    async fn update_subscription(
        &self,
        _gateway_subscription_id: &str,
        _new_tier: SubscriptionTier,
        _prorate: bool,
    ) -> BillingResult<GatewaySubscription> {
        // Plan changes on this rail happen in the App Store UI and arrive
        // as server notifications
        Err(unsupported(GatewayKind::Apple, "subscription update"))
    }

    async fn cancel_subscription(
        &self,
        _gateway_subscription_id: &str,
        _at_period_end: bool,
    ) -> BillingResult<()> {
        Err(unsupported(GatewayKind::Apple, "subscription cancellation"))
    }

    async fn create_checkout_session(
        &self,
        _user_id: Uuid,
        _email: &str,
        _tier: SubscriptionTier,
        _annual: bool,
    ) -> BillingResult<CheckoutSessionInfo> {
        Err(unsupported(GatewayKind::Apple, "checkout sessions"))
    }

    async fn create_portal_session(&self, _customer_id: &str) -> BillingResult<PortalSessionInfo> {
        Err(unsupported(GatewayKind::Apple, "billing portal sessions"))
    }

    async fn list_payment_methods(
        &self,
        _customer_id: &str,
    ) -> BillingResult<Vec<PaymentMethodSummary>> {
        Err(unsupported(GatewayKind::Apple, "payment method listing"))
    }

    async fn list_billing_history(
        &self,
        _customer_id: &str,
        _limit: u32,
    ) -> BillingResult<Vec<BillingHistoryEntry>> {
        Err(unsupported(GatewayKind::Apple, "billing history"))
    }

    fn decode_webhook(
        &self,
        payload: &[u8],
        _signature: Option<&str>,
    ) -> BillingResult<GatewayNotification> {
        let body: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| BillingError::Validation(format!("Invalid notification JSON: {}", e)))?;

        // Legacy server notifications authenticate via the shared secret
        // echoed in the body
        let password = body["password"].as_str().unwrap_or_default();
        if password != self.config.shared_secret {
            return Err(BillingError::Validation(
                "App Store notification shared secret mismatch".to_string(),
            ));
        }

        let raw_type = body["notification_type"]
            .as_str()
            .ok_or_else(|| {
                BillingError::Validation("Notification missing 'notification_type'".to_string())
            })?
            .to_string();

        // unified_receipt.latest_receipt_info is sorted newest-first
        let latest = &body["unified_receipt"]["latest_receipt_info"][0];

        let product_id = latest["product_id"]
            .as_str()
            .or_else(|| body["auto_renew_product_id"].as_str())
            .map(String::from);
        let auto_renew = parse_flag_value(&body["auto_renew_status"]);

        let data = NotificationData {
            correlation_id: latest["original_transaction_id"]
                .as_str()
                .or_else(|| body["original_transaction_id"].as_str())
                .map(String::from),
            transaction_id: latest["transaction_id"].as_str().map(String::from),
            expires_at: parse_ms_value(&latest["expires_date_ms"]),
            auto_renew,
            cancel_at_period_end: auto_renew.map(|enabled| !enabled),
            tier: product_id.as_deref().and_then(catalog::tier_for_product_id),
            product_id,
            ..Default::default()
        };

        Ok(GatewayNotification {
            gateway: GatewayKind::Apple,
            // Legacy notifications carry no stable event id; replay safety
            // comes from the transaction ledger instead
            event_id: None,
            raw_type,
            data,
            payload: body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> AppStoreGateway {
        AppStoreGateway::new(AppStoreConfig {
            shared_secret: "shared-secret-123".to_string(),
        })
    }

    fn entry(txn: &str, expires_ms: Option<&str>, purchase_ms: &str) -> ReceiptInfo {
        ReceiptInfo {
            transaction_id: txn.to_string(),
            original_transaction_id: Some("original-1".to_string()),
            product_id: "com.lovebird.plus.monthly".to_string(),
            purchase_date_ms: Some(purchase_ms.to_string()),
            expires_date_ms: expires_ms.map(String::from),
            is_trial_period: Some("false".to_string()),
            is_in_intro_offer_period: None,
        }
    }

    #[test]
    fn test_choose_latest_prefers_greatest_expiry() {
        let entries = vec![
            entry("txn-old", Some("1700000000000"), "1690000000000"),
            entry("txn-new", Some("1800000000000"), "1690000000000"),
        ];
        let chosen = choose_latest(&entries).expect("non-empty");
        assert_eq!(chosen.transaction_id, "txn-new");
    }

    #[test]
    fn test_choose_latest_falls_back_to_purchase_time() {
        // Consumables have no expiry
        let entries = vec![
            entry("boost-old", None, "1690000000000"),
            entry("boost-new", None, "1695000000000"),
        ];
        let chosen = choose_latest(&entries).expect("non-empty");
        assert_eq!(chosen.transaction_id, "boost-new");
    }

    #[test]
    fn test_parse_ms_handles_strings_and_numbers() {
        let from_string = parse_ms_value(&serde_json::json!("1700000000000")).expect("parses");
        let from_number = parse_ms_value(&serde_json::json!(1_700_000_000_000i64)).expect("parses");
        assert_eq!(from_string, from_number);
        assert_eq!(from_string.unix_timestamp(), 1_700_000_000);

        assert!(parse_ms_value(&serde_json::json!("not-a-number")).is_none());
        assert!(parse_ms_value(&serde_json::Value::Null).is_none());
    }

    #[test]
    fn test_parse_flag_handles_apple_string_booleans() {
        assert_eq!(parse_flag_value(&serde_json::json!("true")), Some(true));
        assert_eq!(parse_flag_value(&serde_json::json!("0")), Some(false));
        assert_eq!(parse_flag_value(&serde_json::json!(true)), Some(true));
        assert_eq!(parse_flag_value(&serde_json::json!("maybe")), None);
    }

    #[test]
    fn test_rejection_reason_covers_receipt_statuses_only() {
        // Receipt problems become valid=false, not errors
        assert!(rejection_reason(21002).is_some());
        assert!(rejection_reason(21003).is_some());
        assert!(rejection_reason(21010).is_some());
        // Infrastructure and config problems stay errors
        assert!(rejection_reason(21004).is_none());
        assert!(rejection_reason(21005).is_none());
        assert!(rejection_reason(99999).is_none());
    }

    #[test]
    fn test_build_verification_prefers_latest_receipt_info() {
        let response = VerifyReceiptResponse {
            status: 0,
            latest_receipt_info: Some(vec![entry(
                "txn-sub",
                Some("1800000000000"),
                "1700000000000",
            )]),
            receipt: Some(ReceiptBody {
                in_app: Some(vec![entry("txn-consumable", None, "1600000000000")]),
            }),
        };

        let verification =
            AppStoreGateway::build_verification(response, false).expect("parseable receipt");
        assert!(verification.valid);
        assert_eq!(verification.reason, None);
        assert_eq!(verification.external_transaction_id, "txn-sub");
        assert_eq!(verification.product_id, "com.lovebird.plus.monthly");
        assert!(verification.expires_at.is_some());
        assert!(!verification.is_trial);
        assert!(!verification.sandbox);
    }

    #[test]
    fn test_build_verification_rejects_empty_receipt() {
        let response = VerifyReceiptResponse {
            status: 0,
            latest_receipt_info: None,
            receipt: None,
        };

        let verification =
            AppStoreGateway::build_verification(response, false).expect("parseable receipt");
        assert!(!verification.valid);
        assert!(verification.reason.is_some());
    }

    #[test]
    fn test_decode_webhook_did_renew() {
        let payload = serde_json::json!({
            "notification_type": "DID_RENEW",
            "password": "shared-secret-123",
            "auto_renew_status": "true",
            "auto_renew_product_id": "com.lovebird.premium.monthly",
            "unified_receipt": {
                "latest_receipt_info": [{
                    "transaction_id": "txn-42",
                    "original_transaction_id": "original-7",
                    "product_id": "com.lovebird.premium.monthly",
                    "expires_date_ms": "1800000000000",
                    "purchase_date_ms": "1700000000000"
                }]
            }
        });

        let notification = gateway()
            .decode_webhook(&serde_json::to_vec(&payload).expect("serializable"), None)
            .expect("valid notification");

        assert_eq!(notification.gateway, GatewayKind::Apple);
        assert_eq!(notification.event_id, None);
        assert_eq!(notification.raw_type, "DID_RENEW");
        assert_eq!(
            notification.data.correlation_id.as_deref(),
            Some("original-7")
        );
        assert_eq!(notification.data.transaction_id.as_deref(), Some("txn-42"));
        assert_eq!(notification.data.auto_renew, Some(true));
        assert_eq!(notification.data.cancel_at_period_end, Some(false));
        assert_eq!(notification.data.tier, Some(SubscriptionTier::Premium));
        assert!(notification.data.expires_at.is_some());
    }

    #[test]
    fn test_decode_webhook_rejects_bad_shared_secret() {
        let payload = serde_json::json!({
            "notification_type": "DID_RENEW",
            "password": "wrong-secret"
        });

        let result =
            gateway().decode_webhook(&serde_json::to_vec(&payload).expect("serializable"), None);
        assert!(matches!(result, Err(BillingError::Validation(_))));
    }

    #[test]
    fn test_decode_webhook_requires_notification_type() {
        let payload = serde_json::json!({ "password": "shared-secret-123" });

        let result =
            gateway().decode_webhook(&serde_json::to_vec(&payload).expect("serializable"), None);
        assert!(matches!(result, Err(BillingError::Validation(_))));
    }
}
