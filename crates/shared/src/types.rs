//! Common types used across the Lovebird billing engine

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Subscription tier, ordered from least to most capable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Plus,
    Premium,
}

impl Default for SubscriptionTier {
    fn default() -> Self {
        Self::Free
    }
}

impl SubscriptionTier {
    /// Ordinal rank of this tier (higher = more capable)
    /// Free: 0, Plus: 1, Premium: 2
    pub fn level(&self) -> u8 {
        match self {
            Self::Free => 0,
            Self::Plus => 1,
            Self::Premium => 2,
        }
    }

    /// Whether this tier is a paid plan
    pub fn is_paid(&self) -> bool {
        !matches!(self, Self::Free)
    }

    /// All tiers in ascending order
    pub fn all() -> [Self; 3] {
        [Self::Free, Self::Plus, Self::Premium]
    }

    /// Parse a tier from string (case insensitive), falling back to Free.
    /// Entitlement resolution must never fail on a bad stored value, so
    /// unknown tiers degrade to the free matrix rather than erroring.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "free" => Self::Free,
            "plus" => Self::Plus,
            "premium" => Self::Premium,
            _ => Self::Free,
        }
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Plus => write!(f, "plus"),
            Self::Premium => write!(f, "premium"),
        }
    }
}

impl std::str::FromStr for SubscriptionTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "plus" => Ok(Self::Plus),
            "premium" => Ok(Self::Premium),
            _ => Err(format!("Invalid subscription tier: {}", s)),
        }
    }
}

/// Subscription lifecycle status
///
/// Transitions: Pending -> Active -> {Cancelled, Expired, BillingRetry};
/// BillingRetry -> Active on a successful retry, or -> Expired/Cancelled.
/// Cancelled and Expired are terminal for the billing period; a fresh
/// Pending row may follow a new purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Cancelled,
    Expired,
    BillingRetry,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl SubscriptionStatus {
    /// Whether a cancel request is valid from this status
    pub fn can_cancel(&self) -> bool {
        matches!(self, Self::Active | Self::BillingRetry)
    }

    /// Whether this status is terminal for the current billing period
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Expired)
    }

    /// Whether paid entitlements still apply. BillingRetry keeps access
    /// while the already-paid period runs out.
    pub fn is_entitled(&self) -> bool {
        matches!(self, Self::Active | Self::BillingRetry)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Expired => write!(f, "expired"),
            Self::BillingRetry => write!(f, "billing_retry"),
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            "billing_retry" => Ok(Self::BillingRetry),
            _ => Err(format!("Invalid subscription status: {}", s)),
        }
    }
}

/// What a ledger transaction paid for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Subscription,
    Consumable,
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subscription => write!(f, "subscription"),
            Self::Consumable => write!(f, "consumable"),
        }
    }
}

impl std::str::FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "subscription" => Ok(Self::Subscription),
            "consumable" => Ok(Self::Consumable),
            _ => Err(format!("Invalid transaction kind: {}", s)),
        }
    }
}

/// Ledger transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Refunded,
    Failed,
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Completed => write!(f, "completed"),
            Self::Refunded => write!(f, "refunded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "refunded" => Ok(Self::Refunded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid transaction status: {}", s)),
        }
    }
}

/// Processing status of an inbound webhook audit row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Processing,
    Processed,
    Failed,
}

impl std::fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Processing => write!(f, "processing"),
            Self::Processed => write!(f, "processed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Which payment gateway an event or correlation id belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    Stripe,
    Apple,
}

impl std::fmt::Display for GatewayKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stripe => write!(f, "stripe"),
            Self::Apple => write!(f, "apple"),
        }
    }
}

impl std::str::FromStr for GatewayKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stripe" => Ok(Self::Stripe),
            "apple" => Ok(Self::Apple),
            _ => Err(format!("Invalid gateway: {}", s)),
        }
    }
}

// =============================================================================
// Database Models
// =============================================================================

/// Subscription model, one row per user
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tier: String,
    pub status: String,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub auto_renew: bool,
    pub is_trial: bool,
    pub is_intro_offer: bool,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub apple_product_id: Option<String>,
    pub apple_transaction_id: Option<String>,
    pub apple_original_transaction_id: Option<String>,
    pub cancelled_at: Option<OffsetDateTime>,
    pub last_renewed_at: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// Stored tier parsed fail-safe (unknown values degrade to Free)
    pub fn tier_parsed(&self) -> SubscriptionTier {
        SubscriptionTier::from_str_lossy(&self.tier)
    }

    /// Stored status parsed; unparseable values read as Expired so a
    /// corrupted row never grants access.
    pub fn status_parsed(&self) -> SubscriptionStatus {
        self.status.parse().unwrap_or(SubscriptionStatus::Expired)
    }

    /// Whether the paid period has lapsed relative to `now`
    pub fn is_lapsed(&self, now: OffsetDateTime) -> bool {
        self.current_period_end < now
    }
}

/// Ledger transaction model, one row per gateway purchase event
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub external_transaction_id: String,
    pub external_original_transaction_id: Option<String>,
    pub product_id: String,
    pub kind: String,
    pub status: Option<String>,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub processed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl Transaction {
    pub fn kind_parsed(&self) -> Option<TransactionKind> {
        self.kind.parse().ok()
    }

    pub fn is_refunded(&self) -> bool {
        self.status.as_deref() == Some("refunded")
    }
}

/// Per-user consumable balances and daily usage counters
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EntitlementSnapshot {
    pub user_id: Uuid,
    pub boosts_remaining: i32,
    pub super_likes_remaining: i32,
    pub daily_likes_used: i32,
    pub daily_super_likes_used: i32,
    pub daily_messages_used: i32,
    pub last_reset_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Inbound webhook audit row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub gateway: String,
    pub event_id: Option<String>,
    pub notification_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub error: Option<String>,
    pub created_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // SubscriptionTier Tests
    // =========================================================================

    #[test]
    fn test_subscription_tier_default() {
        assert_eq!(SubscriptionTier::default(), SubscriptionTier::Free);
    }

    #[test]
    fn test_subscription_tier_levels_are_ordered() {
        assert_eq!(SubscriptionTier::Free.level(), 0);
        assert_eq!(SubscriptionTier::Plus.level(), 1);
        assert_eq!(SubscriptionTier::Premium.level(), 2);

        let tiers = SubscriptionTier::all();
        for pair in tiers.windows(2) {
            assert!(pair[0].level() < pair[1].level());
        }
    }

    #[test]
    fn test_subscription_tier_is_paid() {
        assert!(!SubscriptionTier::Free.is_paid());
        assert!(SubscriptionTier::Plus.is_paid());
        assert!(SubscriptionTier::Premium.is_paid());
    }

    #[test]
    fn test_subscription_tier_display() {
        assert_eq!(format!("{}", SubscriptionTier::Free), "free");
        assert_eq!(format!("{}", SubscriptionTier::Plus), "plus");
        assert_eq!(format!("{}", SubscriptionTier::Premium), "premium");
    }

    #[test]
    fn test_subscription_tier_from_str() {
        assert_eq!(
            "free".parse::<SubscriptionTier>().unwrap(),
            SubscriptionTier::Free
        );
        assert_eq!(
            "PLUS".parse::<SubscriptionTier>().unwrap(),
            SubscriptionTier::Plus
        );
        assert_eq!(
            "Premium".parse::<SubscriptionTier>().unwrap(),
            SubscriptionTier::Premium
        );
        assert!("gold".parse::<SubscriptionTier>().is_err());
    }

    #[test]
    fn test_subscription_tier_from_str_lossy() {
        assert_eq!(
            SubscriptionTier::from_str_lossy("premium"),
            SubscriptionTier::Premium
        );
        assert_eq!(
            SubscriptionTier::from_str_lossy("PLUS"),
            SubscriptionTier::Plus
        );
        // Unknown values degrade to Free, never error
        assert_eq!(
            SubscriptionTier::from_str_lossy("platinum"),
            SubscriptionTier::Free
        );
        assert_eq!(SubscriptionTier::from_str_lossy(""), SubscriptionTier::Free);
    }

    // =========================================================================
    // SubscriptionStatus Tests
    // =========================================================================

    #[test]
    fn test_subscription_status_default() {
        assert_eq!(SubscriptionStatus::default(), SubscriptionStatus::Pending);
    }

    #[test]
    fn test_subscription_status_can_cancel() {
        assert!(SubscriptionStatus::Active.can_cancel());
        assert!(SubscriptionStatus::BillingRetry.can_cancel());
        assert!(!SubscriptionStatus::Pending.can_cancel());
        assert!(!SubscriptionStatus::Cancelled.can_cancel());
        assert!(!SubscriptionStatus::Expired.can_cancel());
    }

    #[test]
    fn test_subscription_status_terminal() {
        assert!(SubscriptionStatus::Cancelled.is_terminal());
        assert!(SubscriptionStatus::Expired.is_terminal());
        assert!(!SubscriptionStatus::Active.is_terminal());
        assert!(!SubscriptionStatus::BillingRetry.is_terminal());
        assert!(!SubscriptionStatus::Pending.is_terminal());
    }

    #[test]
    fn test_subscription_status_entitled() {
        assert!(SubscriptionStatus::Active.is_entitled());
        assert!(SubscriptionStatus::BillingRetry.is_entitled());
        assert!(!SubscriptionStatus::Pending.is_entitled());
        assert!(!SubscriptionStatus::Cancelled.is_entitled());
        assert!(!SubscriptionStatus::Expired.is_entitled());
    }

    #[test]
    fn test_subscription_status_display_and_parse() {
        assert_eq!(format!("{}", SubscriptionStatus::Active), "active");
        assert_eq!(
            format!("{}", SubscriptionStatus::BillingRetry),
            "billing_retry"
        );
        assert_eq!(
            "billing_retry".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::BillingRetry
        );
        assert_eq!(
            "CANCELLED".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::Cancelled
        );
        assert!("paused".parse::<SubscriptionStatus>().is_err());
    }

    // =========================================================================
    // Transaction Enum Tests
    // =========================================================================

    #[test]
    fn test_transaction_kind_display_and_parse() {
        assert_eq!(format!("{}", TransactionKind::Subscription), "subscription");
        assert_eq!(format!("{}", TransactionKind::Consumable), "consumable");
        assert_eq!(
            "consumable".parse::<TransactionKind>().unwrap(),
            TransactionKind::Consumable
        );
        assert!("gift".parse::<TransactionKind>().is_err());
    }

    #[test]
    fn test_transaction_status_display_and_parse() {
        assert_eq!(format!("{}", TransactionStatus::Refunded), "refunded");
        assert_eq!(
            "completed".parse::<TransactionStatus>().unwrap(),
            TransactionStatus::Completed
        );
        assert!("reversed".parse::<TransactionStatus>().is_err());
    }

    // =========================================================================
    // GatewayKind Tests
    // =========================================================================

    #[test]
    fn test_gateway_kind_display_and_parse() {
        assert_eq!(format!("{}", GatewayKind::Stripe), "stripe");
        assert_eq!(format!("{}", GatewayKind::Apple), "apple");
        assert_eq!("apple".parse::<GatewayKind>().unwrap(), GatewayKind::Apple);
        assert!("google".parse::<GatewayKind>().is_err());
    }

    // =========================================================================
    // Model Helper Tests
    // =========================================================================

    fn sample_subscription(tier: &str, status: &str) -> Subscription {
        let now = OffsetDateTime::now_utc();
        Subscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            tier: tier.to_string(),
            status: status.to_string(),
            current_period_start: now,
            current_period_end: now + time::Duration::days(30),
            cancel_at_period_end: false,
            auto_renew: true,
            is_trial: false,
            is_intro_offer: false,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            apple_product_id: None,
            apple_transaction_id: None,
            apple_original_transaction_id: None,
            cancelled_at: None,
            last_renewed_at: None,
            trial_end: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_subscription_tier_parsed_fail_safe() {
        assert_eq!(
            sample_subscription("plus", "active").tier_parsed(),
            SubscriptionTier::Plus
        );
        assert_eq!(
            sample_subscription("corrupted", "active").tier_parsed(),
            SubscriptionTier::Free
        );
    }

    #[test]
    fn test_subscription_status_parsed_fail_safe() {
        assert_eq!(
            sample_subscription("plus", "billing_retry").status_parsed(),
            SubscriptionStatus::BillingRetry
        );
        // Corrupted status must never read as entitled
        assert_eq!(
            sample_subscription("plus", "???").status_parsed(),
            SubscriptionStatus::Expired
        );
    }

    #[test]
    fn test_subscription_is_lapsed() {
        let now = OffsetDateTime::now_utc();
        let mut sub = sample_subscription("plus", "active");
        assert!(!sub.is_lapsed(now));

        sub.current_period_end = now - time::Duration::hours(1);
        assert!(sub.is_lapsed(now));
    }

    #[test]
    fn test_transaction_is_refunded() {
        let txn = Transaction {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            external_transaction_id: "txn-1".to_string(),
            external_original_transaction_id: None,
            product_id: "lovebird.plus.monthly".to_string(),
            kind: "subscription".to_string(),
            status: Some("refunded".to_string()),
            amount_cents: Some(999),
            currency: Some("usd".to_string()),
            processed_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        assert!(txn.is_refunded());
        assert_eq!(txn.kind_parsed(), Some(TransactionKind::Subscription));
    }
}
