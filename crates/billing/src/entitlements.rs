//! Entitlement Resolution
//!
//! Maps a subscription tier to the full feature/quota matrix and provides a
//! unified read surface answering "what can this user do right now?".
//!
//! ## Design Principles
//!
//! 1. **Pure resolution**: `EntitlementMatrix::for_tier()` is total and deterministic
//! 2. **Fail-safe**: unknown tier values resolve to the Free matrix, never an error
//! 3. **Monotonic**: no capability shrinks as the tier goes up
//! 4. **Debuggable**: denied feature checks carry a human-readable upgrade reason

use lovebird_shared::types::{
    EntitlementSnapshot, Subscription, SubscriptionStatus, SubscriptionTier,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

// =============================================================================
// Graded capability enums
// =============================================================================

/// Video/audio call quality ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallQuality {
    Standard,
    High,
    Ultra,
}

impl CallQuality {
    pub fn level(&self) -> u8 {
        match self {
            Self::Standard => 0,
            Self::High => 1,
            Self::Ultra => 2,
        }
    }
}

/// Community area access level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommunityAccess {
    None,
    Read,
    Write,
    Vip,
}

impl CommunityAccess {
    pub fn level(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Read => 1,
            Self::Write => 2,
            Self::Vip => 3,
        }
    }
}

/// Queue priority for search ranking, message delivery, and support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityLevel {
    Normal,
    High,
    Ultra,
}

impl PriorityLevel {
    pub fn level(&self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::High => 1,
            Self::Ultra => 2,
        }
    }
}

// =============================================================================
// Entitlement matrix
// =============================================================================

/// Full feature/quota matrix for one tier
///
/// Numeric fields are capability ceilings; unlimited quotas use the type MAX
/// with the matching boolean flag set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementMatrix {
    // Calls
    pub audio_calls: bool,
    pub video_calls: bool,
    pub max_call_minutes: u32,
    pub max_call_quality: CallQuality,
    pub group_calls: bool,
    pub max_group_participants: u32,
    pub screen_sharing: bool,

    // Messaging
    pub daily_messages: u32,
    pub unlimited_messages: bool,
    pub voice_notes: bool,
    pub max_voice_note_seconds: u32,
    pub image_messages: bool,
    pub read_receipts: bool,

    // Discovery
    pub daily_likes: u32,
    pub daily_super_likes: u32,
    pub see_who_liked_you: bool,
    pub advanced_filters: bool,
    pub incognito_mode: bool,
    pub global_discovery: bool,
    pub undo_last_like: bool,

    // Profile
    pub max_photos: u32,
    pub monthly_boosts: u32,

    // Community
    pub community_access: CommunityAccess,

    // Priority
    pub search_priority: PriorityLevel,
    pub message_priority: PriorityLevel,
    pub support_priority: PriorityLevel,
}

impl EntitlementMatrix {
    /// Resolve the matrix for a tier. Total: every tier has a complete matrix
    /// and there is no error path.
    pub fn for_tier(tier: SubscriptionTier) -> Self {
        match tier {
            SubscriptionTier::Free => Self {
                audio_calls: true,
                video_calls: false,
                max_call_minutes: 10,
                max_call_quality: CallQuality::Standard,
                group_calls: false,
                max_group_participants: 0,
                screen_sharing: false,

                daily_messages: 20,
                unlimited_messages: false,
                voice_notes: false,
                max_voice_note_seconds: 0,
                image_messages: false,
                read_receipts: false,

                daily_likes: 15,
                daily_super_likes: 1,
                see_who_liked_you: false,
                advanced_filters: false,
                incognito_mode: false,
                global_discovery: false,
                undo_last_like: false,

                max_photos: 6,
                monthly_boosts: 0,

                community_access: CommunityAccess::Read,

                search_priority: PriorityLevel::Normal,
                message_priority: PriorityLevel::Normal,
                support_priority: PriorityLevel::Normal,
            },
            SubscriptionTier::Plus => Self {
                audio_calls: true,
                video_calls: true,
                max_call_minutes: 60,
                max_call_quality: CallQuality::High,
                group_calls: false,
                max_group_participants: 0,
                screen_sharing: false,

                daily_messages: 200,
                unlimited_messages: false,
                voice_notes: true,
                max_voice_note_seconds: 60,
                image_messages: true,
                read_receipts: true,

                daily_likes: 100,
                daily_super_likes: 5,
                see_who_liked_you: true,
                advanced_filters: true,
                incognito_mode: false,
                global_discovery: false,
                undo_last_like: true,

                max_photos: 12,
                monthly_boosts: 1,

                community_access: CommunityAccess::Write,

                search_priority: PriorityLevel::High,
                message_priority: PriorityLevel::High,
                support_priority: PriorityLevel::Normal,
            },
            SubscriptionTier::Premium => Self {
                audio_calls: true,
                video_calls: true,
                max_call_minutes: 240,
                max_call_quality: CallQuality::Ultra,
                group_calls: true,
                max_group_participants: 8,
                screen_sharing: true,

                daily_messages: u32::MAX,
                unlimited_messages: true,
                voice_notes: true,
                max_voice_note_seconds: 300,
                image_messages: true,
                read_receipts: true,

                daily_likes: u32::MAX,
                daily_super_likes: 10,
                see_who_liked_you: true,
                advanced_filters: true,
                incognito_mode: true,
                global_discovery: true,
                undo_last_like: true,

                max_photos: 30,
                monthly_boosts: 4,

                community_access: CommunityAccess::Vip,

                search_priority: PriorityLevel::Ultra,
                message_priority: PriorityLevel::Ultra,
                support_priority: PriorityLevel::Ultra,
            },
        }
    }

    /// Resolve from a raw stored tier string; unknown values degrade to Free
    pub fn resolve(raw_tier: &str) -> Self {
        Self::for_tier(SubscriptionTier::from_str_lossy(raw_tier))
    }

    /// Look up a boolean-valued field by key. Returns None for numeric/enum
    /// fields and unknown keys — those are not deniable by `check_access`.
    pub fn boolean_field(&self, key: &str) -> Option<bool> {
        match key {
            "audio_calls" => Some(self.audio_calls),
            "video_calls" => Some(self.video_calls),
            "group_calls" => Some(self.group_calls),
            "screen_sharing" => Some(self.screen_sharing),
            "unlimited_messages" => Some(self.unlimited_messages),
            "voice_notes" => Some(self.voice_notes),
            "image_messages" => Some(self.image_messages),
            "read_receipts" => Some(self.read_receipts),
            "see_who_liked_you" => Some(self.see_who_liked_you),
            "advanced_filters" => Some(self.advanced_filters),
            "incognito_mode" => Some(self.incognito_mode),
            "global_discovery" => Some(self.global_discovery),
            "undo_last_like" => Some(self.undo_last_like),
            _ => None,
        }
    }

    /// Flatten every field into an ordered (name, magnitude) list so tests can
    /// compare whole matrices across tiers: booleans as 0/1, numerics as-is,
    /// graded enums by level.
    pub fn comparable_fields(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("audio_calls", self.audio_calls as u64),
            ("video_calls", self.video_calls as u64),
            ("max_call_minutes", self.max_call_minutes as u64),
            ("max_call_quality", self.max_call_quality.level() as u64),
            ("group_calls", self.group_calls as u64),
            (
                "max_group_participants",
                self.max_group_participants as u64,
            ),
            ("screen_sharing", self.screen_sharing as u64),
            ("daily_messages", self.daily_messages as u64),
            ("unlimited_messages", self.unlimited_messages as u64),
            ("voice_notes", self.voice_notes as u64),
            (
                "max_voice_note_seconds",
                self.max_voice_note_seconds as u64,
            ),
            ("image_messages", self.image_messages as u64),
            ("read_receipts", self.read_receipts as u64),
            ("daily_likes", self.daily_likes as u64),
            ("daily_super_likes", self.daily_super_likes as u64),
            ("see_who_liked_you", self.see_who_liked_you as u64),
            ("advanced_filters", self.advanced_filters as u64),
            ("incognito_mode", self.incognito_mode as u64),
            ("global_discovery", self.global_discovery as u64),
            ("undo_last_like", self.undo_last_like as u64),
            ("max_photos", self.max_photos as u64),
            ("monthly_boosts", self.monthly_boosts as u64),
            ("community_access", self.community_access.level() as u64),
            ("search_priority", self.search_priority.level() as u64),
            ("message_priority", self.message_priority.level() as u64),
            ("support_priority", self.support_priority.level() as u64),
        ]
    }
}

// =============================================================================
// Feature access checks
// =============================================================================

/// Upgrade prompts shown when a boolean feature is denied
const UPGRADE_REASONS: &[(&str, &str)] = &[
    ("video_calls", "Video calls are available on Plus and Premium"),
    ("group_calls", "Group calls require Premium"),
    ("screen_sharing", "Screen sharing requires Premium"),
    (
        "unlimited_messages",
        "Unlimited messaging requires Premium",
    ),
    ("voice_notes", "Voice notes are available on Plus and Premium"),
    (
        "image_messages",
        "Photo messages are available on Plus and Premium",
    ),
    (
        "read_receipts",
        "Read receipts are available on Plus and Premium",
    ),
    (
        "see_who_liked_you",
        "See who liked you with Plus or Premium",
    ),
    (
        "advanced_filters",
        "Advanced filters are available on Plus and Premium",
    ),
    ("incognito_mode", "Incognito mode requires Premium"),
    ("global_discovery", "Global discovery requires Premium"),
    (
        "undo_last_like",
        "Undo your last like with Plus or Premium",
    ),
];

/// Result of a feature access check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureAccess {
    pub allowed: bool,
    /// Human-readable upgrade reason, set only when denied
    pub reason: Option<String>,
}

impl FeatureAccess {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn denied(feature_key: &str) -> Self {
        let reason = UPGRADE_REASONS
            .iter()
            .find(|(key, _)| *key == feature_key)
            .map(|(_, label)| (*label).to_string())
            .unwrap_or_else(|| "Upgrade to unlock this feature".to_string());
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Check whether a tier grants a boolean feature. Numeric and unknown keys
/// are always allowed — callers compare those quotas against usage counts
/// themselves.
pub fn check_access(tier: SubscriptionTier, feature_key: &str) -> FeatureAccess {
    let matrix = EntitlementMatrix::for_tier(tier);
    match matrix.boolean_field(feature_key) {
        Some(true) | None => FeatureAccess::allowed(),
        Some(false) => FeatureAccess::denied(feature_key),
    }
}

// =============================================================================
// Per-user entitlement reads
// =============================================================================

/// Unified entitlement state - answers "is this user's plan live right now?"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntitlementState {
    /// No subscription row, or nothing granting paid access
    Free,
    /// Payment verification started but not confirmed
    PendingActivation,
    /// Trial period active
    Trialing,
    /// Subscription active and in good standing
    Active,
    /// Active but set to cancel at the period boundary
    CancelScheduled,
    /// Renewal payment failed; access continues through the paid period
    BillingRetryGrace,
    /// Cancelled, access revoked
    Cancelled,
    /// Period lapsed without renewal, access revoked
    Expired,
}

impl EntitlementState {
    /// Whether paid-tier entitlements apply in this state
    pub fn is_entitled(&self) -> bool {
        matches!(
            self,
            Self::Trialing | Self::Active | Self::CancelScheduled | Self::BillingRetryGrace
        )
    }
}

impl std::fmt::Display for EntitlementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::PendingActivation => write!(f, "pending_activation"),
            Self::Trialing => write!(f, "trialing"),
            Self::Active => write!(f, "active"),
            Self::CancelScheduled => write!(f, "cancel_scheduled"),
            Self::BillingRetryGrace => write!(f, "billing_retry_grace"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// Complete entitlement information for a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntitlement {
    pub user_id: Uuid,
    pub state: EntitlementState,
    /// Effective tier: the stored tier while entitled, Free otherwise
    pub tier: SubscriptionTier,
    pub matrix: EntitlementMatrix,
    /// Consumable balances; None when the user has never held one
    pub snapshot: Option<EntitlementSnapshot>,
    pub computed_at: OffsetDateTime,
    /// Period/trial boundary relevant to the current state
    pub expires_at: Option<OffsetDateTime>,
}

impl UserEntitlement {
    pub fn has_feature(&self, feature_key: &str) -> bool {
        self.matrix.boolean_field(feature_key).unwrap_or(false)
    }
}

/// Entitlement service for computing and querying per-user entitlements
pub struct EntitlementService {
    pool: PgPool,
}

impl EntitlementService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Compute the complete entitlement for a user.
    /// This is THE read path for "what can this user do?".
    pub async fn entitlement_for_user(&self, user_id: Uuid) -> BillingResult<UserEntitlement> {
        let subscription: Option<Subscription> =
            sqlx::query_as("SELECT * FROM subscriptions WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        let snapshot: Option<EntitlementSnapshot> =
            sqlx::query_as("SELECT * FROM entitlement_snapshots WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(compute_entitlement(
            user_id,
            subscription.as_ref(),
            snapshot,
            OffsetDateTime::now_utc(),
        ))
    }

    /// Convenience single-feature check against the user's current tier
    pub async fn can_use_feature(
        &self,
        user_id: Uuid,
        feature_key: &str,
    ) -> BillingResult<FeatureAccess> {
        let entitlement = self.entitlement_for_user(user_id).await?;
        Ok(check_access(entitlement.tier, feature_key))
    }
}

/// Pure function: derive the entitlement from a subscription row.
/// Deterministic and testable without storage.
pub fn compute_entitlement(
    user_id: Uuid,
    subscription: Option<&Subscription>,
    snapshot: Option<EntitlementSnapshot>,
    now: OffsetDateTime,
) -> UserEntitlement {
    let (state, stored_tier, expires_at) = match subscription {
        None => (EntitlementState::Free, SubscriptionTier::Free, None),
        Some(sub) => {
            let tier = sub.tier_parsed();
            match sub.status_parsed() {
                SubscriptionStatus::Pending => {
                    (EntitlementState::PendingActivation, tier, None)
                }
                SubscriptionStatus::Active => {
                    if sub
                        .trial_end
                        .map(|trial_end| sub.is_trial && trial_end > now)
                        .unwrap_or(false)
                    {
                        (EntitlementState::Trialing, tier, sub.trial_end)
                    } else if sub.cancel_at_period_end {
                        (
                            EntitlementState::CancelScheduled,
                            tier,
                            Some(sub.current_period_end),
                        )
                    } else {
                        (EntitlementState::Active, tier, None)
                    }
                }
                SubscriptionStatus::BillingRetry => (
                    EntitlementState::BillingRetryGrace,
                    tier,
                    Some(sub.current_period_end),
                ),
                SubscriptionStatus::Cancelled => (EntitlementState::Cancelled, tier, None),
                SubscriptionStatus::Expired => (EntitlementState::Expired, tier, None),
            }
        }
    };

    // Revoked states never serve a paid matrix, whatever the stored tier says
    let effective_tier = if state.is_entitled() {
        stored_tier
    } else {
        SubscriptionTier::Free
    };

    UserEntitlement {
        user_id,
        state,
        tier: effective_tier,
        matrix: EntitlementMatrix::for_tier(effective_tier),
        snapshot,
        computed_at: now,
        expires_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entitlement_state_display() {
        assert_eq!(EntitlementState::Active.to_string(), "active");
        assert_eq!(
            EntitlementState::BillingRetryGrace.to_string(),
            "billing_retry_grace"
        );
        assert_eq!(
            EntitlementState::CancelScheduled.to_string(),
            "cancel_scheduled"
        );
    }

    #[test]
    fn test_matrix_for_free_tier() {
        let matrix = EntitlementMatrix::for_tier(SubscriptionTier::Free);
        assert!(matrix.audio_calls);
        assert!(!matrix.video_calls);
        assert!(!matrix.see_who_liked_you);
        assert_eq!(matrix.daily_likes, 15);
        assert_eq!(matrix.monthly_boosts, 0);
        assert_eq!(matrix.community_access, CommunityAccess::Read);
    }

    #[test]
    fn test_matrix_for_premium_tier() {
        let matrix = EntitlementMatrix::for_tier(SubscriptionTier::Premium);
        assert!(matrix.video_calls);
        assert!(matrix.group_calls);
        assert!(matrix.unlimited_messages);
        assert!(matrix.incognito_mode);
        assert_eq!(matrix.daily_messages, u32::MAX);
        assert_eq!(matrix.max_call_quality, CallQuality::Ultra);
        assert_eq!(matrix.support_priority, PriorityLevel::Ultra);
    }

    #[test]
    fn test_resolve_falls_back_to_free() {
        assert_eq!(
            EntitlementMatrix::resolve("not-a-tier"),
            EntitlementMatrix::for_tier(SubscriptionTier::Free)
        );
        assert_eq!(
            EntitlementMatrix::resolve("PREMIUM"),
            EntitlementMatrix::for_tier(SubscriptionTier::Premium)
        );
    }

    #[test]
    fn test_comparable_fields_covers_whole_matrix() {
        let fields = EntitlementMatrix::for_tier(SubscriptionTier::Free).comparable_fields();
        assert_eq!(fields.len(), 26);
    }

    // Every field must be non-decreasing across the full tier ordering. This
    // walks the flattened matrix so a newly added field is checked without
    // touching the test.
    #[test]
    fn test_matrix_monotonic_across_tiers() {
        let tiers = SubscriptionTier::all();
        for pair in tiers.windows(2) {
            let lower = EntitlementMatrix::for_tier(pair[0]).comparable_fields();
            let upper = EntitlementMatrix::for_tier(pair[1]).comparable_fields();
            assert_eq!(lower.len(), upper.len());

            for ((name_lo, value_lo), (name_hi, value_hi)) in
                lower.iter().zip(upper.iter())
            {
                assert_eq!(name_lo, name_hi);
                assert!(
                    value_lo <= value_hi,
                    "{} regressed from {} ({}) to {} ({})",
                    name_lo,
                    value_lo,
                    pair[0],
                    value_hi,
                    pair[1]
                );
            }
        }
    }

    #[test]
    fn test_check_access_denied_with_reason() {
        let access = check_access(SubscriptionTier::Free, "video_calls");
        assert!(!access.allowed);
        assert_eq!(
            access.reason.as_deref(),
            Some("Video calls are available on Plus and Premium")
        );

        let access = check_access(SubscriptionTier::Plus, "incognito_mode");
        assert!(!access.allowed);
        assert_eq!(access.reason.as_deref(), Some("Incognito mode requires Premium"));
    }

    #[test]
    fn test_check_access_granted_has_no_reason() {
        let access = check_access(SubscriptionTier::Premium, "incognito_mode");
        assert!(access.allowed);
        assert!(access.reason.is_none());
    }

    #[test]
    fn test_check_access_non_boolean_and_unknown_keys_allowed() {
        // Numeric quotas are compared by the caller, not denied here
        assert!(check_access(SubscriptionTier::Free, "daily_likes").allowed);
        assert!(check_access(SubscriptionTier::Free, "max_photos").allowed);
        // Unknown keys are not deniable fields
        assert!(check_access(SubscriptionTier::Free, "time_travel").allowed);
    }

    #[test]
    fn test_every_boolean_feature_has_an_upgrade_reason() {
        let free = EntitlementMatrix::for_tier(SubscriptionTier::Free);
        for (key, _) in UPGRADE_REASONS {
            assert!(
                free.boolean_field(key).is_some(),
                "upgrade reason references unknown field: {}",
                key
            );
        }
    }

    // -------------------------------------------------------------------------
    // compute_entitlement
    // -------------------------------------------------------------------------

    fn subscription_fixture(tier: &str, status: &str) -> Subscription {
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
    fn test_compute_entitlement_no_subscription_is_free() {
        let user_id = Uuid::new_v4();
        let entitlement =
            compute_entitlement(user_id, None, None, OffsetDateTime::now_utc());
        assert_eq!(entitlement.state, EntitlementState::Free);
        assert_eq!(entitlement.tier, SubscriptionTier::Free);
        assert!(!entitlement.has_feature("video_calls"));
    }

    #[test]
    fn test_compute_entitlement_active_serves_stored_tier() {
        let sub = subscription_fixture("premium", "active");
        let entitlement = compute_entitlement(
            sub.user_id,
            Some(&sub),
            None,
            OffsetDateTime::now_utc(),
        );
        assert_eq!(entitlement.state, EntitlementState::Active);
        assert_eq!(entitlement.tier, SubscriptionTier::Premium);
        assert!(entitlement.has_feature("incognito_mode"));
    }

    #[test]
    fn test_compute_entitlement_cancel_scheduled_keeps_access() {
        let mut sub = subscription_fixture("plus", "active");
        sub.cancel_at_period_end = true;
        let entitlement = compute_entitlement(
            sub.user_id,
            Some(&sub),
            None,
            OffsetDateTime::now_utc(),
        );
        assert_eq!(entitlement.state, EntitlementState::CancelScheduled);
        assert_eq!(entitlement.tier, SubscriptionTier::Plus);
        assert_eq!(entitlement.expires_at, Some(sub.current_period_end));
    }

    #[test]
    fn test_compute_entitlement_billing_retry_keeps_access() {
        let sub = subscription_fixture("plus", "billing_retry");
        let entitlement = compute_entitlement(
            sub.user_id,
            Some(&sub),
            None,
            OffsetDateTime::now_utc(),
        );
        assert_eq!(entitlement.state, EntitlementState::BillingRetryGrace);
        assert_eq!(entitlement.tier, SubscriptionTier::Plus);
    }

    #[test]
    fn test_compute_entitlement_trialing() {
        let now = OffsetDateTime::now_utc();
        let mut sub = subscription_fixture("premium", "active");
        sub.is_trial = true;
        sub.trial_end = Some(now + time::Duration::days(7));
        let entitlement = compute_entitlement(sub.user_id, Some(&sub), None, now);
        assert_eq!(entitlement.state, EntitlementState::Trialing);
        assert_eq!(entitlement.expires_at, sub.trial_end);
    }

    #[test]
    fn test_compute_entitlement_revoked_states_serve_free() {
        for status in ["cancelled", "expired"] {
            let sub = subscription_fixture("premium", status);
            let entitlement = compute_entitlement(
                sub.user_id,
                Some(&sub),
                None,
                OffsetDateTime::now_utc(),
            );
            assert!(!entitlement.state.is_entitled());
            assert_eq!(entitlement.tier, SubscriptionTier::Free);
            assert!(!entitlement.has_feature("see_who_liked_you"));
        }
    }

    #[test]
    fn test_compute_entitlement_pending_not_entitled() {
        let sub = subscription_fixture("plus", "pending");
        let entitlement = compute_entitlement(
            sub.user_id,
            Some(&sub),
            None,
            OffsetDateTime::now_utc(),
        );
        assert_eq!(entitlement.state, EntitlementState::PendingActivation);
        assert_eq!(entitlement.tier, SubscriptionTier::Free);
    }

    #[test]
    fn test_compute_entitlement_corrupt_tier_degrades_to_free() {
        let sub = subscription_fixture("diamond", "active");
        let entitlement = compute_entitlement(
            sub.user_id,
            Some(&sub),
            None,
            OffsetDateTime::now_utc(),
        );
        assert_eq!(entitlement.state, EntitlementState::Active);
        assert_eq!(entitlement.tier, SubscriptionTier::Free);
    }
}
