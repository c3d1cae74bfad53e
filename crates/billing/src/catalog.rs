//! Store product catalog
//!
//! Maps App Store product identifiers to subscription tiers, billing periods,
//! and consumable grants. Stripe price IDs are resolved separately through
//! `StripeConfig` since those are environment-specific.

use lovebird_shared::types::SubscriptionTier;

/// Billing period for a subscription product
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingPeriod {
    Monthly,
    Yearly,
}

impl BillingPeriod {
    /// Fallback period length, used only when a verified receipt carries no
    /// expiry of its own
    pub fn days(&self) -> i64 {
        match self {
            Self::Monthly => 30,
            Self::Yearly => 365,
        }
    }
}

/// An auto-renewable subscription product
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionProduct {
    pub product_id: &'static str,
    pub tier: SubscriptionTier,
    pub period: BillingPeriod,
}

/// A one-time consumable product credited to the entitlement snapshot
#[derive(Debug, Clone, Copy)]
pub struct ConsumableProduct {
    pub product_id: &'static str,
    pub boosts: i32,
    pub super_likes: i32,
}

/// Catalog entry for any purchasable product
#[derive(Debug, Clone, Copy)]
pub enum Product {
    Subscription(&'static SubscriptionProduct),
    Consumable(&'static ConsumableProduct),
}

const SUBSCRIPTION_PRODUCTS: &[SubscriptionProduct] = &[
    SubscriptionProduct {
        product_id: "com.lovebird.plus.monthly",
        tier: SubscriptionTier::Plus,
        period: BillingPeriod::Monthly,
    },
    SubscriptionProduct {
        product_id: "com.lovebird.plus.yearly",
        tier: SubscriptionTier::Plus,
        period: BillingPeriod::Yearly,
    },
    SubscriptionProduct {
        product_id: "com.lovebird.premium.monthly",
        tier: SubscriptionTier::Premium,
        period: BillingPeriod::Monthly,
    },
    SubscriptionProduct {
        product_id: "com.lovebird.premium.yearly",
        tier: SubscriptionTier::Premium,
        period: BillingPeriod::Yearly,
    },
];

const CONSUMABLE_PRODUCTS: &[ConsumableProduct] = &[
    ConsumableProduct {
        product_id: "com.lovebird.boosts.5",
        boosts: 5,
        super_likes: 0,
    },
    ConsumableProduct {
        product_id: "com.lovebird.boosts.15",
        boosts: 15,
        super_likes: 0,
    },
    ConsumableProduct {
        product_id: "com.lovebird.superlikes.10",
        boosts: 0,
        super_likes: 10,
    },
    ConsumableProduct {
        product_id: "com.lovebird.superlikes.30",
        boosts: 0,
        super_likes: 30,
    },
];

/// Look up any product by its store identifier
pub fn lookup(product_id: &str) -> Option<Product> {
    if let Some(sub) = subscription_product(product_id) {
        return Some(Product::Subscription(sub));
    }
    consumable_product(product_id).map(Product::Consumable)
}

/// Look up a subscription product by its store identifier
pub fn subscription_product(product_id: &str) -> Option<&'static SubscriptionProduct> {
    SUBSCRIPTION_PRODUCTS
        .iter()
        .find(|p| p.product_id == product_id)
}

/// Look up a consumable product by its store identifier
pub fn consumable_product(product_id: &str) -> Option<&'static ConsumableProduct> {
    CONSUMABLE_PRODUCTS
        .iter()
        .find(|p| p.product_id == product_id)
}

/// Tier for a subscription product ID, if known
pub fn tier_for_product_id(product_id: &str) -> Option<SubscriptionTier> {
    subscription_product(product_id).map(|p| p.tier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_lookup() {
        let product = subscription_product("com.lovebird.premium.yearly")
            .expect("known product");
        assert_eq!(product.tier, SubscriptionTier::Premium);
        assert_eq!(product.period, BillingPeriod::Yearly);
        assert_eq!(product.period.days(), 365);
    }

    #[test]
    fn test_consumable_lookup() {
        let product =
            consumable_product("com.lovebird.superlikes.10").expect("known product");
        assert_eq!(product.super_likes, 10);
        assert_eq!(product.boosts, 0);
    }

    #[test]
    fn test_lookup_dispatches_by_kind() {
        assert!(matches!(
            lookup("com.lovebird.plus.monthly"),
            Some(Product::Subscription(_))
        ));
        assert!(matches!(
            lookup("com.lovebird.boosts.5"),
            Some(Product::Consumable(_))
        ));
        assert!(lookup("com.lovebird.unknown").is_none());
    }

    #[test]
    fn test_tier_for_product_id() {
        assert_eq!(
            tier_for_product_id("com.lovebird.plus.yearly"),
            Some(SubscriptionTier::Plus)
        );
        assert_eq!(tier_for_product_id("com.lovebird.boosts.5"), None);
    }

    #[test]
    fn test_product_ids_are_unique() {
        let mut ids: Vec<&str> = SUBSCRIPTION_PRODUCTS
            .iter()
            .map(|p| p.product_id)
            .chain(CONSUMABLE_PRODUCTS.iter().map(|p| p.product_id))
            .collect();
        let total = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), total);
    }
}
