//! Lovebird Billing Engine
//!
//! This crate contains the subscription lifecycle, entitlement, and payment
//! reconciliation components for Lovebird. Card billing goes through Stripe,
//! mobile in-app purchases through the App Store; both feed the same state
//! machine, ledger, and entitlement snapshots.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod appstore_gateway;
pub mod audit;
pub mod catalog;
pub mod entitlements;
pub mod error;
pub mod events;
pub mod gateway;
pub mod ledger;
pub mod purchases;
pub mod snapshot;
pub mod stripe_gateway;
pub mod subscriptions;
pub mod webhooks;

pub use appstore_gateway::{AppStoreConfig, AppStoreGateway};
pub use error::{BillingError, BillingResult};
pub use events::{ChannelPublisher, EventPublisher, NoopPublisher, PaymentEvent};
pub use gateway::{GatewayNotification, PaymentGateway, ReceiptVerification};
pub use purchases::{PurchaseOutcome, PurchaseService};
pub use stripe_gateway::{StripeConfig, StripeGateway};
pub use subscriptions::SubscriptionService;
pub use webhooks::{RouteOutcome, WebhookRouter};
