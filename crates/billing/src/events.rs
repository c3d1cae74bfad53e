//! Payment lifecycle events
//!
//! Services announce lifecycle changes through an injected [`EventPublisher`]
//! rather than a process-global broadcaster, so each host decides delivery:
//! the app pushes to devices, the worker discards, tests capture on a channel.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::Uuid;

use lovebird_shared::types::SubscriptionTier;

/// Events emitted by the billing services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentEvent {
    SubscriptionActivated {
        user_id: Uuid,
        tier: SubscriptionTier,
    },
    SubscriptionRenewed {
        user_id: Uuid,
        tier: SubscriptionTier,
        current_period_end: OffsetDateTime,
    },
    SubscriptionCancelled {
        user_id: Uuid,
        immediate: bool,
    },
    SubscriptionReactivated {
        user_id: Uuid,
    },
    SubscriptionExpired {
        user_id: Uuid,
    },
    SubscriptionBillingRetry {
        user_id: Uuid,
    },
    PlanChanged {
        user_id: Uuid,
        previous_tier: SubscriptionTier,
        new_tier: SubscriptionTier,
    },
    AutoRenewChanged {
        user_id: Uuid,
        enabled: bool,
    },
    RefundProcessed {
        user_id: Uuid,
        external_transaction_id: String,
    },
    ConsumableGranted {
        user_id: Uuid,
        product_id: String,
        boosts: i32,
        super_likes: i32,
    },
}

/// Delivery seam for payment events. `publish` must not block and must not
/// fail the calling transition; a lost event is survivable, a lost state
/// change is not.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: PaymentEvent);
}

/// Publisher backed by an unbounded channel. The host owns the receiving end.
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<PaymentEvent>,
}

impl ChannelPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PaymentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventPublisher for ChannelPublisher {
    fn publish(&self, event: PaymentEvent) {
        // Receiver gone means the host is shutting down; drop quietly
        if self.tx.send(event).is_err() {
            tracing::debug!("Payment event dropped: no active subscriber");
        }
    }
}

/// Publisher that discards everything. Used by the worker and in tests that
/// don't assert on events.
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, _event: PaymentEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_publisher_delivers() {
        let (publisher, mut rx) = ChannelPublisher::new();
        let user_id = Uuid::new_v4();

        publisher.publish(PaymentEvent::SubscriptionActivated {
            user_id,
            tier: SubscriptionTier::Plus,
        });

        let received = rx.try_recv().expect("event should be queued");
        assert_eq!(
            received,
            PaymentEvent::SubscriptionActivated {
                user_id,
                tier: SubscriptionTier::Plus,
            }
        );
    }

    #[test]
    fn test_publish_after_receiver_dropped_does_not_panic() {
        let (publisher, rx) = ChannelPublisher::new();
        drop(rx);

        publisher.publish(PaymentEvent::SubscriptionExpired {
            user_id: Uuid::new_v4(),
        });
    }

    #[test]
    fn test_events_serialize_with_type_tag() {
        let event = PaymentEvent::AutoRenewChanged {
            user_id: Uuid::new_v4(),
            enabled: false,
        };
        let value = serde_json::to_value(&event).expect("serializable");
        assert_eq!(value["type"], "auto_renew_changed");
        assert_eq!(value["enabled"], false);
    }
}
