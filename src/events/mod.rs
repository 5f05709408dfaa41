use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends without surfacing failure to the caller.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "dropping domain event");
        }
    }
}

/// Domain events emitted by the checkout and order-management services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    PaymentIntentCreated {
        payment_intent_id: String,
        cart_id: Uuid,
        amount: Decimal,
        currency: String,
    },
    PaymentRequiresAction {
        payment_intent_id: String,
    },
    PaymentFailed {
        payment_intent_id: String,
        reason: String,
    },
    OrderCreated {
        order_id: Uuid,
        payment_intent_id: String,
        total: Decimal,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
        changed_at: DateTime<Utc>,
    },
    OrderCancelled {
        order_id: Uuid,
        reason: Option<String>,
    },
    CartCleared(Uuid),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::PaymentIntentCreated { .. } => "payment_intent_created",
            Event::PaymentRequiresAction { .. } => "payment_requires_action",
            Event::PaymentFailed { .. } => "payment_failed",
            Event::OrderCreated { .. } => "order_created",
            Event::OrderStatusChanged { .. } => "order_status_changed",
            Event::OrderCancelled { .. } => "order_cancelled",
            Event::CartCleared(_) => "cart_cleared",
        }
    }
}

/// Drains the event channel until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::PaymentIntentCreated {
                payment_intent_id,
                cart_id,
                amount,
                currency,
            } => {
                info!(
                    event = event.name(),
                    payment_intent_id = %payment_intent_id,
                    cart_id = %cart_id,
                    amount = %amount,
                    currency = %currency,
                    "payment intent created"
                );
            }
            Event::PaymentRequiresAction { payment_intent_id } => {
                info!(event = event.name(), payment_intent_id = %payment_intent_id, "payment requires customer action");
            }
            Event::PaymentFailed {
                payment_intent_id,
                reason,
            } => {
                warn!(event = event.name(), payment_intent_id = %payment_intent_id, reason = %reason, "payment failed");
            }
            Event::OrderCreated {
                order_id,
                payment_intent_id,
                total,
            } => {
                info!(
                    event = event.name(),
                    order_id = %order_id,
                    payment_intent_id = %payment_intent_id,
                    total = %total,
                    "order created"
                );
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
                ..
            } => {
                info!(
                    event = event.name(),
                    order_id = %order_id,
                    old_status = %old_status,
                    new_status = %new_status,
                    "order status changed"
                );
            }
            Event::OrderCancelled { order_id, reason } => {
                info!(event = event.name(), order_id = %order_id, reason = ?reason, "order cancelled");
            }
            Event::CartCleared(cart_id) => {
                info!(event = event.name(), cart_id = %cart_id, "cart cleared");
            }
        }
    }

    warn!("Event processing loop has ended");
}
