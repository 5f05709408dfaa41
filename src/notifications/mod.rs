use async_trait::async_trait;
use redis::{AsyncCommands, Client};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::entities::order::Address;
use crate::repositories::OrderRepository;

/// Redis list consumed by the external mailer
pub const EMAIL_QUEUE_KEY: &str = "notifications:email";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailLine {
    pub product_name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
}

/// Payload of the order-confirmation email
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderConfirmationEmail {
    pub order_id: Uuid,
    pub order_number: String,
    pub to_email: String,
    pub customer_name: String,
    pub is_guest: bool,
    pub subtotal: Decimal,
    pub shipping_cost: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub items: Vec<EmailLine>,
    pub shipping_address: Address,
    pub receipt_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Activity log error: {0}")]
    ActivityLog(String),
}

/// Fire-and-forget side effects of a completed checkout.
///
/// Callers log failures and move on; nothing here may undo a committed order.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_order_confirmation(
        &self,
        email: OrderConfirmationEmail,
    ) -> Result<(), NotificationError>;

    async fn log_activity(
        &self,
        order_id: Uuid,
        action: &str,
        actor_id: Option<Uuid>,
    ) -> Result<(), NotificationError>;
}

/// Queues confirmation emails on Redis and records activity through the order repository
#[derive(Clone)]
pub struct RedisNotificationSink {
    redis: Arc<Client>,
    orders: Arc<OrderRepository>,
    queue_key: String,
}

impl RedisNotificationSink {
    pub fn new(redis_url: &str, orders: Arc<OrderRepository>) -> Result<Self, NotificationError> {
        let redis = Client::open(redis_url)?;
        Ok(Self {
            redis: Arc::new(redis),
            orders,
            queue_key: EMAIL_QUEUE_KEY.to_string(),
        })
    }

    pub fn with_queue_key(mut self, key: impl Into<String>) -> Self {
        self.queue_key = key.into();
        self
    }
}

#[async_trait]
impl NotificationSink for RedisNotificationSink {
    #[instrument(skip(self, email), fields(order_id = %email.order_id))]
    async fn send_order_confirmation(
        &self,
        email: OrderConfirmationEmail,
    ) -> Result<(), NotificationError> {
        let json = serde_json::to_string(&email)?;
        let mut conn = self.redis.get_async_connection().await?;
        let depth: i64 = conn.rpush(&self.queue_key, json).await?;

        info!(order_id = %email.order_id, queue = %self.queue_key, depth, "Order confirmation email queued");
        Ok(())
    }

    async fn log_activity(
        &self,
        order_id: Uuid,
        action: &str,
        actor_id: Option<Uuid>,
    ) -> Result<(), NotificationError> {
        self.orders
            .append_activity(order_id, action, actor_id, None)
            .await
            .map_err(|e| NotificationError::ActivityLog(e.to_string()))?;
        debug!(order_id = %order_id, action, "activity logged");
        Ok(())
    }
}
