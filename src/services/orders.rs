use crate::{
    auth::AuthUser,
    entities::order::{Address, GuestInfo, Model as OrderModel, OrderPriority, OrderStatus, PaymentStatus},
    entities::order_item::Model as OrderItemModel,
    entities::payment_history::Model as PaymentHistoryModel,
    errors::ServiceError,
    events::{Event, EventSender},
    repositories::{OrderMetadataUpdate, OrderRepository, StatusChange},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OrderItemResponse {
    pub id: Uuid,
    pub variant_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    #[schema(value_type = String)]
    pub unit_price: Decimal,
    #[schema(value_type = String)]
    pub total_price: Decimal,
}

impl From<OrderItemModel> for OrderItemResponse {
    fn from(item: OrderItemModel) -> Self {
        Self {
            id: item.id,
            variant_id: item.variant_id,
            product_name: item.product_name,
            quantity: item.quantity,
            unit_price: item.unit_price.round_dp(2),
            total_price: item.total_price.round_dp(2),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OrderResponse {
    pub id: Uuid,
    pub order_number: String,
    pub user_id: Option<Uuid>,
    pub is_guest: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_info: Option<GuestInfo>,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub priority: OrderPriority,
    #[schema(value_type = String, example = "45.00")]
    pub subtotal: Decimal,
    #[schema(value_type = String, example = "5.99")]
    pub shipping_cost: Decimal,
    #[schema(value_type = String, example = "4.34")]
    pub tax: Decimal,
    #[schema(value_type = String, example = "55.33")]
    pub total: Decimal,
    pub currency: String,
    pub payment_intent_id: String,
    pub shipping_address: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing_address: Option<Address>,
    pub notes: Option<String>,
    /// Only returned to administrators
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_notes: Option<String>,
    pub tags: Vec<String>,
    pub tracking_number: Option<String>,
    pub carrier: Option<String>,
    pub cancel_reason: Option<String>,
    pub items: Vec<OrderItemResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i32,
}

impl OrderResponse {
    pub fn from_parts(order: OrderModel, items: Vec<OrderItemModel>, include_internal: bool) -> Self {
        Self {
            id: order.id,
            order_number: order.order_number,
            user_id: order.user_id,
            is_guest: order.is_guest,
            guest_info: order.guest_info,
            status: order.status,
            payment_status: order.payment_status,
            priority: order.priority,
            subtotal: order.subtotal.round_dp(2),
            shipping_cost: order.shipping_cost.round_dp(2),
            tax: order.tax.round_dp(2),
            total: order.total.round_dp(2),
            currency: order.currency,
            payment_intent_id: order.payment_intent_id,
            shipping_address: order.shipping_address,
            billing_address: order.billing_address,
            notes: order.notes,
            internal_notes: if include_internal {
                order.internal_notes
            } else {
                None
            },
            tags: order.tags.0,
            tracking_number: order.tracking_number,
            carrier: order.carrier,
            cancel_reason: order.cancel_reason,
            items: items.into_iter().map(OrderItemResponse::from).collect(),
            created_at: order.created_at,
            updated_at: order.updated_at,
            version: order.version,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PaymentHistoryResponse {
    pub id: Uuid,
    pub payment_intent_id: String,
    #[schema(value_type = String, example = "55.33")]
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
    pub payment_method_type: Option<String>,
    pub card_brand: Option<String>,
    pub card_last4: Option<String>,
    pub receipt_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<PaymentHistoryModel> for PaymentHistoryResponse {
    fn from(row: PaymentHistoryModel) -> Self {
        Self {
            id: row.id,
            payment_intent_id: row.payment_intent_id,
            amount: row.amount.round_dp(2),
            currency: row.currency,
            status: row.status,
            payment_method_type: row.payment_method_type,
            card_brand: row.card_brand,
            card_last4: row.card_last4,
            receipt_url: row.receipt_url,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OrderStatusView {
    pub order_id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub tracking_number: Option<String>,
    pub carrier: Option<String>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OrderListResponse {
    pub orders: Vec<OrderResponse>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

#[derive(Debug, Default, Serialize, Deserialize, Validate, ToSchema)]
pub struct CancelOrderRequest {
    #[validate(length(max = 500))]
    pub reason: Option<String>,
    /// Guest orders are cancelled by proving the checkout email
    #[validate(email)]
    pub email: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
pub struct ShipOrderRequest {
    #[validate(length(min = 1, max = 100))]
    pub tracking_number: String,
    #[validate(length(min = 1, max = 50))]
    pub carrier: String,
}

#[derive(Debug, Default, Serialize, Deserialize, Validate, ToSchema)]
pub struct UpdateOrderRequest {
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
    #[validate(length(max = 2000))]
    pub internal_notes: Option<String>,
    pub priority: Option<OrderPriority>,
    #[validate(length(max = 20))]
    pub tags: Option<Vec<String>>,
}

/// Order-management surface over the order repository
#[derive(Clone)]
pub struct OrderService {
    orders: Arc<OrderRepository>,
    event_sender: Arc<EventSender>,
}

impl OrderService {
    pub fn new(orders: Arc<OrderRepository>, event_sender: Arc<EventSender>) -> Self {
        Self {
            orders,
            event_sender,
        }
    }

    async fn load_visible(
        &self,
        order_id: Uuid,
        viewer: Option<&AuthUser>,
    ) -> Result<OrderModel, ServiceError> {
        let order = self.orders.get(order_id).await?;
        ensure_can_view(&order, viewer)?;
        Ok(order)
    }

    #[instrument(skip(self, viewer), fields(order_id = %order_id))]
    pub async fn get_order(
        &self,
        order_id: Uuid,
        viewer: Option<&AuthUser>,
    ) -> Result<OrderResponse, ServiceError> {
        let order = self.load_visible(order_id, viewer).await?;
        let items = self.orders.find_items(order_id).await?;
        let is_admin = viewer.is_some_and(AuthUser::is_admin);
        Ok(OrderResponse::from_parts(order, items, is_admin))
    }

    #[instrument(skip(self, viewer), fields(order_id = %order_id))]
    pub async fn get_payment_history(
        &self,
        order_id: Uuid,
        viewer: Option<&AuthUser>,
    ) -> Result<Vec<PaymentHistoryResponse>, ServiceError> {
        self.load_visible(order_id, viewer).await?;
        let rows = self.orders.find_payment_history(order_id).await?;
        Ok(rows.into_iter().map(PaymentHistoryResponse::from).collect())
    }

    #[instrument(skip(self, viewer), fields(order_id = %order_id))]
    pub async fn get_status(
        &self,
        order_id: Uuid,
        viewer: Option<&AuthUser>,
    ) -> Result<OrderStatusView, ServiceError> {
        let order = self.load_visible(order_id, viewer).await?;
        Ok(OrderStatusView {
            order_id: order.id,
            order_number: order.order_number,
            status: order.status,
            payment_status: order.payment_status,
            tracking_number: order.tracking_number,
            carrier: order.carrier,
            shipped_at: order.shipped_at,
            delivered_at: order.delivered_at,
            cancelled_at: order.cancelled_at,
            updated_at: order.updated_at,
        })
    }

    /// The caller's own orders, newest first
    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    pub async fn list_orders(
        &self,
        user: &AuthUser,
        page: u64,
        per_page: u64,
    ) -> Result<OrderListResponse, ServiceError> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, 100);
        let (orders, total) = self.orders.find_by_user(user.user_id, page, per_page).await?;

        let mut responses = Vec::with_capacity(orders.len());
        for order in orders {
            let items = self.orders.find_items(order.id).await?;
            responses.push(OrderResponse::from_parts(order, items, user.is_admin()));
        }

        info!(total = total, page = page, per_page = per_page, returned_count = responses.len(), "Orders listed successfully");
        Ok(OrderListResponse {
            orders: responses,
            total,
            page,
            per_page,
        })
    }

    pub async fn confirm_order(
        &self,
        order_id: Uuid,
        actor: &AuthUser,
    ) -> Result<OrderStatusView, ServiceError> {
        actor.require_admin()?;
        self.transition(order_id, OrderStatus::Confirmed, change_by(actor))
            .await
    }

    pub async fn mark_processing(
        &self,
        order_id: Uuid,
        actor: &AuthUser,
    ) -> Result<OrderStatusView, ServiceError> {
        actor.require_admin()?;
        self.transition(order_id, OrderStatus::Processing, change_by(actor))
            .await
    }

    pub async fn mark_shipped(
        &self,
        order_id: Uuid,
        actor: &AuthUser,
        request: ShipOrderRequest,
    ) -> Result<OrderStatusView, ServiceError> {
        actor.require_admin()?;
        request.validate()?;
        let change = StatusChange {
            description: Some(format!(
                "Shipped via {} ({})",
                request.carrier, request.tracking_number
            )),
            tracking_number: Some(request.tracking_number),
            carrier: Some(request.carrier),
            ..change_by(actor)
        };
        self.transition(order_id, OrderStatus::Shipped, change).await
    }

    pub async fn mark_delivered(
        &self,
        order_id: Uuid,
        actor: &AuthUser,
    ) -> Result<OrderStatusView, ServiceError> {
        actor.require_admin()?;
        self.transition(order_id, OrderStatus::Delivered, change_by(actor))
            .await
    }

    /// Cancels an order that has not shipped yet.
    ///
    /// Owners and admins may cancel; guest orders require the checkout email.
    #[instrument(skip(self, viewer, request), fields(order_id = %order_id))]
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        viewer: Option<&AuthUser>,
        request: CancelOrderRequest,
    ) -> Result<OrderStatusView, ServiceError> {
        request.validate()?;
        let order = self.orders.get(order_id).await?;
        ensure_can_cancel(&order, viewer, request.email.as_deref())?;

        let change = StatusChange {
            actor_id: viewer.map(|u| u.user_id),
            description: request
                .reason
                .as_ref()
                .map(|r| format!("Cancelled: {}", r)),
            cancel_reason: request.reason.clone(),
            ..Default::default()
        };
        let view = self
            .transition(order_id, OrderStatus::Cancelled, change)
            .await?;

        self.event_sender
            .send_or_log(Event::OrderCancelled {
                order_id,
                reason: request.reason,
            })
            .await;
        Ok(view)
    }

    #[instrument(skip(self, actor, request), fields(order_id = %order_id))]
    pub async fn update_order(
        &self,
        order_id: Uuid,
        actor: &AuthUser,
        request: UpdateOrderRequest,
    ) -> Result<OrderResponse, ServiceError> {
        actor.require_admin()?;
        request.validate()?;

        let update = OrderMetadataUpdate {
            notes: request.notes,
            internal_notes: request.internal_notes,
            priority: request.priority,
            tags: request.tags.map(normalize_tags),
        };
        if update.is_empty() {
            return Err(ServiceError::ValidationError(
                "Nothing to update".to_string(),
            ));
        }

        let order = self
            .orders
            .update_metadata(order_id, update, Some(actor.user_id))
            .await?;
        let items = self.orders.find_items(order_id).await?;
        info!(order_id = %order_id, "Order metadata updated");
        Ok(OrderResponse::from_parts(order, items, true))
    }

    async fn transition(
        &self,
        order_id: Uuid,
        next: OrderStatus,
        change: StatusChange,
    ) -> Result<OrderStatusView, ServiceError> {
        let (order, previous) = self.orders.transition_status(order_id, next, change).await?;

        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: previous.to_string(),
                new_status: next.to_string(),
                changed_at: order.updated_at,
            })
            .await;

        Ok(OrderStatusView {
            order_id: order.id,
            order_number: order.order_number,
            status: order.status,
            payment_status: order.payment_status,
            tracking_number: order.tracking_number,
            carrier: order.carrier,
            shipped_at: order.shipped_at,
            delivered_at: order.delivered_at,
            cancelled_at: order.cancelled_at,
            updated_at: order.updated_at,
        })
    }
}

fn change_by(actor: &AuthUser) -> StatusChange {
    StatusChange {
        actor_id: Some(actor.user_id),
        ..Default::default()
    }
}

/// Guest orders are readable by id; user orders by their owner or an admin.
fn ensure_can_view(order: &OrderModel, viewer: Option<&AuthUser>) -> Result<(), ServiceError> {
    let Some(owner) = order.user_id else {
        return Ok(());
    };
    match viewer {
        Some(user) if user.user_id == owner || user.is_admin() => Ok(()),
        Some(_) => {
            warn!(order_id = %order.id, "order access denied");
            // indistinguishable from a missing order
            Err(ServiceError::NotFound(format!("Order {} not found", order.id)))
        }
        None => Err(ServiceError::Unauthorized(
            "Authentication required".to_string(),
        )),
    }
}

fn ensure_can_cancel(
    order: &OrderModel,
    viewer: Option<&AuthUser>,
    email: Option<&str>,
) -> Result<(), ServiceError> {
    if viewer.is_some_and(AuthUser::is_admin) {
        return Ok(());
    }
    match (&order.guest_info, order.user_id) {
        (_, Some(_)) => ensure_can_view(order, viewer),
        (Some(guest), None) => match email {
            Some(e) if e.eq_ignore_ascii_case(&guest.email) => Ok(()),
            _ => Err(ServiceError::Forbidden(
                "Guest orders are cancelled with the checkout email".to_string(),
            )),
        },
        (None, None) => Err(ServiceError::Forbidden(
            "Order cannot be cancelled by this caller".to_string(),
        )),
    }
}

fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim().to_ascii_lowercase();
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}
