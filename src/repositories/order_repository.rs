use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::db::is_unique_violation;
use crate::entities::order::{
    ActiveModel as OrderActiveModel, Address, Column, Entity as Order, GuestInfo,
    Model as OrderModel, OrderPriority, OrderStatus, OrderTags, PaymentStatus,
};
use crate::entities::order_activity::{self, Entity as OrderActivity, Model as OrderActivityModel};
use crate::entities::order_item::{self, Entity as OrderItem, Model as OrderItemModel};
use crate::entities::payment_history::{
    self, Entity as PaymentHistory, Model as PaymentHistoryModel,
};
use crate::errors::ServiceError;
use crate::repositories::Repository;

use super::BaseRepository;

/// Line snapshot written alongside a new order
#[derive(Debug, Clone)]
pub struct NewOrderItem {
    pub variant_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
}

/// Charge details captured from the gateway at confirmation time
#[derive(Debug, Clone)]
pub struct NewPaymentRecord {
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
    pub payment_method_type: Option<String>,
    pub card_brand: Option<String>,
    pub card_last4: Option<String>,
    pub receipt_url: Option<String>,
}

/// Everything needed to write a paid order in one transaction
#[derive(Debug, Clone)]
pub struct NewPaidOrder {
    pub order_number: String,
    pub user_id: Option<Uuid>,
    pub guest_info: Option<GuestInfo>,
    pub shipping_address: Address,
    pub billing_address: Option<Address>,
    pub subtotal: Decimal,
    pub shipping_cost: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub payment_intent_id: String,
    pub notes: Option<String>,
    pub items: Vec<NewOrderItem>,
    pub payment: NewPaymentRecord,
}

/// Result of [`OrderRepository::persist_paid_order`].
#[derive(Debug, Clone)]
pub enum PersistOutcome {
    Created(OrderModel),
    /// Another writer already persisted an order for the same payment intent
    AlreadyExists(OrderModel),
}

impl PersistOutcome {
    pub fn into_order(self) -> OrderModel {
        match self {
            PersistOutcome::Created(o) | PersistOutcome::AlreadyExists(o) => o,
        }
    }
}

/// Side data recorded with a status transition
#[derive(Debug, Clone, Default)]
pub struct StatusChange {
    pub actor_id: Option<Uuid>,
    pub description: Option<String>,
    pub tracking_number: Option<String>,
    pub carrier: Option<String>,
    pub cancel_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OrderMetadataUpdate {
    pub notes: Option<String>,
    pub internal_notes: Option<String>,
    pub priority: Option<OrderPriority>,
    pub tags: Option<Vec<String>>,
}

impl OrderMetadataUpdate {
    pub fn is_empty(&self) -> bool {
        self.notes.is_none()
            && self.internal_notes.is_none()
            && self.priority.is_none()
            && self.tags.is_none()
    }
}

/// Repository for order operations
#[derive(Debug, Clone)]
pub struct OrderRepository {
    base: BaseRepository,
}

impl OrderRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }

    /// Find an order by ID
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<OrderModel>, ServiceError> {
        Ok(Order::find_by_id(id).one(self.base.get_db()).await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<OrderModel, ServiceError> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", id)))
    }

    /// Find the order backed by a payment intent
    pub async fn find_by_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<OrderModel>, ServiceError> {
        Ok(Order::find()
            .filter(Column::PaymentIntentId.eq(payment_intent_id))
            .one(self.base.get_db())
            .await?)
    }

    /// Find orders owned by a user, newest first. `page` is 1-based.
    pub async fn find_by_user(
        &self,
        user_id: Uuid,
        page: u64,
        page_size: u64,
    ) -> Result<(Vec<OrderModel>, u64), ServiceError> {
        let paginator = Order::find()
            .filter(Column::UserId.eq(user_id))
            .order_by_desc(Column::CreatedAt)
            .paginate(self.base.get_db(), page_size.max(1));

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;

        Ok((orders, total))
    }

    pub async fn find_items(&self, order_id: Uuid) -> Result<Vec<OrderItemModel>, ServiceError> {
        Ok(OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(self.base.get_db())
            .await?)
    }

    pub async fn find_payment_history(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<PaymentHistoryModel>, ServiceError> {
        Ok(PaymentHistory::find()
            .filter(payment_history::Column::OrderId.eq(order_id))
            .order_by_asc(payment_history::Column::CreatedAt)
            .all(self.base.get_db())
            .await?)
    }

    pub async fn find_activities(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<OrderActivityModel>, ServiceError> {
        Ok(OrderActivity::find()
            .filter(order_activity::Column::OrderId.eq(order_id))
            .order_by_asc(order_activity::Column::CreatedAt)
            .all(self.base.get_db())
            .await?)
    }

    /// Writes the order, its items and the payment ledger row in one transaction.
    ///
    /// A unique violation on `payment_intent_id` means a concurrent caller won the
    /// race; the winner's order is returned as [`PersistOutcome::AlreadyExists`].
    #[instrument(skip(self, new_order), fields(payment_intent_id = %new_order.payment_intent_id))]
    pub async fn persist_paid_order(
        &self,
        new_order: NewPaidOrder,
    ) -> Result<PersistOutcome, ServiceError> {
        let payment_intent_id = new_order.payment_intent_id.clone();

        match self.insert_order_graph(new_order).await {
            Ok(order) => Ok(PersistOutcome::Created(order)),
            Err(e) if is_unique_violation(&e) => {
                info!(payment_intent_id = %payment_intent_id, "order already persisted for payment intent");
                let existing = self
                    .find_by_payment_intent(&payment_intent_id)
                    .await?
                    .ok_or_else(|| {
                        // the unique index can also trip on order_number
                        ServiceError::Conflict(format!(
                            "Order could not be written for payment intent {}",
                            payment_intent_id
                        ))
                    })?;
                Ok(PersistOutcome::AlreadyExists(existing))
            }
            Err(e) => Err(ServiceError::DatabaseError(e)),
        }
    }

    async fn insert_order_graph(&self, new_order: NewPaidOrder) -> Result<OrderModel, DbErr> {
        let db = self.base.get_db();
        let now = Utc::now();
        let order_id = Uuid::new_v4();

        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for order creation");
            e
        })?;

        let order_active_model = OrderActiveModel {
            id: Set(order_id),
            order_number: Set(new_order.order_number),
            user_id: Set(new_order.user_id),
            is_guest: Set(new_order.user_id.is_none()),
            guest_info: Set(new_order.guest_info),
            shipping_address: Set(new_order.shipping_address),
            billing_address: Set(new_order.billing_address),
            subtotal: Set(new_order.subtotal),
            shipping_cost: Set(new_order.shipping_cost),
            tax: Set(new_order.tax),
            total: Set(new_order.total),
            currency: Set(new_order.currency),
            status: Set(OrderStatus::Pending),
            payment_status: Set(PaymentStatus::Paid),
            payment_intent_id: Set(new_order.payment_intent_id.clone()),
            priority: Set(OrderPriority::Normal),
            notes: Set(new_order.notes),
            internal_notes: Set(None),
            tags: Set(OrderTags::default()),
            tracking_number: Set(None),
            carrier: Set(None),
            cancel_reason: Set(None),
            shipped_at: Set(None),
            delivered_at: Set(None),
            cancelled_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            version: Set(1),
        };

        let order = match order_active_model.insert(&txn).await {
            Ok(order) => order,
            Err(e) => {
                if let Err(rb) = txn.rollback().await {
                    warn!(error = %rb, "rollback after failed order insert failed");
                }
                return Err(e);
            }
        };

        let items: Vec<order_item::ActiveModel> = new_order
            .items
            .into_iter()
            .map(|item| order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                variant_id: Set(item.variant_id),
                product_name: Set(item.product_name),
                quantity: Set(item.quantity),
                unit_price: Set(item.unit_price),
                total_price: Set(item.unit_price * Decimal::from(item.quantity)),
                created_at: Set(now),
            })
            .collect();

        if !items.is_empty() {
            OrderItem::insert_many(items).exec(&txn).await?;
        }

        let payment = new_order.payment;
        payment_history::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            payment_intent_id: Set(new_order.payment_intent_id),
            amount: Set(payment.amount),
            currency: Set(payment.currency),
            status: Set(payment.status),
            payment_method_type: Set(payment.payment_method_type),
            card_brand: Set(payment.card_brand),
            card_last4: Set(payment.card_last4),
            receipt_url: Set(payment.receipt_url),
            created_at: Set(now),
        }
        .insert(&txn)
        .await?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to commit order creation transaction");
            e
        })?;

        info!(order_id = %order_id, "Order persisted with items and payment record");
        Ok(order)
    }

    /// Moves an order to `next`, bumping its version and appending an activity row.
    ///
    /// Fails with `InvalidStatus` when the state machine forbids the edge and with
    /// `Conflict` when another writer changed the order concurrently.
    #[instrument(skip(self, change), fields(order_id = %order_id, next = %next))]
    pub async fn transition_status(
        &self,
        order_id: Uuid,
        next: OrderStatus,
        change: StatusChange,
    ) -> Result<(OrderModel, OrderStatus), ServiceError> {
        let db = self.base.get_db();
        let now = Utc::now();
        let txn = db.begin().await?;

        let current = Order::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                warn!(order_id = %order_id, "Order not found for status update");
                ServiceError::NotFound(format!("Order {} not found", order_id))
            })?;

        let previous = current.status;
        if !previous.can_transition_to(next) {
            return Err(ServiceError::InvalidStatus(format!(
                "Cannot move order from {} to {}",
                previous, next
            )));
        }

        let version = current.version;
        let mut active: OrderActiveModel = current.into();
        active.status = Set(next);
        active.updated_at = Set(now);
        active.version = Set(version + 1);
        apply_transition_fields(&mut active, next, &change, now);

        let updated = Order::update(active)
            .filter(Column::Version.eq(version))
            .exec(&txn)
            .await
            .map_err(|e| match e {
                DbErr::RecordNotUpdated => ServiceError::Conflict(format!(
                    "Order {} was modified concurrently",
                    order_id
                )),
                other => ServiceError::DatabaseError(other),
            })?;

        let description = change
            .description
            .clone()
            .unwrap_or_else(|| format!("Status changed from {} to {}", previous, next));
        insert_activity(
            &txn,
            order_id,
            &format!("status_{}", next),
            change.actor_id,
            Some(description),
            now,
        )
        .await?;

        txn.commit().await?;

        info!(order_id = %order_id, old_status = %previous, new_status = %next, "Order status updated");
        Ok((updated, previous))
    }

    #[instrument(skip(self, update), fields(order_id = %order_id))]
    pub async fn update_metadata(
        &self,
        order_id: Uuid,
        update: OrderMetadataUpdate,
        actor_id: Option<Uuid>,
    ) -> Result<OrderModel, ServiceError> {
        let db = self.base.get_db();
        let now = Utc::now();
        let txn = db.begin().await?;

        let current = Order::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let mut changed = Vec::new();
        let mut active: OrderActiveModel = current.into();
        if let Some(notes) = update.notes {
            active.notes = Set(Some(notes));
            changed.push("notes");
        }
        if let Some(internal) = update.internal_notes {
            active.internal_notes = Set(Some(internal));
            changed.push("internal_notes");
        }
        if let Some(priority) = update.priority {
            active.priority = Set(priority);
            changed.push("priority");
        }
        if let Some(tags) = update.tags {
            active.tags = Set(OrderTags(tags));
            changed.push("tags");
        }
        active.updated_at = Set(now);

        let updated = active.update(&txn).await?;
        insert_activity(
            &txn,
            order_id,
            "order_updated",
            actor_id,
            Some(format!("Updated {}", changed.join(", "))),
            now,
        )
        .await?;
        txn.commit().await?;

        Ok(updated)
    }

    /// Appends an audit entry outside of any other write
    pub async fn append_activity(
        &self,
        order_id: Uuid,
        action: &str,
        actor_id: Option<Uuid>,
        description: Option<String>,
    ) -> Result<OrderActivityModel, ServiceError> {
        Ok(insert_activity(
            self.base.get_db(),
            order_id,
            action,
            actor_id,
            description,
            Utc::now(),
        )
        .await?)
    }
}

fn apply_transition_fields(
    active: &mut OrderActiveModel,
    next: OrderStatus,
    change: &StatusChange,
    now: DateTime<Utc>,
) {
    match next {
        OrderStatus::Shipped => {
            active.shipped_at = Set(Some(now));
            if let Some(tracking) = &change.tracking_number {
                active.tracking_number = Set(Some(tracking.clone()));
            }
            if let Some(carrier) = &change.carrier {
                active.carrier = Set(Some(carrier.clone()));
            }
        }
        OrderStatus::Delivered => {
            active.delivered_at = Set(Some(now));
        }
        OrderStatus::Cancelled => {
            active.cancelled_at = Set(Some(now));
            active.cancel_reason = Set(change.cancel_reason.clone());
        }
        OrderStatus::Refunded => {
            active.payment_status = Set(PaymentStatus::Refunded);
        }
        _ => {}
    }
}

async fn insert_activity<C: sea_orm::ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    action: &str,
    actor_id: Option<Uuid>,
    description: Option<String>,
    at: DateTime<Utc>,
) -> Result<OrderActivityModel, DbErr> {
    order_activity::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        action: Set(action.to_string()),
        actor_id: Set(actor_id),
        description: Set(description),
        created_at: Set(at),
    }
    .insert(conn)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{establish_connection_with_config, run_migrations, DbConfig};
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    async fn repo() -> OrderRepository {
        let db = establish_connection_with_config(&DbConfig {
            url: "sqlite::memory:".into(),
            max_connections: 1,
            ..Default::default()
        })
        .await
        .unwrap();
        run_migrations(&db).await.unwrap();
        OrderRepository::new(Arc::new(db))
    }

    fn address() -> Address {
        Address {
            name: "Ada Lovelace".into(),
            line1: "1 Analytical Way".into(),
            line2: None,
            city: "London".into(),
            state: None,
            postal_code: "N1 9GU".into(),
            country: "GB".into(),
            phone: None,
        }
    }

    fn paid_order(intent: &str, number: &str) -> NewPaidOrder {
        NewPaidOrder {
            order_number: number.into(),
            user_id: Some(Uuid::new_v4()),
            guest_info: None,
            shipping_address: address(),
            billing_address: None,
            subtotal: dec!(45.00),
            shipping_cost: dec!(5.99),
            tax: dec!(4.34),
            total: dec!(55.33),
            currency: "usd".into(),
            payment_intent_id: intent.into(),
            notes: None,
            items: vec![NewOrderItem {
                variant_id: Uuid::new_v4(),
                product_name: "Notebook".into(),
                quantity: 3,
                unit_price: dec!(15.00),
            }],
            payment: NewPaymentRecord {
                amount: dec!(55.33),
                currency: "usd".into(),
                status: "succeeded".into(),
                payment_method_type: Some("card".into()),
                card_brand: Some("visa".into()),
                card_last4: Some("4242".into()),
                receipt_url: None,
            },
        }
    }

    #[tokio::test]
    async fn persist_writes_order_items_and_payment_row() {
        let repo = repo().await;
        let order = repo
            .persist_paid_order(paid_order("pi_1", "ORD-1"))
            .await
            .unwrap();
        let order = assert_matches!(order, PersistOutcome::Created(o) => o);

        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.payment_status, PaymentStatus::Paid);
        assert!(!order.is_guest);

        let items = repo.find_items(order.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].total_price.round_dp(2), dec!(45.00));

        let history = repo.find_payment_history(order.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].amount.round_dp(2), order.total.round_dp(2));
    }

    #[tokio::test]
    async fn second_persist_for_same_intent_returns_existing() {
        let repo = repo().await;
        let first = repo
            .persist_paid_order(paid_order("pi_dup", "ORD-A"))
            .await
            .unwrap()
            .into_order();
        let second = repo
            .persist_paid_order(paid_order("pi_dup", "ORD-B"))
            .await
            .unwrap();

        let second = assert_matches!(second, PersistOutcome::AlreadyExists(o) => o);
        assert_eq!(second.id, first.id);
        assert_eq!(repo.find_payment_history(first.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delivered_order_cannot_be_cancelled() {
        let repo = repo().await;
        let order = repo
            .persist_paid_order(paid_order("pi_flow", "ORD-F"))
            .await
            .unwrap()
            .into_order();

        for next in [
            OrderStatus::Confirmed,
            OrderStatus::Shipped,
            OrderStatus::Delivered,
        ] {
            repo.transition_status(order.id, next, StatusChange::default())
                .await
                .unwrap();
        }

        let err = repo
            .transition_status(order.id, OrderStatus::Cancelled, StatusChange::default())
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::InvalidStatus(_));

        let reloaded = repo.get(order.id).await.unwrap();
        assert_eq!(reloaded.status, OrderStatus::Delivered);
        assert_eq!(reloaded.version, 4);
        assert!(reloaded.delivered_at.is_some());
        assert_eq!(repo.find_activities(order.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn cancel_records_reason() {
        let repo = repo().await;
        let order = repo
            .persist_paid_order(paid_order("pi_c", "ORD-C"))
            .await
            .unwrap()
            .into_order();
        let (cancelled, previous) = repo
            .transition_status(
                order.id,
                OrderStatus::Cancelled,
                StatusChange {
                    cancel_reason: Some("customer request".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(previous, OrderStatus::Pending);
        assert_eq!(cancelled.cancel_reason.as_deref(), Some("customer request"));
        assert!(cancelled.cancelled_at.is_some());
    }

    #[tokio::test]
    async fn metadata_update_sets_tags_and_priority() {
        let repo = repo().await;
        let order = repo
            .persist_paid_order(paid_order("pi_m", "ORD-M"))
            .await
            .unwrap()
            .into_order();
        let updated = repo
            .update_metadata(
                order.id,
                OrderMetadataUpdate {
                    priority: Some(OrderPriority::Urgent),
                    tags: Some(vec!["gift".into()]),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(updated.priority, OrderPriority::Urgent);
        assert_eq!(updated.tags, OrderTags(vec!["gift".into()]));
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let repo = repo().await;
        assert_matches!(
            repo.get(Uuid::new_v4()).await,
            Err(ServiceError::NotFound(_))
        );
    }
}
