use crate::{
    entities::commerce::{cart, cart_item, Cart, CartItem, CartModel},
    errors::ServiceError,
    events::{Event, EventSender},
};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, ModelTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// Read/clear access to carts as the checkout sees them.
///
/// The checkout never mutates cart contents; it reads a snapshot when pricing
/// the intent, re-reads it when finalizing, and clears it once the order is durable.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CartStore: Send + Sync {
    /// Fails with `NotFound` when the cart does not exist.
    async fn get_cart(&self, cart_id: Uuid) -> Result<CartWithItems, ServiceError>;

    /// Removes every item. Clearing an empty or missing cart is a no-op.
    async fn clear_cart(&self, cart_id: Uuid) -> Result<(), ServiceError>;
}

/// Shopping cart service backed by the `carts` and `cart_items` tables.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    default_currency: String,
}

impl CartService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        default_currency: impl Into<String>,
    ) -> Self {
        Self {
            db,
            event_sender,
            default_currency: default_currency.into(),
        }
    }

    /// Creates an empty active cart.
    #[instrument(skip(self))]
    pub async fn create_cart(&self, input: CreateCartInput) -> Result<CartModel, ServiceError> {
        input.validate()?;
        let cart_id = Uuid::new_v4();
        let now = Utc::now();

        let cart = cart::ActiveModel {
            id: Set(cart_id),
            customer_id: Set(input.customer_id),
            currency: Set(input
                .currency
                .unwrap_or_else(|| self.default_currency.clone())
                .to_lowercase()),
            subtotal: Set(Decimal::ZERO),
            status: Set(cart::CartStatus::Active),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let cart = cart.insert(&*self.db).await?;

        info!("Created cart: {}", cart_id);
        Ok(cart)
    }

    /// Adds an item to the cart or increments the quantity of a matching variant.
    ///
    /// The unit price is captured on the line at add time; later catalog price
    /// changes do not reach carts that already hold the variant.
    #[instrument(skip(self, input), fields(variant_id = %input.variant_id))]
    pub async fn add_item(
        &self,
        cart_id: Uuid,
        input: AddToCartInput,
    ) -> Result<CartWithItems, ServiceError> {
        input.validate()?;
        if input.unit_price < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "unit_price must not be negative".to_string(),
            ));
        }

        let txn = self.db.begin().await?;

        let cart = Cart::find_by_id(cart_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        if cart.status != cart::CartStatus::Active {
            return Err(ServiceError::InvalidOperation(
                "Cart is not active".to_string(),
            ));
        }

        let existing_item = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .filter(cart_item::Column::VariantId.eq(input.variant_id))
            .one(&txn)
            .await?;

        let now = Utc::now();
        if let Some(item) = existing_item {
            let quantity = item.quantity + input.quantity;
            let unit_price = item.unit_price;
            let mut item: cart_item::ActiveModel = item.into();
            item.quantity = Set(quantity);
            item.line_total = Set(unit_price * Decimal::from(quantity));
            item.updated_at = Set(now);
            item.update(&txn).await?;
        } else {
            cart_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                cart_id: Set(cart_id),
                variant_id: Set(input.variant_id),
                product_name: Set(input.product_name.clone()),
                quantity: Set(input.quantity),
                unit_price: Set(input.unit_price),
                line_total: Set(input.unit_price * Decimal::from(input.quantity)),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        self.recalculate_subtotal(&txn, cart_id).await?;
        txn.commit().await?;

        info!(
            "Added item to cart {}: variant {} x{}",
            cart_id, input.variant_id, input.quantity
        );
        self.get_cart(cart_id).await
    }

    async fn recalculate_subtotal(
        &self,
        conn: &impl sea_orm::ConnectionTrait,
        cart_id: Uuid,
    ) -> Result<CartModel, ServiceError> {
        let items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .all(conn)
            .await?;

        let subtotal: Decimal = items.iter().map(|item| item.line_total).sum();

        let mut cart: cart::ActiveModel = Cart::find_by_id(cart_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?
            .into();

        cart.subtotal = Set(subtotal);
        cart.updated_at = Set(Utc::now());

        debug!(cart_id = %cart_id, subtotal = %subtotal, "recalculated cart subtotal");
        Ok(cart.update(conn).await?)
    }
}

#[async_trait]
impl CartStore for CartService {
    #[instrument(skip(self))]
    async fn get_cart(&self, cart_id: Uuid) -> Result<CartWithItems, ServiceError> {
        let cart = Cart::find_by_id(cart_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        let items = cart
            .find_related(CartItem)
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        Ok(CartWithItems { cart, items })
    }

    #[instrument(skip(self))]
    async fn clear_cart(&self, cart_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        let removed = CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .exec(&txn)
            .await?
            .rows_affected;

        match Cart::find_by_id(cart_id).one(&txn).await? {
            Some(cart) => {
                let mut cart: cart::ActiveModel = cart.into();
                cart.subtotal = Set(Decimal::ZERO);
                cart.updated_at = Set(Utc::now());
                cart.update(&txn).await?;
            }
            None => debug!(cart_id = %cart_id, "clear requested for missing cart"),
        }

        txn.commit().await?;

        if removed > 0 {
            self.event_sender
                .send_or_log(Event::CartCleared(cart_id))
                .await;
        }

        info!("Cleared cart: {} ({} items removed)", cart_id, removed);
        Ok(())
    }
}

/// Input for creating a cart
#[derive(Debug, Default, Deserialize, Validate, ToSchema)]
pub struct CreateCartInput {
    pub customer_id: Option<Uuid>,
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
}

/// Input for adding item to cart
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct AddToCartInput {
    pub variant_id: Uuid,
    #[validate(length(min = 1, max = 255))]
    pub product_name: String,
    #[validate(range(min = 1, max = 10000))]
    pub quantity: i32,
    #[schema(value_type = String, example = "15.00")]
    pub unit_price: Decimal,
}

/// Cart with items
#[derive(Debug, Clone, Serialize)]
pub struct CartWithItems {
    pub cart: CartModel,
    pub items: Vec<cart_item::Model>,
}

impl CartWithItems {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sum of line totals; the stored `cart.subtotal` is a cache of this value.
    pub fn subtotal(&self) -> Decimal {
        self.items.iter().map(|item| item.line_total).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{establish_connection_with_config, run_migrations, DbConfig};
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    async fn service() -> (CartService, mpsc::Receiver<Event>) {
        let db = establish_connection_with_config(&DbConfig {
            url: "sqlite::memory:".into(),
            max_connections: 1,
            ..Default::default()
        })
        .await
        .unwrap();
        run_migrations(&db).await.unwrap();
        let (tx, rx) = mpsc::channel(16);
        (
            CartService::new(Arc::new(db), Arc::new(EventSender::new(tx)), "usd"),
            rx,
        )
    }

    fn item(variant_id: Uuid, quantity: i32, price: Decimal) -> AddToCartInput {
        AddToCartInput {
            variant_id,
            product_name: "Mug".into(),
            quantity,
            unit_price: price,
        }
    }

    #[tokio::test]
    async fn adding_same_variant_twice_merges_lines() {
        let (svc, _rx) = service().await;
        let cart = svc.create_cart(CreateCartInput::default()).await.unwrap();
        let variant = Uuid::new_v4();

        svc.add_item(cart.id, item(variant, 1, dec!(12.50)))
            .await
            .unwrap();
        let snapshot = svc
            .add_item(cart.id, item(variant, 2, dec!(12.50)))
            .await
            .unwrap();

        assert_eq!(snapshot.items.len(), 1);
        assert_eq!(snapshot.items[0].quantity, 3);
        assert_eq!(snapshot.subtotal().round_dp(2), dec!(37.50));
    }

    #[tokio::test]
    async fn clearing_twice_is_a_no_op() {
        let (svc, mut rx) = service().await;
        let cart = svc.create_cart(CreateCartInput::default()).await.unwrap();
        svc.add_item(cart.id, item(Uuid::new_v4(), 1, dec!(5.00)))
            .await
            .unwrap();

        svc.clear_cart(cart.id).await.unwrap();
        svc.clear_cart(cart.id).await.unwrap();

        assert!(svc.get_cart(cart.id).await.unwrap().is_empty());
        assert_eq!(rx.recv().await, Some(Event::CartCleared(cart.id)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_cart_is_not_found() {
        let (svc, _rx) = service().await;
        assert_matches!(
            svc.get_cart(Uuid::new_v4()).await,
            Err(ServiceError::NotFound(_))
        );
        svc.clear_cart(Uuid::new_v4()).await.unwrap();
    }

    #[test]
    fn add_input_rejects_zero_quantity() {
        assert!(item(Uuid::new_v4(), 0, dec!(1)).validate().is_err());
    }
}
