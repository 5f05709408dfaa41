pub mod carts;
pub mod checkout;
pub mod orders;

use crate::config::CheckoutConfig;
use crate::db::DbPool;
use crate::events::EventSender;
use crate::notifications::NotificationSink;
use crate::repositories::OrderRepository;
use crate::services::{
    checkout::CheckoutService,
    commerce::{CartService, CartStore},
    orders::OrderService,
    payment_gateway::PaymentGateway,
    pricing::PricingCalculator,
};
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub cart: Arc<CartService>,
    pub checkout: Arc<CheckoutService>,
    pub orders: Arc<OrderService>,
    pub order_repository: Arc<OrderRepository>,
}

impl AppServices {
    /// Wires the checkout against the given gateway and notification sink.
    ///
    /// The gateway and sink are injected so tests can swap in fakes while the
    /// cart and order storage stay on the real database.
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        order_repository: Arc<OrderRepository>,
        gateway: Arc<dyn PaymentGateway>,
        notifications: Arc<dyn NotificationSink>,
        checkout_config: CheckoutConfig,
    ) -> Self {
        let cart = Arc::new(CartService::new(
            db_pool,
            event_sender.clone(),
            checkout_config.currency.clone(),
        ));
        let cart_store: Arc<dyn CartStore> = cart.clone();

        let checkout = Arc::new(CheckoutService::new(
            cart_store,
            gateway,
            order_repository.clone(),
            notifications,
            PricingCalculator::new(checkout_config),
            event_sender.clone(),
        ));
        let orders = Arc::new(OrderService::new(order_repository.clone(), event_sender));

        Self {
            cart,
            checkout,
            orders,
            order_repository,
        }
    }
}
