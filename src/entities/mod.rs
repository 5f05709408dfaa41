pub mod commerce;
pub mod order;
pub mod order_activity;
pub mod order_item;
pub mod payment_history;

pub use order::{Address, GuestInfo, OrderPriority, OrderStatus, OrderTags, PaymentStatus};
