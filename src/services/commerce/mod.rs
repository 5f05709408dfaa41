/// Commerce services module
pub mod cart_service;

pub use cart_service::{AddToCartInput, CartService, CartStore, CartWithItems, CreateCartInput};
#[cfg(test)]
pub use cart_service::MockCartStore;
