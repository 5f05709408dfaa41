// Checkout core
pub mod checkout;
pub mod payment_gateway;
pub mod pricing;

// Order management
pub mod orders;

// Carts
pub mod commerce;
