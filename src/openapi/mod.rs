use utoipa::{
    openapi::security::{Http, HttpAuthScheme, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront API",
        version = "1.0.0",
        description = r#"
# Storefront Checkout API

Turns a shopping cart into a paid, durable order.

## Checkout flow

1. `POST /api/v1/orders/create-payment-intent` prices the cart and returns a client secret together with `orderDetails`. No order exists yet.
2. Pay on the client with the payment SDK, or call `confirm-payment` to let the server attach and confirm the payment method.
3. `POST /api/v1/orders/confirm-after-payment` with the same `orderDetails` verifies the payment with the gateway and stores the order. Repeating the call returns the same order.

When the card needs authentication the server answers with `requiresAction: true` and the `clientSecret` to resume on the client.

## Authentication

Checkout endpoints accept guests. Authenticated callers send a JWT:

```
Authorization: Bearer <your-jwt-token>
```

A token that is present but invalid is rejected with 401.

## Idempotency

POST requests may carry an `Idempotency-Key` header. A successful response is stored and replayed for a repeated key.

## Error Handling

Errors share one shape:

```json
{
  "error": "Payment Required",
  "message": "Payment declined: Your card has insufficient funds.",
  "code": "card_declined",
  "request_id": "req-abc123xyz",
  "timestamp": "2024-01-01T00:00:00Z"
}
```
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "checkout", description = "Payment intents and order finalization"),
        (name = "orders", description = "Order lookup and fulfilment"),
        (name = "carts", description = "Cart helpers used to drive a checkout")
    ),
    paths(
        // Checkout
        crate::handlers::checkout::create_payment_intent,
        crate::handlers::checkout::confirm_after_payment,
        crate::handlers::checkout::confirm_payment,
        crate::handlers::checkout::attach_payment_method,
        crate::handlers::checkout::confirm_payment_only,

        // Orders
        crate::handlers::orders::list_orders,
        crate::handlers::orders::get_order,
        crate::handlers::orders::get_payment_history,
        crate::handlers::orders::get_order_status,
        crate::handlers::orders::cancel_order,
        crate::handlers::orders::confirm_order,
        crate::handlers::orders::process_order,
        crate::handlers::orders::ship_order,
        crate::handlers::orders::deliver_order,
        crate::handlers::orders::update_order,

        // Carts
        crate::handlers::carts::create_cart,
        crate::handlers::carts::get_cart,
        crate::handlers::carts::add_to_cart,
        crate::handlers::carts::clear_cart,
    ),
    components(
        schemas(
            crate::ResponseMeta,

            // Checkout types
            crate::services::checkout::CreateCheckoutInput,
            crate::services::checkout::OrderDraft,
            crate::services::checkout::CheckoutIdentity,
            crate::services::pricing::PriceBreakdown,
            crate::handlers::checkout::PaymentIntentResponse,
            crate::handlers::checkout::ConfirmAfterPaymentRequest,
            crate::handlers::checkout::ConfirmPaymentRequest,
            crate::handlers::checkout::ConfirmPaymentResponse,
            crate::handlers::checkout::PaymentMethodRequest,
            crate::handlers::checkout::PaymentActionResponse,

            // Order types
            crate::services::orders::OrderResponse,
            crate::services::orders::OrderItemResponse,
            crate::services::orders::OrderListResponse,
            crate::services::orders::OrderStatusView,
            crate::services::orders::PaymentHistoryResponse,
            crate::services::orders::CancelOrderRequest,
            crate::services::orders::ShipOrderRequest,
            crate::services::orders::UpdateOrderRequest,
            crate::entities::order::Address,
            crate::entities::order::GuestInfo,
            crate::entities::order::OrderStatus,
            crate::entities::order::PaymentStatus,
            crate::entities::order::OrderPriority,

            // Cart types
            crate::handlers::carts::CartResponse,
            crate::handlers::carts::CartItemResponse,
            crate::services::commerce::CreateCartInput,
            crate::services::commerce::AddToCartInput,

            // Error types
            crate::errors::ErrorResponse
        )
    )
)]
pub struct ApiDocV1;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "Bearer",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_lists_checkout_routes() {
        let openapi = ApiDocV1::openapi();
        let json = serde_json::to_string_pretty(&openapi).unwrap();
        assert!(json.contains("Storefront API"));
        assert!(json.contains("/api/v1/orders/create-payment-intent"));
        assert!(json.contains("/api/v1/orders/confirm-after-payment"));
        assert!(json.contains("/api/v1/orders/{id}/payment-history"));
        assert!(json.contains("\"Bearer\""));
    }
}
