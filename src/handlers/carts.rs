use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    entities::commerce::{CartItemModel, CartModel, CartStatus},
    errors::ServiceError,
    services::commerce::{AddToCartInput, CartStore, CartWithItems, CreateCartInput},
    ApiResponse, AppState,
};

/// Creates the router for cart endpoints
pub fn carts_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_cart))
        .route("/:id", get(get_cart))
        .route("/:id/items", post(add_to_cart).delete(clear_cart))
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CartItemResponse {
    pub id: Uuid,
    pub variant_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    #[schema(value_type = String)]
    pub unit_price: Decimal,
    #[schema(value_type = String)]
    pub line_total: Decimal,
}

impl From<CartItemModel> for CartItemResponse {
    fn from(item: CartItemModel) -> Self {
        Self {
            id: item.id,
            variant_id: item.variant_id,
            product_name: item.product_name,
            quantity: item.quantity,
            unit_price: item.unit_price,
            line_total: item.line_total,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CartResponse {
    pub id: Uuid,
    pub customer_id: Option<Uuid>,
    pub currency: String,
    pub status: CartStatus,
    #[schema(value_type = String, example = "45.00")]
    pub subtotal: Decimal,
    pub items: Vec<CartItemResponse>,
    pub updated_at: DateTime<Utc>,
}

impl CartResponse {
    fn empty(cart: CartModel) -> Self {
        Self::from(CartWithItems {
            cart,
            items: Vec::new(),
        })
    }
}

impl From<CartWithItems> for CartResponse {
    fn from(value: CartWithItems) -> Self {
        let subtotal = value.subtotal().round_dp(2);
        Self {
            id: value.cart.id,
            customer_id: value.cart.customer_id,
            currency: value.cart.currency,
            status: value.cart.status,
            subtotal,
            items: value.items.into_iter().map(CartItemResponse::from).collect(),
            updated_at: value.cart.updated_at,
        }
    }
}

/// Create a new cart
#[utoipa::path(
    post,
    path = "/api/v1/carts",
    summary = "Create cart",
    request_body = CreateCartInput,
    responses(
        (status = 201, description = "Cart created", body = ApiResponse<CartResponse>),
        (status = 400, description = "Invalid request", body = crate::errors::ErrorResponse),
    ),
    tag = "carts"
)]
pub async fn create_cart(
    State(state): State<AppState>,
    Json(payload): Json<CreateCartInput>,
) -> Result<(StatusCode, Json<ApiResponse<CartResponse>>), ServiceError> {
    let cart = state.services.cart.create_cart(payload).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(CartResponse::empty(cart))),
    ))
}

/// Get cart with items
#[utoipa::path(
    get,
    path = "/api/v1/carts/{id}",
    summary = "Get cart",
    params(("id" = Uuid, Path, description = "Cart ID")),
    responses(
        (status = 200, description = "Cart retrieved", body = ApiResponse<CartResponse>),
        (status = 404, description = "Cart not found", body = crate::errors::ErrorResponse),
    ),
    tag = "carts"
)]
pub async fn get_cart(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<CartResponse>>, ServiceError> {
    let cart = state.services.cart.get_cart(id).await?;
    Ok(Json(ApiResponse::success(cart.into())))
}

/// Add item to cart
#[utoipa::path(
    post,
    path = "/api/v1/carts/{id}/items",
    summary = "Add item to cart",
    description = "Adds a line, or increases the quantity when the variant is already in the cart",
    params(("id" = Uuid, Path, description = "Cart ID")),
    request_body = AddToCartInput,
    responses(
        (status = 200, description = "Item added", body = ApiResponse<CartResponse>),
        (status = 400, description = "Invalid item", body = crate::errors::ErrorResponse),
        (status = 404, description = "Cart not found", body = crate::errors::ErrorResponse),
    ),
    tag = "carts"
)]
pub async fn add_to_cart(
    State(state): State<AppState>,
    Path(cart_id): Path<Uuid>,
    Json(payload): Json<AddToCartInput>,
) -> Result<Json<ApiResponse<CartResponse>>, ServiceError> {
    let cart = state.services.cart.add_item(cart_id, payload).await?;
    Ok(Json(ApiResponse::success(cart.into())))
}

/// Clear all items from cart
#[utoipa::path(
    delete,
    path = "/api/v1/carts/{id}/items",
    summary = "Clear cart",
    description = "Removes every item. Clearing an empty cart succeeds.",
    params(("id" = Uuid, Path, description = "Cart ID")),
    responses(
        (status = 204, description = "Cart cleared"),
    ),
    tag = "carts"
)]
pub async fn clear_cart(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ServiceError> {
    state.services.cart.clear_cart(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
