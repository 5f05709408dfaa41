use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    errors::ServiceError,
    services::orders::{
        CancelOrderRequest, OrderListResponse, OrderResponse, OrderStatusView,
        PaymentHistoryResponse, ShipOrderRequest, UpdateOrderRequest,
    },
    ApiResponse, AppState,
};

#[derive(Debug, Deserialize, ToSchema, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListOrdersQuery {
    /// Page number (default: 1)
    #[serde(default = "default_page")]
    pub page: u64,
    /// Items per page (default: 20, max: 100)
    #[serde(default = "default_per_page")]
    pub per_page: u64,
}

fn default_page() -> u64 {
    1
}

fn default_per_page() -> u64 {
    20
}

/// List the caller's orders
#[utoipa::path(
    get,
    path = "/api/v1/orders",
    summary = "List orders",
    description = "Get a paginated list of the authenticated user's orders, newest first",
    params(ListOrdersQuery),
    responses(
        (status = 200, description = "Orders retrieved successfully", body = ApiResponse<OrderListResponse>,
            headers(("X-Request-Id" = String, description = "Unique request id"))
        ),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Query(query): Query<ListOrdersQuery>,
) -> Result<Json<ApiResponse<OrderListResponse>>, ServiceError> {
    let orders = state
        .services
        .orders
        .list_orders(&auth_user, query.page, query.per_page)
        .await?;
    Ok(Json(ApiResponse::success(orders)))
}

/// Get an order with its items
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    summary = "Get order",
    description = "Get an order by its ID. Guest orders are readable by ID; other orders only by their owner or an admin.",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order retrieved successfully", body = ApiResponse<OrderResponse>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security((), ("Bearer" = [])),
    tag = "orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    auth_user: Option<AuthUser>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    let order = state
        .services
        .orders
        .get_order(id, auth_user.as_ref())
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

/// Payment ledger of an order
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}/payment-history",
    summary = "Get payment history",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Payment history retrieved", body = ApiResponse<Vec<PaymentHistoryResponse>>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security((), ("Bearer" = [])),
    tag = "orders"
)]
pub async fn get_payment_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    auth_user: Option<AuthUser>,
) -> Result<Json<ApiResponse<Vec<PaymentHistoryResponse>>>, ServiceError> {
    let history = state
        .services
        .orders
        .get_payment_history(id, auth_user.as_ref())
        .await?;
    Ok(Json(ApiResponse::success(history)))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}/status",
    summary = "Get order status",
    description = "Order status, payment status and tracking information",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Status retrieved", body = ApiResponse<OrderStatusView>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security((), ("Bearer" = [])),
    tag = "orders"
)]
pub async fn get_order_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    auth_user: Option<AuthUser>,
) -> Result<Json<ApiResponse<OrderStatusView>>, ServiceError> {
    let status = state
        .services
        .orders
        .get_status(id, auth_user.as_ref())
        .await?;
    Ok(Json(ApiResponse::success(status)))
}

/// Cancel an order that has not shipped
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/cancel",
    summary = "Cancel order",
    description = "Cancels a pending, confirmed or processing order. Guests prove ownership with the checkout email.",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body(content = CancelOrderRequest, description = "Optional cancellation reason"),
    responses(
        (status = 200, description = "Order cancelled", body = ApiResponse<OrderStatusView>),
        (status = 400, description = "Order can no longer be cancelled", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order was modified concurrently", body = crate::errors::ErrorResponse),
    ),
    security((), ("Bearer" = [])),
    tag = "orders"
)]
pub async fn cancel_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    auth_user: Option<AuthUser>,
    request: Option<Json<CancelOrderRequest>>,
) -> Result<Json<ApiResponse<OrderStatusView>>, ServiceError> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let status = state
        .services
        .orders
        .cancel_order(id, auth_user.as_ref(), request)
        .await?;
    Ok(Json(ApiResponse::success(status)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/confirm",
    summary = "Confirm order",
    description = "Moves a pending order to confirmed. Admin only.",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order confirmed", body = ApiResponse<OrderStatusView>),
        (status = 400, description = "Invalid status transition", body = crate::errors::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "orders"
)]
pub async fn confirm_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    auth_user: AuthUser,
) -> Result<Json<ApiResponse<OrderStatusView>>, ServiceError> {
    let status = state.services.orders.confirm_order(id, &auth_user).await?;
    Ok(Json(ApiResponse::success(status)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/process",
    summary = "Start processing order",
    description = "Moves a confirmed order to processing. Admin only.",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order is processing", body = ApiResponse<OrderStatusView>),
        (status = 400, description = "Invalid status transition", body = crate::errors::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "orders"
)]
pub async fn process_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    auth_user: AuthUser,
) -> Result<Json<ApiResponse<OrderStatusView>>, ServiceError> {
    let status = state
        .services
        .orders
        .mark_processing(id, &auth_user)
        .await?;
    Ok(Json(ApiResponse::success(status)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/ship",
    summary = "Mark order shipped",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = ShipOrderRequest,
    responses(
        (status = 200, description = "Order shipped", body = ApiResponse<OrderStatusView>),
        (status = 400, description = "Invalid status transition or tracking data", body = crate::errors::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "orders"
)]
pub async fn ship_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    auth_user: AuthUser,
    Json(request): Json<ShipOrderRequest>,
) -> Result<Json<ApiResponse<OrderStatusView>>, ServiceError> {
    let status = state
        .services
        .orders
        .mark_shipped(id, &auth_user, request)
        .await?;
    Ok(Json(ApiResponse::success(status)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/deliver",
    summary = "Mark order delivered",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order delivered", body = ApiResponse<OrderStatusView>),
        (status = 400, description = "Invalid status transition", body = crate::errors::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "orders"
)]
pub async fn deliver_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    auth_user: AuthUser,
) -> Result<Json<ApiResponse<OrderStatusView>>, ServiceError> {
    let status = state
        .services
        .orders
        .mark_delivered(id, &auth_user)
        .await?;
    Ok(Json(ApiResponse::success(status)))
}

/// Update notes, priority and tags
#[utoipa::path(
    patch,
    path = "/api/v1/orders/{id}",
    summary = "Update order metadata",
    description = "Admin only. Fields left out of the body are not changed.",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = UpdateOrderRequest,
    responses(
        (status = 200, description = "Order updated", body = ApiResponse<OrderResponse>),
        (status = 400, description = "Nothing to update or invalid data", body = crate::errors::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "orders"
)]
pub async fn update_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    auth_user: AuthUser,
    Json(request): Json<UpdateOrderRequest>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    let order = state
        .services
        .orders
        .update_order(id, &auth_user, request)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}
