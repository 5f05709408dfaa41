use axum::{extract::State, http::StatusCode, response::Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::AuthUser;
use crate::errors::ServiceError;
use crate::services::checkout::{
    CheckoutCaller, CheckoutResult, CreateCheckoutInput, FinalizedOrder, OrderDraft, PaymentAck,
};
use crate::services::orders::OrderResponse;
use crate::{ApiResponse, AppState};

/// Returned by `create-payment-intent`; no order exists yet.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntentResponse {
    /// Handed to the client-side payment SDK
    pub client_secret: String,
    pub payment_intent_id: String,
    /// Send back unchanged to finalize the order
    pub order_details: OrderDraft,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmAfterPaymentRequest {
    #[serde(alias = "payment_intent_id")]
    pub payment_intent_id: String,
    #[serde(alias = "order_details")]
    pub order_details: OrderDraft,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPaymentRequest {
    #[serde(alias = "payment_intent_id")]
    pub payment_intent_id: String,
    #[serde(alias = "payment_method_id")]
    pub payment_method_id: String,
    #[serde(alias = "order_details")]
    pub order_details: OrderDraft,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaymentMethodRequest {
    #[serde(alias = "payment_intent_id")]
    pub payment_intent_id: String,
    #[serde(alias = "payment_method_id")]
    pub payment_method_id: String,
}

/// Either the persisted order or the secret needed to finish authentication
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPaymentResponse {
    pub requires_action: bool,
    pub payment_intent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<OrderResponse>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaymentActionResponse {
    pub success: bool,
    pub message: String,
    pub payment_intent_id: String,
    /// Gateway status of the intent, e.g. `requires_confirmation` or `succeeded`
    pub status: String,
    pub requires_action: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

impl PaymentActionResponse {
    fn from_ack(ack: PaymentAck, message: &str) -> Self {
        let requires_action = ack.requires_action();
        Self {
            success: true,
            message: message.to_string(),
            payment_intent_id: ack.payment_intent_id,
            status: ack.status.as_str().to_string(),
            requires_action,
            client_secret: if requires_action {
                ack.client_secret
            } else {
                None
            },
        }
    }
}

fn caller_of(user: &Option<AuthUser>) -> Option<CheckoutCaller> {
    user.as_ref().map(CheckoutCaller::from)
}

fn order_status_code(finalized: &FinalizedOrder) -> StatusCode {
    if finalized.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    }
}

fn order_response(finalized: FinalizedOrder, viewer: &Option<AuthUser>) -> OrderResponse {
    let is_admin = viewer.as_ref().is_some_and(AuthUser::is_admin);
    OrderResponse::from_parts(finalized.order, finalized.items, is_admin)
}

/// Create a payment intent for a cart
#[utoipa::path(
    post,
    path = "/api/v1/orders/create-payment-intent",
    summary = "Start checkout",
    description = "Prices the cart and opens a payment intent for the total. No order is stored until the payment succeeds. Guests must send guest_info; authenticated callers send a bearer token.",
    request_body = CreateCheckoutInput,
    responses(
        (status = 200, description = "Payment intent created", body = ApiResponse<PaymentIntentResponse>,
            headers(("X-Request-Id" = String, description = "Unique request id"))
        ),
        (status = 400, description = "Cart is empty or the request is invalid", body = crate::errors::ErrorResponse),
        (status = 401, description = "Invalid bearer token", body = crate::errors::ErrorResponse),
        (status = 404, description = "Cart not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "The supplied payment intent has already been paid", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment gateway error", body = crate::errors::ErrorResponse),
        (status = 503, description = "Payment gateway unavailable", body = crate::errors::ErrorResponse),
    ),
    security((), ("Bearer" = [])),
    tag = "checkout"
)]
pub async fn create_payment_intent(
    State(state): State<AppState>,
    user: Option<AuthUser>,
    Json(request): Json<CreateCheckoutInput>,
) -> Result<Json<ApiResponse<PaymentIntentResponse>>, ServiceError> {
    let caller = caller_of(&user);
    let created = state
        .services
        .checkout
        .create_order(caller.as_ref(), request)
        .await?;

    Ok(Json(ApiResponse::success(PaymentIntentResponse {
        client_secret: created.client_secret,
        payment_intent_id: created.payment_intent_id,
        order_details: created.order_draft,
    })))
}

/// Persist the order for a payment that already succeeded client-side
#[utoipa::path(
    post,
    path = "/api/v1/orders/confirm-after-payment",
    summary = "Finalize order after payment",
    description = "Verifies with the payment gateway that the intent succeeded for the draft's amount and stores the order. Repeating the call for the same intent returns the same order.",
    request_body = ConfirmAfterPaymentRequest,
    responses(
        (status = 201, description = "Order created", body = ApiResponse<OrderResponse>),
        (status = 200, description = "Order already existed for this payment intent", body = ApiResponse<OrderResponse>),
        (status = 400, description = "Draft does not match the cart or the payment", body = crate::errors::ErrorResponse),
        (status = 402, description = "Payment has not succeeded", body = crate::errors::ErrorResponse),
        (status = 403, description = "Draft belongs to another user", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment gateway error", body = crate::errors::ErrorResponse),
    ),
    security((), ("Bearer" = [])),
    tag = "checkout"
)]
pub async fn confirm_after_payment(
    State(state): State<AppState>,
    user: Option<AuthUser>,
    Json(request): Json<ConfirmAfterPaymentRequest>,
) -> Result<(StatusCode, Json<ApiResponse<OrderResponse>>), ServiceError> {
    let caller = caller_of(&user);
    let finalized = state
        .services
        .checkout
        .confirm_order_after_payment(
            caller.as_ref(),
            &request.payment_intent_id,
            request.order_details,
        )
        .await?;

    let status = order_status_code(&finalized);
    Ok((
        status,
        Json(ApiResponse::success(order_response(finalized, &user))),
    ))
}

/// Attach, confirm and finalize in a single call
#[utoipa::path(
    post,
    path = "/api/v1/orders/confirm-payment",
    summary = "Pay and create order",
    description = "Attaches the payment method, confirms the intent and stores the order once the payment succeeds. When the card needs authentication the response carries requiresAction and the client secret instead of an order.",
    request_body = ConfirmPaymentRequest,
    responses(
        (status = 201, description = "Order created", body = ApiResponse<ConfirmPaymentResponse>),
        (status = 200, description = "Authentication required, or the order already existed", body = ApiResponse<ConfirmPaymentResponse>),
        (status = 400, description = "Invalid request", body = crate::errors::ErrorResponse),
        (status = 402, description = "Payment declined or failed", body = crate::errors::ErrorResponse),
        (status = 409, description = "Conflicting retry of a gateway request", body = crate::errors::ErrorResponse),
        (status = 503, description = "Payment gateway unavailable", body = crate::errors::ErrorResponse),
    ),
    security((), ("Bearer" = [])),
    tag = "checkout"
)]
pub async fn confirm_payment(
    State(state): State<AppState>,
    user: Option<AuthUser>,
    Json(request): Json<ConfirmPaymentRequest>,
) -> Result<(StatusCode, Json<ApiResponse<ConfirmPaymentResponse>>), ServiceError> {
    let caller = caller_of(&user);
    let result = state
        .services
        .checkout
        .confirm_payment_and_create_order(
            caller.as_ref(),
            &request.payment_intent_id,
            &request.payment_method_id,
            request.order_details,
        )
        .await?;

    let (status, body) = match result {
        CheckoutResult::Completed(finalized) => (
            order_status_code(&finalized),
            ConfirmPaymentResponse {
                requires_action: false,
                payment_intent_id: request.payment_intent_id,
                client_secret: None,
                order: Some(order_response(finalized, &user)),
            },
        ),
        CheckoutResult::RequiresAction {
            payment_intent_id,
            client_secret,
        } => (
            StatusCode::OK,
            ConfirmPaymentResponse {
                requires_action: true,
                payment_intent_id,
                client_secret,
                order: None,
            },
        ),
    };

    Ok((status, Json(ApiResponse::success(body))))
}

/// Attach a payment method to an intent
#[utoipa::path(
    post,
    path = "/api/v1/orders/attach-payment-method",
    summary = "Attach payment method",
    description = "Sets the payment method on the intent. Repeating the call with the same method succeeds.",
    request_body = PaymentMethodRequest,
    responses(
        (status = 200, description = "Payment method attached", body = ApiResponse<PaymentActionResponse>),
        (status = 400, description = "Invalid request", body = crate::errors::ErrorResponse),
        (status = 402, description = "Payment method rejected", body = crate::errors::ErrorResponse),
        (status = 503, description = "Payment gateway unavailable", body = crate::errors::ErrorResponse),
    ),
    security((), ("Bearer" = [])),
    tag = "checkout"
)]
pub async fn attach_payment_method(
    State(state): State<AppState>,
    Json(request): Json<PaymentMethodRequest>,
) -> Result<Json<ApiResponse<PaymentActionResponse>>, ServiceError> {
    let ack = state
        .services
        .checkout
        .attach_payment_method(&request.payment_intent_id, &request.payment_method_id)
        .await?;

    Ok(Json(ApiResponse::success(PaymentActionResponse::from_ack(
        ack,
        "Payment method attached",
    ))))
}

/// Confirm an intent without creating an order
#[utoipa::path(
    post,
    path = "/api/v1/orders/confirm-payment-only",
    summary = "Confirm payment",
    description = "Confirms the intent with the gateway and stores nothing. Follow up with confirm-after-payment to create the order.",
    request_body = PaymentMethodRequest,
    responses(
        (status = 200, description = "Payment confirmed or authentication required", body = ApiResponse<PaymentActionResponse>),
        (status = 400, description = "Invalid request", body = crate::errors::ErrorResponse),
        (status = 402, description = "Payment declined or failed", body = crate::errors::ErrorResponse),
        (status = 503, description = "Payment gateway unavailable", body = crate::errors::ErrorResponse),
    ),
    security((), ("Bearer" = [])),
    tag = "checkout"
)]
pub async fn confirm_payment_only(
    State(state): State<AppState>,
    Json(request): Json<PaymentMethodRequest>,
) -> Result<Json<ApiResponse<PaymentActionResponse>>, ServiceError> {
    let ack = state
        .services
        .checkout
        .confirm_payment_only(&request.payment_intent_id, &request.payment_method_id)
        .await?;

    let message = if ack.requires_action() {
        "Additional authentication required"
    } else {
        "Payment confirmed"
    };
    Ok(Json(ApiResponse::success(PaymentActionResponse::from_ack(
        ack, message,
    ))))
}
