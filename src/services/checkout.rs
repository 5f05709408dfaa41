//! Checkout orchestration: cart → payment intent → paid order.
//!
//! No order row is written until the gateway reports the intent as `succeeded`.
//! The only local write is [`OrderRepository::persist_paid_order`], which is
//! idempotent per payment intent. Everything after that commit (cart clear,
//! email, activity, events) is best effort.

use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::auth::AuthUser;
use crate::entities::order::{Address, GuestInfo, Model as OrderModel};
use crate::entities::order_item::Model as OrderItemModel;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::notifications::{EmailLine, NotificationSink, OrderConfirmationEmail};
use crate::repositories::{
    NewOrderItem, NewPaidOrder, NewPaymentRecord, OrderRepository, PersistOutcome,
};
use crate::services::commerce::{CartStore, CartWithItems};
use crate::services::payment_gateway::{
    ConfirmOutcome, CreateIntentRequest, GatewayError, IntentStatus, PaymentGateway,
    PaymentIntent,
};
use crate::services::pricing::{from_minor_units, to_minor_units, PriceBreakdown, PricingCalculator};

const CART_ID_METADATA: &str = "cart_id";

/// Upper bound on post-commit notifications; the order is already durable.
const DEFAULT_EFFECTS_TIMEOUT: Duration = Duration::from_secs(5);

/// Who is checking out, resolved once when the draft is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckoutIdentity {
    Authenticated {
        user_id: Uuid,
    },
    Guest {
        name: String,
        email: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phone: Option<String>,
    },
}

impl CheckoutIdentity {
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            CheckoutIdentity::Authenticated { user_id } => Some(*user_id),
            CheckoutIdentity::Guest { .. } => None,
        }
    }

    pub fn guest_info(&self) -> Option<GuestInfo> {
        match self {
            CheckoutIdentity::Guest { name, email, phone } => Some(GuestInfo {
                name: name.clone(),
                email: email.clone(),
                phone: phone.clone(),
            }),
            CheckoutIdentity::Authenticated { .. } => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            CheckoutIdentity::Authenticated { .. } => "authenticated",
            CheckoutIdentity::Guest { .. } => "guest",
        }
    }
}

/// Authenticated caller as seen by the checkout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutCaller {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub name: Option<String>,
}

impl From<&AuthUser> for CheckoutCaller {
    fn from(user: &AuthUser) -> Self {
        Self {
            user_id: user.user_id,
            email: user.email.clone(),
            name: user.name.clone(),
        }
    }
}

/// Priced snapshot of a checkout, handed to the client and sent back to finalize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate, ToSchema)]
pub struct OrderDraft {
    pub cart_id: Uuid,
    pub identity: CheckoutIdentity,
    #[validate]
    pub shipping_address: Address,
    #[validate]
    pub billing_address: Option<Address>,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
    #[schema(value_type = String, example = "45.00")]
    pub subtotal: Decimal,
    #[schema(value_type = String, example = "5.99")]
    pub shipping_cost: Decimal,
    #[schema(value_type = String, example = "4.34")]
    pub tax: Decimal,
    #[schema(value_type = String, example = "55.33")]
    pub total: Decimal,
    #[validate(length(equal = 3))]
    pub currency: String,
}

impl OrderDraft {
    pub fn breakdown(&self) -> PriceBreakdown {
        PriceBreakdown {
            subtotal: self.subtotal,
            shipping_cost: self.shipping_cost,
            tax: self.tax,
            total: self.total,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateCheckoutInput {
    pub cart_id: Uuid,
    #[validate]
    pub shipping_address: Address,
    #[validate]
    pub billing_address: Option<Address>,
    /// Required when the request carries no bearer token
    #[validate]
    pub guest_info: Option<GuestInfo>,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
    /// Intent from an earlier attempt; reused while it is still payable
    pub existing_payment_intent_id: Option<String>,
    /// Mixed into the gateway idempotency key
    #[validate(custom = "validate_client_key")]
    pub idempotency_key: Option<String>,
}

fn validate_client_key(key: &str) -> Result<(), ValidationError> {
    if key.is_empty() || key.len() > 128 || key.chars().any(|c| c.is_whitespace()) {
        return Err(ValidationError::new("invalid_idempotency_key"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedCheckout {
    pub client_secret: String,
    pub payment_intent_id: String,
    pub order_draft: OrderDraft,
}

/// Gateway state after an attach or confirm call
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentAck {
    pub payment_intent_id: String,
    pub status: IntentStatus,
    pub client_secret: Option<String>,
}

impl PaymentAck {
    fn from_intent(intent: &PaymentIntent) -> Self {
        Self {
            payment_intent_id: intent.id.clone(),
            status: intent.status,
            client_secret: intent.client_secret.clone(),
        }
    }

    pub fn requires_action(&self) -> bool {
        self.status == IntentStatus::RequiresAction
    }
}

/// A durable order produced by the checkout
#[derive(Debug, Clone)]
pub struct FinalizedOrder {
    pub order: OrderModel,
    pub items: Vec<OrderItemModel>,
    /// `false` when an earlier call already persisted this intent
    pub created: bool,
}

#[derive(Debug, Clone)]
pub enum CheckoutResult {
    Completed(FinalizedOrder),
    RequiresAction {
        payment_intent_id: String,
        client_secret: Option<String>,
    },
}

#[derive(Clone)]
pub struct CheckoutService {
    carts: Arc<dyn CartStore>,
    gateway: Arc<dyn PaymentGateway>,
    orders: Arc<OrderRepository>,
    notifications: Arc<dyn NotificationSink>,
    pricing: PricingCalculator,
    event_sender: Arc<EventSender>,
    effects_timeout: Duration,
}

impl CheckoutService {
    pub fn new(
        carts: Arc<dyn CartStore>,
        gateway: Arc<dyn PaymentGateway>,
        orders: Arc<OrderRepository>,
        notifications: Arc<dyn NotificationSink>,
        pricing: PricingCalculator,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            carts,
            gateway,
            orders,
            notifications,
            pricing,
            event_sender,
            effects_timeout: DEFAULT_EFFECTS_TIMEOUT,
        }
    }

    pub fn with_effects_timeout(mut self, timeout: Duration) -> Self {
        self.effects_timeout = timeout;
        self
    }

    /// Prices the cart and opens a payment intent for the total. Writes no order.
    #[instrument(skip(self, caller, input), fields(cart_id = %input.cart_id))]
    pub async fn create_order(
        &self,
        caller: Option<&CheckoutCaller>,
        input: CreateCheckoutInput,
    ) -> Result<CreatedCheckout, ServiceError> {
        input.validate()?;
        let identity = resolve_identity(caller, input.guest_info.clone())?;

        let cart = self.carts.get_cart(input.cart_id).await?;
        if cart.is_empty() {
            return Err(ServiceError::ValidationError(format!(
                "Cart {} is empty",
                input.cart_id
            )));
        }

        let breakdown = self.pricing.breakdown(cart.subtotal())?;
        let currency = cart.cart.currency.to_ascii_lowercase();
        let amount_minor = to_minor_units(breakdown.total, &currency)?;
        if amount_minor <= 0 {
            return Err(ServiceError::ValidationError(
                "Order total must be greater than zero".to_string(),
            ));
        }

        let draft = OrderDraft {
            cart_id: input.cart_id,
            identity,
            shipping_address: input.shipping_address,
            billing_address: input.billing_address,
            notes: input.notes,
            subtotal: breakdown.subtotal,
            shipping_cost: breakdown.shipping_cost,
            tax: breakdown.tax,
            total: breakdown.total,
            currency: currency.clone(),
        };

        let reusable = match &input.existing_payment_intent_id {
            Some(id) => self.reusable_intent(id, &draft, amount_minor).await?,
            None => None,
        };

        let intent = match reusable {
            Some(intent) => intent,
            None => {
                let request = CreateIntentRequest {
                    amount_minor,
                    currency: currency.clone(),
                    metadata: intent_metadata(&draft),
                    idempotency_key: intent_idempotency_key(
                        &cart,
                        amount_minor,
                        &currency,
                        input.idempotency_key.as_deref(),
                    ),
                    receipt_email: match &draft.identity {
                        CheckoutIdentity::Guest { email, .. } => Some(email.clone()),
                        CheckoutIdentity::Authenticated { .. } => caller.and_then(|c| c.email.clone()),
                    },
                };
                let intent = self.gateway.create_intent(request).await?;
                if intent.status == IntentStatus::Succeeded {
                    // idempotent replay of an intent that has since been paid
                    return Err(ServiceError::Conflict(format!(
                        "Payment intent {} has already been paid; finalize it with confirm-after-payment",
                        intent.id
                    )));
                }
                counter!("checkout.intents_created", 1);
                self.event_sender
                    .send_or_log(Event::PaymentIntentCreated {
                        payment_intent_id: intent.id.clone(),
                        cart_id: draft.cart_id,
                        amount: draft.total,
                        currency: currency.clone(),
                    })
                    .await;
                intent
            }
        };

        let client_secret = intent.client_secret.clone().ok_or_else(|| {
            ServiceError::ExternalServiceError(format!(
                "gateway returned no client secret for {}",
                intent.id
            ))
        })?;

        info!(
            payment_intent_id = %intent.id,
            cart_id = %draft.cart_id,
            total = %draft.total,
            currency = %currency,
            checkout = draft.identity.kind(),
            "Payment intent ready for checkout"
        );

        Ok(CreatedCheckout {
            client_secret,
            payment_intent_id: intent.id,
            order_draft: draft,
        })
    }

    async fn reusable_intent(
        &self,
        intent_id: &str,
        draft: &OrderDraft,
        amount_minor: i64,
    ) -> Result<Option<PaymentIntent>, ServiceError> {
        let intent = self.gateway.retrieve_intent(intent_id, false).await?;
        if intent.status == IntentStatus::Succeeded {
            return Err(ServiceError::Conflict(format!(
                "Payment intent {} has already been paid; finalize it with confirm-after-payment",
                intent.id
            )));
        }

        let same_cart = intent.metadata.get(CART_ID_METADATA) == Some(&draft.cart_id.to_string());
        if intent.status.is_payable()
            && same_cart
            && intent.amount == amount_minor
            && intent.currency.eq_ignore_ascii_case(&draft.currency)
        {
            debug!(payment_intent_id = %intent.id, "reusing existing payment intent");
            return Ok(Some(intent));
        }

        debug!(
            payment_intent_id = %intent.id,
            status = %intent.status,
            "existing payment intent not reusable, creating a new one"
        );
        Ok(None)
    }

    /// Sets the payment method on an intent. Safe to repeat.
    #[instrument(skip(self))]
    pub async fn attach_payment_method(
        &self,
        payment_intent_id: &str,
        payment_method_id: &str,
    ) -> Result<PaymentAck, ServiceError> {
        ensure_reference("paymentIntentId", payment_intent_id)?;
        ensure_reference("paymentMethodId", payment_method_id)?;

        let intent = self
            .gateway
            .attach_payment_method(payment_intent_id, payment_method_id)
            .await?;
        info!(payment_intent_id = %intent.id, status = %intent.status, "Payment method attached");
        Ok(PaymentAck::from_intent(&intent))
    }

    /// Confirms an intent without touching local state.
    ///
    /// `requires_action` is a normal outcome here; the ack carries the client secret.
    #[instrument(skip(self))]
    pub async fn confirm_payment_only(
        &self,
        payment_intent_id: &str,
        payment_method_id: &str,
    ) -> Result<PaymentAck, ServiceError> {
        ensure_reference("paymentIntentId", payment_intent_id)?;
        ensure_reference("paymentMethodId", payment_method_id)?;

        match self.confirm(payment_intent_id, payment_method_id).await? {
            ConfirmOutcome::Succeeded(intent) => {
                info!(payment_intent_id = %intent.id, "Payment confirmed");
                Ok(PaymentAck::from_intent(&intent))
            }
            ConfirmOutcome::RequiresAction {
                client_secret,
                intent,
            } => Ok(PaymentAck {
                payment_intent_id: intent.id,
                status: IntentStatus::RequiresAction,
                client_secret,
            }),
            ConfirmOutcome::Failed {
                reason,
                decline_code,
            } => Err(payment_failure(reason, decline_code)),
        }
    }

    /// Turns a succeeded payment intent into a durable order.
    ///
    /// Fails closed unless the gateway reports the intent as `succeeded` for the
    /// draft's amount, currency and cart. Calling it again for the same intent
    /// returns the order written the first time.
    #[instrument(skip(self, caller, draft), fields(payment_intent_id = %payment_intent_id, cart_id = %draft.cart_id))]
    pub async fn confirm_order_after_payment(
        &self,
        caller: Option<&CheckoutCaller>,
        payment_intent_id: &str,
        draft: OrderDraft,
    ) -> Result<FinalizedOrder, ServiceError> {
        ensure_reference("paymentIntentId", payment_intent_id)?;
        self.check_draft(caller, &draft)?;

        if let Some(existing) = self.already_persisted(payment_intent_id, &draft).await? {
            return Ok(existing);
        }

        let intent = self.gateway.retrieve_intent(payment_intent_id, true).await?;
        match intent.status {
            IntentStatus::Succeeded => self.finalize_charged(caller, intent, draft).await,
            IntentStatus::RequiresAction => Err(ServiceError::PaymentRequiresAction {
                client_secret: intent.client_secret,
            }),
            status => {
                warn!(payment_intent_id = %intent.id, status = %status, "refusing to create order for unpaid intent");
                Err(ServiceError::PaymentFailed(format!(
                    "Payment intent {} has not succeeded (status: {})",
                    intent.id, status
                )))
            }
        }
    }

    /// Attach, confirm and persist in one call.
    #[instrument(skip(self, caller, draft), fields(payment_intent_id = %payment_intent_id, cart_id = %draft.cart_id))]
    pub async fn confirm_payment_and_create_order(
        &self,
        caller: Option<&CheckoutCaller>,
        payment_intent_id: &str,
        payment_method_id: &str,
        draft: OrderDraft,
    ) -> Result<CheckoutResult, ServiceError> {
        ensure_reference("paymentIntentId", payment_intent_id)?;
        ensure_reference("paymentMethodId", payment_method_id)?;
        self.check_draft(caller, &draft)?;

        if let Some(existing) = self.already_persisted(payment_intent_id, &draft).await? {
            return Ok(CheckoutResult::Completed(existing));
        }

        // every check that can refuse the order runs before the card is charged
        let attached = self
            .gateway
            .attach_payment_method(payment_intent_id, payment_method_id)
            .await?;
        verify_intent_matches_draft(&attached, &draft)?;
        if self.checkout_cart(draft.cart_id).await?.is_none() {
            if let Some(existing) = self.already_persisted(payment_intent_id, &draft).await? {
                return Ok(CheckoutResult::Completed(existing));
            }
            return Err(empty_cart(draft.cart_id));
        }

        match self.confirm(payment_intent_id, payment_method_id).await? {
            ConfirmOutcome::Succeeded(intent) => Ok(CheckoutResult::Completed(
                self.finalize_charged(caller, intent, draft).await?,
            )),
            ConfirmOutcome::RequiresAction {
                client_secret,
                intent,
            } => Ok(CheckoutResult::RequiresAction {
                payment_intent_id: intent.id,
                client_secret,
            }),
            ConfirmOutcome::Failed {
                reason,
                decline_code,
            } => Err(payment_failure(reason, decline_code)),
        }
    }

    async fn confirm(
        &self,
        payment_intent_id: &str,
        payment_method_id: &str,
    ) -> Result<ConfirmOutcome, ServiceError> {
        let result = self
            .gateway
            .confirm_intent(payment_intent_id, payment_method_id)
            .await;

        let outcome = match result {
            Err(GatewayError::AuthenticationRequired { client_secret }) => {
                let intent = self.gateway.retrieve_intent(payment_intent_id, false).await?;
                ConfirmOutcome::RequiresAction {
                    client_secret: client_secret.or_else(|| intent.client_secret.clone()),
                    intent,
                }
            }
            other => ConfirmOutcome::from_result(other)?,
        };

        match &outcome {
            ConfirmOutcome::RequiresAction { .. } => {
                counter!("checkout.requires_action", 1);
                info!(payment_intent_id = %payment_intent_id, "Payment requires customer action");
                self.event_sender
                    .send_or_log(Event::PaymentRequiresAction {
                        payment_intent_id: payment_intent_id.to_string(),
                    })
                    .await;
            }
            ConfirmOutcome::Failed { reason, .. } => {
                counter!("checkout.payment_failures", 1);
                warn!(payment_intent_id = %payment_intent_id, reason = %reason, "Payment confirmation failed");
                self.event_sender
                    .send_or_log(Event::PaymentFailed {
                        payment_intent_id: payment_intent_id.to_string(),
                        reason: reason.clone(),
                    })
                    .await;
            }
            ConfirmOutcome::Succeeded(_) => {}
        }

        Ok(outcome)
    }

    /// Draft checks that need no I/O: shape, pricing and identity.
    fn check_draft(
        &self,
        caller: Option<&CheckoutCaller>,
        draft: &OrderDraft,
    ) -> Result<(), ServiceError> {
        draft.validate()?;

        let expected = self.pricing.breakdown(draft.subtotal)?;
        if !same_amounts(&expected, &draft.breakdown()) {
            return Err(ServiceError::ValidationError(
                "Order details do not match checkout pricing".to_string(),
            ));
        }

        match &draft.identity {
            CheckoutIdentity::Authenticated { user_id } => match caller {
                Some(c) if c.user_id == *user_id => Ok(()),
                Some(_) => Err(ServiceError::Forbidden(
                    "Checkout belongs to another user".to_string(),
                )),
                None => Err(ServiceError::Unauthorized(
                    "Sign in to complete this checkout".to_string(),
                )),
            },
            CheckoutIdentity::Guest { email, .. } => {
                if email.trim().is_empty() {
                    return Err(ServiceError::ValidationError(
                        "Guest checkout requires an email".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    async fn already_persisted(
        &self,
        payment_intent_id: &str,
        draft: &OrderDraft,
    ) -> Result<Option<FinalizedOrder>, ServiceError> {
        let Some(order) = self.orders.find_by_payment_intent(payment_intent_id).await? else {
            return Ok(None);
        };
        ensure_same_owner(&order, &draft.identity)?;

        counter!("checkout.duplicate_confirmations", 1);
        info!(order_id = %order.id, payment_intent_id = %payment_intent_id, "Order already exists for payment intent");
        let items = self.orders.find_items(order.id).await?;
        Ok(Some(FinalizedOrder {
            order,
            items,
            created: false,
        }))
    }

    /// The draft's cart when it still holds lines; `None` when it is empty or gone.
    async fn checkout_cart(&self, cart_id: Uuid) -> Result<Option<CartWithItems>, ServiceError> {
        match self.carts.get_cart(cart_id).await {
            Ok(cart) => Ok(Some(cart).filter(|c| !c.is_empty())),
            Err(ServiceError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// [`Self::finalize`] for an intent that has been charged: any failure leaves
    /// money taken without an order, so it is reported for reconciliation.
    async fn finalize_charged(
        &self,
        caller: Option<&CheckoutCaller>,
        intent: PaymentIntent,
        draft: OrderDraft,
    ) -> Result<FinalizedOrder, ServiceError> {
        let payment_intent_id = intent.id.clone();
        let amount = intent.amount;
        let currency = intent.currency.clone();
        let cart_id = draft.cart_id;

        self.finalize(caller, intent, draft).await.map_err(|e| {
            counter!("checkout.persist_after_charge_failed", 1);
            error!(
                payment_intent_id = %payment_intent_id,
                amount,
                currency = %currency,
                cart_id = %cart_id,
                error = %e,
                "Payment succeeded but order could not be persisted; manual reconciliation required"
            );
            e
        })
    }

    async fn finalize(
        &self,
        caller: Option<&CheckoutCaller>,
        intent: PaymentIntent,
        draft: OrderDraft,
    ) -> Result<FinalizedOrder, ServiceError> {
        verify_intent_matches_draft(&intent, &draft)?;

        let Some(cart) = self.checkout_cart(draft.cart_id).await? else {
            // a concurrent confirmation may have committed and cleared the cart
            if let Some(existing) = self.already_persisted(&intent.id, &draft).await? {
                return Ok(existing);
            }
            return Err(empty_cart(draft.cart_id));
        };

        let live_subtotal = cart.subtotal().round_dp(2);
        if live_subtotal != draft.subtotal.round_dp(2) {
            warn!(
                cart_id = %draft.cart_id,
                draft_subtotal = %draft.subtotal,
                cart_subtotal = %live_subtotal,
                "cart changed after payment intent was created; recording the charged amount"
            );
        }

        let charge = intent.charge_details();
        let new_order = NewPaidOrder {
            order_number: generate_order_number(),
            user_id: draft.identity.user_id(),
            guest_info: draft.identity.guest_info(),
            shipping_address: draft.shipping_address.clone(),
            billing_address: draft.billing_address.clone(),
            subtotal: draft.subtotal,
            shipping_cost: draft.shipping_cost,
            tax: draft.tax,
            total: draft.total,
            currency: draft.currency.clone(),
            payment_intent_id: intent.id.clone(),
            notes: draft.notes.clone(),
            items: cart
                .items
                .iter()
                .map(|item| NewOrderItem {
                    variant_id: item.variant_id,
                    product_name: item.product_name.clone(),
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                })
                .collect(),
            payment: NewPaymentRecord {
                amount: from_minor_units(intent.amount, &intent.currency),
                currency: intent.currency.to_ascii_lowercase(),
                status: intent.status.as_str().to_string(),
                payment_method_type: charge.payment_method_type.clone(),
                card_brand: charge.card_brand.clone(),
                card_last4: charge.card_last4.clone(),
                receipt_url: charge.receipt_url.clone(),
            },
        };

        let order = match self.orders.persist_paid_order(new_order).await? {
            PersistOutcome::Created(order) => order,
            PersistOutcome::AlreadyExists(order) => {
                ensure_same_owner(&order, &draft.identity)?;
                counter!("checkout.duplicate_confirmations", 1);
                info!(order_id = %order.id, payment_intent_id = %intent.id, "Concurrent confirmation already persisted order");
                let items = self.orders.find_items(order.id).await?;
                return Ok(FinalizedOrder {
                    order,
                    items,
                    created: false,
                });
            }
        };

        counter!("checkout.orders_created", 1);
        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            payment_intent_id = %intent.id,
            total = %order.total,
            "Order created from payment intent"
        );

        let items = self.orders.find_items(order.id).await?;
        self.after_commit(caller, &order, &items, &draft, charge.receipt_url)
            .await;

        Ok(FinalizedOrder {
            order,
            items,
            created: true,
        })
    }

    /// Side effects of a committed order. Failures are logged, never returned.
    async fn after_commit(
        &self,
        caller: Option<&CheckoutCaller>,
        order: &OrderModel,
        items: &[OrderItemModel],
        draft: &OrderDraft,
        receipt_url: Option<String>,
    ) {
        match tokio::time::timeout(self.effects_timeout, self.carts.clear_cart(draft.cart_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(order_id = %order.id, cart_id = %draft.cart_id, error = %e, "failed to clear cart after checkout");
            }
            Err(_) => {
                warn!(order_id = %order.id, cart_id = %draft.cart_id, "timed out clearing cart after checkout");
            }
        }

        let actor_id = draft.identity.user_id();
        let email = confirmation_email(caller, order, items, draft, receipt_url);
        let notify = async {
            if let Err(e) = self
                .notifications
                .log_activity(order.id, "order_created", actor_id)
                .await
            {
                warn!(order_id = %order.id, error = %e, "failed to log order activity");
            }

            match email {
                Some(email) => {
                    if let Err(e) = self.notifications.send_order_confirmation(email).await {
                        warn!(order_id = %order.id, error = %e, "failed to send order confirmation");
                    }
                }
                None => debug!(order_id = %order.id, "no email address for order confirmation"),
            }
        };
        if tokio::time::timeout(self.effects_timeout, notify).await.is_err() {
            warn!(
                order_id = %order.id,
                timeout_ms = self.effects_timeout.as_millis() as u64,
                "order notifications timed out"
            );
        }

        self.event_sender
            .send_or_log(Event::OrderCreated {
                order_id: order.id,
                payment_intent_id: order.payment_intent_id.clone(),
                total: order.total,
            })
            .await;
    }
}

fn resolve_identity(
    caller: Option<&CheckoutCaller>,
    guest_info: Option<GuestInfo>,
) -> Result<CheckoutIdentity, ServiceError> {
    match (caller, guest_info) {
        (Some(caller), _) => Ok(CheckoutIdentity::Authenticated {
            user_id: caller.user_id,
        }),
        (None, Some(guest)) => Ok(CheckoutIdentity::Guest {
            name: guest.name,
            email: guest.email.to_ascii_lowercase(),
            phone: guest.phone,
        }),
        (None, None) => Err(ServiceError::ValidationError(
            "guest_info is required for guest checkout".to_string(),
        )),
    }
}

fn empty_cart(cart_id: Uuid) -> ServiceError {
    ServiceError::ValidationError(format!("Cart {} is empty or no longer exists", cart_id))
}

fn ensure_reference(field: &str, value: &str) -> Result<(), ServiceError> {
    if value.trim().is_empty() || value.len() > 255 {
        return Err(ServiceError::ValidationError(format!(
            "{} must be a non-empty gateway reference",
            field
        )));
    }
    Ok(())
}

fn ensure_same_owner(order: &OrderModel, identity: &CheckoutIdentity) -> Result<(), ServiceError> {
    let owned = match identity {
        CheckoutIdentity::Authenticated { user_id } => order.user_id == Some(*user_id),
        CheckoutIdentity::Guest { email, .. } => order
            .guest_info
            .as_ref()
            .is_some_and(|g| g.email.eq_ignore_ascii_case(email)),
    };
    if owned {
        Ok(())
    } else {
        Err(ServiceError::Forbidden(
            "Payment intent belongs to another checkout".to_string(),
        ))
    }
}

fn same_amounts(a: &PriceBreakdown, b: &PriceBreakdown) -> bool {
    a.subtotal.round_dp(2) == b.subtotal.round_dp(2)
        && a.shipping_cost.round_dp(2) == b.shipping_cost.round_dp(2)
        && a.tax.round_dp(2) == b.tax.round_dp(2)
        && a.total.round_dp(2) == b.total.round_dp(2)
}

fn verify_intent_matches_draft(intent: &PaymentIntent, draft: &OrderDraft) -> Result<(), ServiceError> {
    let expected_minor = to_minor_units(draft.total, &draft.currency)?;
    let cart_matches = intent.metadata.get(CART_ID_METADATA) == Some(&draft.cart_id.to_string());

    if intent.amount != expected_minor
        || !intent.currency.eq_ignore_ascii_case(&draft.currency)
        || !cart_matches
    {
        warn!(
            payment_intent_id = %intent.id,
            intent_amount = intent.amount,
            intent_currency = %intent.currency,
            draft_amount = expected_minor,
            draft_currency = %draft.currency,
            cart_matches,
            "payment intent does not match order details"
        );
        return Err(ServiceError::InvalidOperation(format!(
            "Payment intent {} does not match this checkout",
            intent.id
        )));
    }
    Ok(())
}

fn intent_metadata(draft: &OrderDraft) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    metadata.insert(CART_ID_METADATA.to_string(), draft.cart_id.to_string());
    metadata.insert("checkout".to_string(), draft.identity.kind().to_string());
    if let Some(user_id) = draft.identity.user_id() {
        metadata.insert("user_id".to_string(), user_id.to_string());
    }
    metadata
}

/// `checkout:{cart_id}:{cart_revision}:{amount_minor}:{currency}[:{client_key}]`
fn intent_idempotency_key(
    cart: &CartWithItems,
    amount_minor: i64,
    currency: &str,
    client_key: Option<&str>,
) -> String {
    let mut key = format!(
        "checkout:{}:{}:{}:{}",
        cart.cart.id,
        cart.cart.updated_at.timestamp_millis(),
        amount_minor,
        currency
    );
    if let Some(k) = client_key {
        key.push(':');
        key.push_str(k);
    }
    key
}

fn generate_order_number() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "ORD-{}-{}",
        Utc::now().format("%Y%m%d"),
        suffix[..10].to_ascii_uppercase()
    )
}

fn payment_failure(reason: String, decline_code: Option<String>) -> ServiceError {
    match decline_code {
        Some(code) => ServiceError::PaymentDeclined {
            code: Some("card_declined".to_string()),
            decline_code: Some(code),
            message: reason,
        },
        None => ServiceError::PaymentFailed(reason),
    }
}

fn confirmation_email(
    caller: Option<&CheckoutCaller>,
    order: &OrderModel,
    items: &[OrderItemModel],
    draft: &OrderDraft,
    receipt_url: Option<String>,
) -> Option<OrderConfirmationEmail> {
    let (to_email, customer_name) = match &draft.identity {
        CheckoutIdentity::Guest { name, email, .. } => (email.clone(), name.clone()),
        CheckoutIdentity::Authenticated { .. } => {
            let caller = caller?;
            (
                caller.email.clone()?,
                caller
                    .name
                    .clone()
                    .unwrap_or_else(|| draft.shipping_address.name.clone()),
            )
        }
    };

    Some(OrderConfirmationEmail {
        order_id: order.id,
        order_number: order.order_number.clone(),
        to_email,
        customer_name,
        is_guest: order.is_guest,
        subtotal: order.subtotal,
        shipping_cost: order.shipping_cost,
        tax: order.tax,
        total: order.total,
        currency: order.currency.clone(),
        items: items
            .iter()
            .map(|item| EmailLine {
                product_name: item.product_name.clone(),
                quantity: item.quantity,
                unit_price: item.unit_price,
            })
            .collect(),
        shipping_address: order.shipping_address.clone(),
        receipt_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckoutConfig;
    use crate::db::{establish_connection_with_config, run_migrations, DbConfig};
    use crate::entities::commerce::{cart, cart_item, CartStatus};
    use crate::notifications::MockNotificationSink;
    use crate::services::commerce::MockCartStore;
    use crate::services::payment_gateway::MockPaymentGateway;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    async fn orders() -> Arc<OrderRepository> {
        let db = establish_connection_with_config(&DbConfig {
            url: "sqlite::memory:".into(),
            max_connections: 1,
            ..Default::default()
        })
        .await
        .unwrap();
        run_migrations(&db).await.unwrap();
        Arc::new(OrderRepository::new(Arc::new(db)))
    }

    async fn service(
        carts: MockCartStore,
        gateway: MockPaymentGateway,
        sink: MockNotificationSink,
    ) -> CheckoutService {
        // events are dropped with a warning once the receiver is gone
        let (tx, _) = mpsc::channel(64);
        CheckoutService::new(
            Arc::new(carts),
            Arc::new(gateway),
            orders().await,
            Arc::new(sink),
            PricingCalculator::new(CheckoutConfig::default()),
            Arc::new(EventSender::new(tx)),
        )
    }

    fn cart_with(cart_id: Uuid, lines: &[(i32, Decimal)]) -> CartWithItems {
        let now = Utc::now();
        let items: Vec<cart_item::Model> = lines
            .iter()
            .map(|(qty, price)| cart_item::Model {
                id: Uuid::new_v4(),
                cart_id,
                variant_id: Uuid::new_v4(),
                product_name: "Notebook".into(),
                quantity: *qty,
                unit_price: *price,
                line_total: *price * Decimal::from(*qty),
                created_at: now,
                updated_at: now,
            })
            .collect();
        CartWithItems {
            cart: cart::Model {
                id: cart_id,
                customer_id: None,
                currency: "usd".into(),
                subtotal: items.iter().map(|i| i.line_total).sum(),
                status: CartStatus::Active,
                created_at: now,
                updated_at: now,
            },
            items,
        }
    }

    fn address() -> Address {
        Address {
            name: "Grace Hopper".into(),
            line1: "1 Navy Yard".into(),
            line2: None,
            city: "Arlington".into(),
            state: Some("VA".into()),
            postal_code: "22202".into(),
            country: "US".into(),
            phone: None,
        }
    }

    fn guest_input(cart_id: Uuid) -> CreateCheckoutInput {
        CreateCheckoutInput {
            cart_id,
            shipping_address: address(),
            billing_address: None,
            guest_info: Some(GuestInfo {
                name: "Grace".into(),
                email: "Grace@Example.com".into(),
                phone: None,
            }),
            notes: None,
            existing_payment_intent_id: None,
            idempotency_key: None,
        }
    }

    fn intent(id: &str, status: IntentStatus, amount: i64, cart_id: Uuid) -> PaymentIntent {
        PaymentIntent {
            id: id.into(),
            status,
            amount,
            currency: "usd".into(),
            client_secret: Some(format!("{}_secret", id)),
            payment_method: None,
            metadata: HashMap::from([(CART_ID_METADATA.to_string(), cart_id.to_string())]),
            latest_charge: None,
            last_payment_error: None,
        }
    }

    fn guest_draft(cart_id: Uuid) -> OrderDraft {
        OrderDraft {
            cart_id,
            identity: CheckoutIdentity::Guest {
                name: "Grace".into(),
                email: "grace@example.com".into(),
                phone: None,
            },
            shipping_address: address(),
            billing_address: None,
            notes: None,
            subtotal: dec!(45.00),
            shipping_cost: dec!(5.99),
            tax: dec!(4.34),
            total: dec!(55.33),
            currency: "usd".into(),
        }
    }

    #[tokio::test]
    async fn empty_cart_never_reaches_gateway() {
        let cart_id = Uuid::new_v4();
        let mut carts = MockCartStore::new();
        carts
            .expect_get_cart()
            .returning(move |_| Ok(cart_with(cart_id, &[])));
        let gateway = MockPaymentGateway::new();

        let svc = service(carts, gateway, MockNotificationSink::new()).await;
        let err = svc.create_order(None, guest_input(cart_id)).await.unwrap_err();
        assert_matches!(err, ServiceError::ValidationError(_));
    }

    #[tokio::test]
    async fn guest_checkout_requires_contact_info() {
        let mut input = guest_input(Uuid::new_v4());
        input.guest_info = None;

        let svc = service(
            MockCartStore::new(),
            MockPaymentGateway::new(),
            MockNotificationSink::new(),
        )
        .await;
        let err = svc.create_order(None, input).await.unwrap_err();
        assert_matches!(err, ServiceError::ValidationError(_));
    }

    #[tokio::test]
    async fn create_order_charges_priced_total_and_writes_nothing() {
        let cart_id = Uuid::new_v4();
        let mut carts = MockCartStore::new();
        carts
            .expect_get_cart()
            .returning(move |_| Ok(cart_with(cart_id, &[(3, dec!(15.00))])));

        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_create_intent()
            .withf(move |req| {
                req.amount_minor == 5533
                    && req.currency == "usd"
                    && req.idempotency_key.starts_with(&format!("checkout:{}:", cart_id))
                    && req.metadata.get("cart_id") == Some(&cart_id.to_string())
                    && req.receipt_email.as_deref() == Some("grace@example.com")
            })
            .times(1)
            .returning(move |_| {
                Ok(intent(
                    "pi_new",
                    IntentStatus::RequiresPaymentMethod,
                    5533,
                    cart_id,
                ))
            });

        let svc = service(carts, gateway, MockNotificationSink::new()).await;
        let created = svc.create_order(None, guest_input(cart_id)).await.unwrap();

        assert_eq!(created.payment_intent_id, "pi_new");
        assert_eq!(created.client_secret, "pi_new_secret");
        assert_eq!(created.order_draft.total, dec!(55.33));
        assert_eq!(created.order_draft.tax, dec!(4.34));
        assert!(svc
            .orders
            .find_by_payment_intent("pi_new")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn payable_existing_intent_is_reused() {
        let cart_id = Uuid::new_v4();
        let mut carts = MockCartStore::new();
        carts
            .expect_get_cart()
            .returning(move |_| Ok(cart_with(cart_id, &[(3, dec!(15.00))])));

        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_retrieve_intent()
            .returning(move |id, _| {
                Ok(intent(id, IntentStatus::RequiresPaymentMethod, 5533, cart_id))
            });
        gateway.expect_create_intent().never();

        let svc = service(carts, gateway, MockNotificationSink::new()).await;
        let mut input = guest_input(cart_id);
        input.existing_payment_intent_id = Some("pi_old".into());
        let created = svc.create_order(None, input).await.unwrap();
        assert_eq!(created.payment_intent_id, "pi_old");
    }

    #[tokio::test]
    async fn unpaid_intent_is_refused_without_writes() {
        let cart_id = Uuid::new_v4();
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_retrieve_intent()
            .returning(move |id, _| Ok(intent(id, IntentStatus::RequiresAction, 5533, cart_id)));

        let svc = service(MockCartStore::new(), gateway, MockNotificationSink::new()).await;
        let err = svc
            .confirm_order_after_payment(None, "pi_3ds", guest_draft(cart_id))
            .await
            .unwrap_err();

        assert_matches!(err, ServiceError::PaymentRequiresAction { client_secret: Some(_) });
        assert!(svc
            .orders
            .find_by_payment_intent("pi_3ds")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn tampered_draft_is_rejected_before_gateway() {
        let mut draft = guest_draft(Uuid::new_v4());
        draft.tax = dec!(0.01);
        draft.total = dec!(51.00);

        let svc = service(
            MockCartStore::new(),
            MockPaymentGateway::new(),
            MockNotificationSink::new(),
        )
        .await;
        let err = svc
            .confirm_order_after_payment(None, "pi_x", draft)
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::ValidationError(_));
    }

    #[tokio::test]
    async fn authenticated_draft_needs_the_same_user() {
        let mut draft = guest_draft(Uuid::new_v4());
        draft.identity = CheckoutIdentity::Authenticated {
            user_id: Uuid::new_v4(),
        };
        let stranger = CheckoutCaller {
            user_id: Uuid::new_v4(),
            email: None,
            name: None,
        };

        let svc = service(
            MockCartStore::new(),
            MockPaymentGateway::new(),
            MockNotificationSink::new(),
        )
        .await;
        let err = svc
            .confirm_order_after_payment(Some(&stranger), "pi_x", draft.clone())
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::Forbidden(_));

        let err = svc
            .confirm_order_after_payment(None, "pi_x", draft)
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::Unauthorized(_));
    }

    #[tokio::test]
    async fn amount_mismatch_fails_closed() {
        let cart_id = Uuid::new_v4();
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_retrieve_intent()
            .returning(move |id, _| Ok(intent(id, IntentStatus::Succeeded, 100, cart_id)));

        let svc = service(MockCartStore::new(), gateway, MockNotificationSink::new()).await;
        let err = svc
            .confirm_order_after_payment(None, "pi_cheap", guest_draft(cart_id))
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::InvalidOperation(_));
    }

    #[tokio::test]
    async fn post_commit_failures_do_not_fail_checkout() {
        let cart_id = Uuid::new_v4();
        let mut carts = MockCartStore::new();
        carts
            .expect_get_cart()
            .returning(move |_| Ok(cart_with(cart_id, &[(3, dec!(15.00))])));
        carts
            .expect_clear_cart()
            .times(1)
            .returning(|_| Err(ServiceError::InternalError("cart store down".into())));

        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_retrieve_intent()
            .returning(move |id, _| Ok(intent(id, IntentStatus::Succeeded, 5533, cart_id)));

        let mut sink = MockNotificationSink::new();
        sink.expect_log_activity().times(1).returning(|_, _, _| {
            Err(crate::notifications::NotificationError::ActivityLog(
                "down".into(),
            ))
        });
        sink.expect_send_order_confirmation()
            .withf(|email| email.to_email == "grace@example.com" && email.is_guest)
            .times(1)
            .returning(|_| {
                Err(crate::notifications::NotificationError::ActivityLog(
                    "mailer down".into(),
                ))
            });

        let svc = service(carts, gateway, sink).await;
        let finalized = svc
            .confirm_order_after_payment(None, "pi_paid", guest_draft(cart_id))
            .await
            .unwrap();

        assert!(finalized.created);
        assert!(finalized.order.is_guest);
        assert_eq!(finalized.items.len(), 1);
        assert_eq!(finalized.order.total.round_dp(2), dec!(55.33));
    }

    #[tokio::test]
    async fn intent_for_another_checkout_is_never_charged() {
        let cart_id = Uuid::new_v4();
        let other_cart = Uuid::new_v4();
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_attach_payment_method()
            .times(1)
            .returning(move |id, _| {
                Ok(intent(id, IntentStatus::RequiresConfirmation, 5858, other_cart))
            });
        gateway.expect_confirm_intent().never();

        let svc = service(MockCartStore::new(), gateway, MockNotificationSink::new()).await;
        let err = svc
            .confirm_payment_and_create_order(None, "pi_other", "pm_card_visa", guest_draft(cart_id))
            .await
            .unwrap_err();

        assert_matches!(err, ServiceError::InvalidOperation(_));
        assert!(svc
            .orders
            .find_by_payment_intent("pi_other")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn emptied_cart_is_refused_before_charging() {
        let cart_id = Uuid::new_v4();
        let mut carts = MockCartStore::new();
        carts
            .expect_get_cart()
            .returning(move |_| Ok(cart_with(cart_id, &[])));
        let mut gateway = MockPaymentGateway::new();
        gateway.expect_attach_payment_method().returning(move |id, _| {
            Ok(intent(id, IntentStatus::RequiresConfirmation, 5533, cart_id))
        });
        gateway.expect_confirm_intent().never();

        let svc = service(carts, gateway, MockNotificationSink::new()).await;
        let err = svc
            .confirm_payment_and_create_order(None, "pi_1", "pm_card_visa", guest_draft(cart_id))
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::ValidationError(_));
    }

    /// Sink whose calls never complete, like a hung Redis connection.
    struct StalledSink;

    #[async_trait::async_trait]
    impl NotificationSink for StalledSink {
        async fn send_order_confirmation(
            &self,
            _email: OrderConfirmationEmail,
        ) -> Result<(), crate::notifications::NotificationError> {
            std::future::pending().await
        }

        async fn log_activity(
            &self,
            _order_id: Uuid,
            _action: &str,
            _actor_id: Option<Uuid>,
        ) -> Result<(), crate::notifications::NotificationError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn stalled_notifications_do_not_hold_the_order() {
        let cart_id = Uuid::new_v4();
        let mut carts = MockCartStore::new();
        carts
            .expect_get_cart()
            .returning(move |_| Ok(cart_with(cart_id, &[(3, dec!(15.00))])));
        carts.expect_clear_cart().returning(|_| Ok(()));
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_retrieve_intent()
            .returning(move |id, _| Ok(intent(id, IntentStatus::Succeeded, 5533, cart_id)));

        let (tx, mut rx) = mpsc::channel(64);
        let svc = CheckoutService::new(
            Arc::new(carts),
            Arc::new(gateway),
            orders().await,
            Arc::new(StalledSink),
            PricingCalculator::new(CheckoutConfig::default()),
            Arc::new(EventSender::new(tx)),
        )
        .with_effects_timeout(Duration::from_millis(50));

        let finalized = tokio::time::timeout(
            Duration::from_secs(5),
            svc.confirm_order_after_payment(None, "pi_paid", guest_draft(cart_id)),
        )
        .await
        .expect("checkout waited on stalled notifications")
        .unwrap();

        assert!(finalized.created);
        assert_matches!(rx.try_recv(), Ok(Event::OrderCreated { .. }));
    }

    #[test]
    fn idempotency_key_includes_client_key() {
        let cart = cart_with(Uuid::nil(), &[(1, dec!(1.00))]);
        let key = intent_idempotency_key(&cart, 699, "usd", Some("abc"));
        assert!(key.starts_with("checkout:00000000-0000-0000-0000-000000000000:"));
        assert!(key.ends_with(":699:usd:abc"));
    }

    #[test]
    fn decline_code_maps_to_declined_error() {
        assert_matches!(
            payment_failure("nope".into(), Some("insufficient_funds".into())),
            ServiceError::PaymentDeclined { .. }
        );
        assert_matches!(payment_failure("nope".into(), None), ServiceError::PaymentFailed(_));
    }
}
