#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use rust_decimal::Decimal;
use sea_orm::{EntityTrait, PaginatorTrait};
use serde_json::{json, Value};
use storefront_api::{
    auth::{AuthConfig, AuthService},
    config::AppConfig,
    db::{self, DbConfig},
    entities::{order, order_activity, order_item, payment_history},
    events::{self, EventSender},
    handlers::AppServices,
    middleware_helpers::IdempotencyStore,
    notifications::{NotificationError, NotificationSink, OrderConfirmationEmail},
    repositories::OrderRepository,
    services::commerce::{AddToCartInput, CreateCartInput},
    services::payment_gateway::{
        CardDetails, Charge, CreateIntentRequest, ExpandableCharge, GatewayError, IntentStatus,
        PaymentGateway, PaymentIntent, PaymentMethodDetails,
    },
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const VISA: &str = "pm_card_visa";
pub const THREE_DS: &str = "pm_card_authenticationRequired";
pub const DECLINED: &str = "pm_card_chargeDeclined";

/// In-memory stand-in for the payment gateway.
///
/// Payment methods behave like the gateway's test cards: [`VISA`] succeeds,
/// [`THREE_DS`] needs authentication and [`DECLINED`] is declined.
#[derive(Default)]
pub struct FakeGateway {
    intents: Mutex<HashMap<String, PaymentIntent>>,
    idempotency: Mutex<HashMap<String, String>>,
    next_id: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub confirm_calls: AtomicUsize,
}

impl FakeGateway {
    pub fn intent(&self, id: &str) -> Option<PaymentIntent> {
        self.intents.lock().unwrap().get(id).cloned()
    }

    /// Marks an intent paid the way a client-side confirmation would.
    pub fn complete_payment(&self, id: &str) {
        let mut intents = self.intents.lock().unwrap();
        let intent = intents.get_mut(id).expect("unknown payment intent");
        intent.payment_method = Some(json!(VISA));
        intent.status = IntentStatus::Succeeded;
        intent.latest_charge = Some(charge_for(id));
    }

    pub fn set_status(&self, id: &str, status: IntentStatus) {
        let mut intents = self.intents.lock().unwrap();
        intents
            .get_mut(id)
            .expect("unknown payment intent")
            .status = status;
    }

    pub fn intent_count(&self) -> usize {
        self.intents.lock().unwrap().len()
    }

    fn with_intent<F>(&self, id: &str, f: F) -> Result<PaymentIntent, GatewayError>
    where
        F: FnOnce(&mut PaymentIntent) -> Result<(), GatewayError>,
    {
        let mut intents = self.intents.lock().unwrap();
        let intent = intents.get_mut(id).ok_or_else(|| GatewayError::InvalidRequest {
            message: format!("No such payment_intent: '{}'", id),
            code: Some("resource_missing".into()),
            param: Some("intent".into()),
        })?;
        f(intent)?;
        Ok(intent.clone())
    }
}

fn charge_for(intent_id: &str) -> ExpandableCharge {
    ExpandableCharge::Object(Box::new(Charge {
        id: format!("ch_{}", intent_id),
        receipt_url: Some(format!("https://pay.example.com/receipts/{}", intent_id)),
        payment_method_details: Some(PaymentMethodDetails {
            type_: "card".into(),
            card: Some(CardDetails {
                brand: Some("visa".into()),
                last4: Some("4242".into()),
            }),
        }),
    }))
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_intent(
        &self,
        request: CreateIntentRequest,
    ) -> Result<PaymentIntent, GatewayError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(id) = self.idempotency.lock().unwrap().get(&request.idempotency_key) {
            if let Some(existing) = self.intent(id) {
                return Ok(existing);
            }
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("pi_fake_{}", n);
        let intent = PaymentIntent {
            id: id.clone(),
            status: IntentStatus::RequiresPaymentMethod,
            amount: request.amount_minor,
            currency: request.currency.to_lowercase(),
            client_secret: Some(format!("{}_secret_test", id)),
            payment_method: None,
            metadata: request.metadata.into_iter().collect(),
            latest_charge: None,
            last_payment_error: None,
        };
        self.intents.lock().unwrap().insert(id.clone(), intent.clone());
        self.idempotency
            .lock()
            .unwrap()
            .insert(request.idempotency_key, id);
        Ok(intent)
    }

    async fn attach_payment_method(
        &self,
        intent_id: &str,
        payment_method_id: &str,
    ) -> Result<PaymentIntent, GatewayError> {
        self.with_intent(intent_id, |intent| {
            if intent.status != IntentStatus::Succeeded {
                intent.payment_method = Some(json!(payment_method_id));
                intent.status = IntentStatus::RequiresConfirmation;
            }
            Ok(())
        })
    }

    async fn confirm_intent(
        &self,
        intent_id: &str,
        payment_method_id: &str,
    ) -> Result<PaymentIntent, GatewayError> {
        self.confirm_calls.fetch_add(1, Ordering::SeqCst);
        self.with_intent(intent_id, |intent| {
            if intent.status == IntentStatus::Succeeded {
                return Ok(());
            }
            match payment_method_id {
                VISA => {
                    intent.status = IntentStatus::Succeeded;
                    intent.latest_charge = Some(charge_for(intent_id));
                    Ok(())
                }
                THREE_DS => {
                    intent.status = IntentStatus::RequiresAction;
                    Ok(())
                }
                DECLINED => {
                    intent.status = IntentStatus::RequiresPaymentMethod;
                    Err(GatewayError::CardDeclined {
                        code: Some("card_declined".into()),
                        decline_code: Some("generic_decline".into()),
                        message: "Your card was declined.".into(),
                    })
                }
                other => Err(GatewayError::InvalidRequest {
                    message: format!("No such PaymentMethod: '{}'", other),
                    code: Some("resource_missing".into()),
                    param: Some("payment_method".into()),
                }),
            }
        })
    }

    async fn retrieve_intent(
        &self,
        intent_id: &str,
        _expand_charge: bool,
    ) -> Result<PaymentIntent, GatewayError> {
        self.with_intent(intent_id, |_| Ok(()))
    }
}

/// Records side effects; optionally fails every call.
#[derive(Default)]
pub struct RecordingSink {
    pub emails: Mutex<Vec<OrderConfirmationEmail>>,
    pub activities: Mutex<Vec<(Uuid, String)>>,
    pub fail: bool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn email_count(&self) -> usize {
        self.emails.lock().unwrap().len()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send_order_confirmation(
        &self,
        email: OrderConfirmationEmail,
    ) -> Result<(), NotificationError> {
        if self.fail {
            return Err(NotificationError::ActivityLog("mailer offline".into()));
        }
        self.emails.lock().unwrap().push(email);
        Ok(())
    }

    async fn log_activity(
        &self,
        order_id: Uuid,
        action: &str,
        _actor_id: Option<Uuid>,
    ) -> Result<(), NotificationError> {
        if self.fail {
            return Err(NotificationError::ActivityLog("activity store offline".into()));
        }
        self.activities
            .lock()
            .unwrap()
            .push((order_id, action.to_string()));
        Ok(())
    }
}

/// Helper harness for spinning up an application backed by an in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<FakeGateway>,
    pub sink: Arc<RecordingSink>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_sink(RecordingSink::default()).await
    }

    pub async fn with_sink(sink: RecordingSink) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "redis://127.0.0.1:6379".to_string(),
            "integration_test_secret_that_is_long_enough_0123".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;

        // every connection to sqlite::memory: is a separate database
        let pool = db::establish_connection_with_config(&DbConfig::from(&cfg))
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = Arc::new(FakeGateway::default());
        let sink = Arc::new(sink);
        let order_repository = Arc::new(OrderRepository::new(db_arc.clone()));

        let services = AppServices::new(
            db_arc.clone(),
            event_sender.clone(),
            order_repository,
            gateway.clone(),
            sink.clone(),
            cfg.checkout.clone(),
        );

        let auth = Arc::new(AuthService::new(AuthConfig::from(&cfg)));
        let state = AppState {
            db: db_arc,
            config: cfg,
            event_sender,
            services,
            auth,
            idempotency: IdempotencyStore::new(Duration::from_secs(60)),
        };

        Self {
            router: storefront_api::app_router(state.clone()),
            state,
            gateway,
            sink,
            _event_task: event_task,
        }
    }

    pub fn token_for(&self, user_id: Uuid, roles: &[&str]) -> String {
        self.state
            .auth
            .issue_token(
                user_id,
                Some(format!("{}@example.com", user_id.simple())),
                roles.iter().map(|r| r.to_string()).collect(),
            )
            .expect("issue test token")
    }

    pub fn admin_token(&self) -> String {
        self.token_for(Uuid::new_v4(), &["admin"])
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        self.request_with_headers(method, uri, body, token, &[])
            .await
    }

    pub async fn request_with_headers(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).expect("serialize request body"))
            }
            None => Body::empty(),
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Creates a cart holding `(product_name, quantity, unit_price)` lines.
    pub async fn seed_cart(&self, lines: &[(&str, i32, Decimal)]) -> Uuid {
        let cart = self
            .state
            .services
            .cart
            .create_cart(CreateCartInput::default())
            .await
            .expect("create cart");

        for (name, quantity, unit_price) in lines {
            self.state
                .services
                .cart
                .add_item(
                    cart.id,
                    AddToCartInput {
                        variant_id: Uuid::new_v4(),
                        product_name: name.to_string(),
                        quantity: *quantity,
                        unit_price: *unit_price,
                    },
                )
                .await
                .expect("add cart item");
        }
        cart.id
    }

    pub async fn order_count(&self) -> u64 {
        order::Entity::find()
            .count(&*self.state.db)
            .await
            .expect("count orders")
    }

    pub async fn order_item_count(&self) -> u64 {
        order_item::Entity::find()
            .count(&*self.state.db)
            .await
            .expect("count order items")
    }

    pub async fn payment_history_count(&self) -> u64 {
        payment_history::Entity::find()
            .count(&*self.state.db)
            .await
            .expect("count payment history")
    }

    pub async fn activity_count(&self) -> u64 {
        order_activity::Entity::find()
            .count(&*self.state.db)
            .await
            .expect("count activities")
    }

    /// Starts a checkout and returns `(payment_intent_id, order_details)`.
    pub async fn start_checkout(&self, body: Value, token: Option<&str>) -> (String, Value) {
        let response = self
            .request(
                Method::POST,
                "/api/v1/orders/create-payment-intent",
                Some(body),
                token,
            )
            .await;
        assert_eq!(response.status(), 200, "create-payment-intent failed");
        let json = response_json(response).await;
        (
            json["data"]["paymentIntentId"]
                .as_str()
                .expect("payment intent id")
                .to_string(),
            json["data"]["orderDetails"].clone(),
        )
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

pub fn address() -> Value {
    json!({
        "name": "Ada Lovelace",
        "line1": "12 Analytical Row",
        "city": "London",
        "postal_code": "N1 9GU",
        "country": "GB"
    })
}

pub fn guest_checkout(cart_id: Uuid) -> Value {
    json!({
        "cart_id": cart_id,
        "shipping_address": address(),
        "guest_info": {
            "name": "Ada Lovelace",
            "email": "Ada@Example.com"
        }
    })
}

pub fn member_checkout(cart_id: Uuid) -> Value {
    json!({
        "cart_id": cart_id,
        "shipping_address": address(),
    })
}
