//! Payment-intent gateway adapter.
//!
//! [`PaymentGateway`] is the seam the checkout talks to. [`StripeGateway`] speaks
//! Stripe's form-encoded REST API, forwards idempotency keys, retries transient
//! failures with jittered backoff, and folds Stripe's error envelope into
//! [`GatewayError`].

use async_trait::async_trait;
use metrics::counter;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::StripeConfig;

const UNEXPECTED_STATE: &str = "payment_intent_unexpected_state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    RequiresCapture,
    Canceled,
    Succeeded,
    #[serde(other)]
    Unknown,
}

impl IntentStatus {
    /// The intent can still be attached to and confirmed.
    pub fn is_payable(self) -> bool {
        matches!(
            self,
            IntentStatus::RequiresPaymentMethod
                | IntentStatus::RequiresConfirmation
                | IntentStatus::RequiresAction
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IntentStatus::RequiresPaymentMethod => "requires_payment_method",
            IntentStatus::RequiresConfirmation => "requires_confirmation",
            IntentStatus::RequiresAction => "requires_action",
            IntentStatus::Processing => "processing",
            IntentStatus::RequiresCapture => "requires_capture",
            IntentStatus::Canceled => "canceled",
            IntentStatus::Succeeded => "succeeded",
            IntentStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardDetails {
    pub brand: Option<String>,
    pub last4: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMethodDetails {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub card: Option<CardDetails>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Charge {
    pub id: String,
    #[serde(default)]
    pub receipt_url: Option<String>,
    #[serde(default)]
    pub payment_method_details: Option<PaymentMethodDetails>,
}

/// `latest_charge` is an id unless the request asked for `expand[]=latest_charge`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpandableCharge {
    Object(Box<Charge>),
    Id(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastPaymentError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub decline_code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// The subset of Stripe's PaymentIntent object the checkout relies on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub status: IntentStatus,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub payment_method: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub latest_charge: Option<ExpandableCharge>,
    #[serde(default)]
    pub last_payment_error: Option<LastPaymentError>,
}

/// Card/receipt facts copied into the payment ledger
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChargeDetails {
    pub payment_method_type: Option<String>,
    pub card_brand: Option<String>,
    pub card_last4: Option<String>,
    pub receipt_url: Option<String>,
}

impl PaymentIntent {
    /// Attached payment method id, whether or not the field was expanded.
    pub fn payment_method_id(&self) -> Option<&str> {
        match self.payment_method.as_ref()? {
            serde_json::Value::String(id) => Some(id.as_str()),
            serde_json::Value::Object(obj) => obj.get("id").and_then(|v| v.as_str()),
            _ => None,
        }
    }

    pub fn charge_details(&self) -> ChargeDetails {
        match &self.latest_charge {
            Some(ExpandableCharge::Object(charge)) => {
                let details = charge.payment_method_details.as_ref();
                let card = details.and_then(|d| d.card.as_ref());
                ChargeDetails {
                    payment_method_type: details.map(|d| d.type_.clone()),
                    card_brand: card.and_then(|c| c.brand.clone()),
                    card_last4: card.and_then(|c| c.last4.clone()),
                    receipt_url: charge.receipt_url.clone(),
                }
            }
            _ => ChargeDetails::default(),
        }
    }

    pub fn failure_reason(&self) -> String {
        self.last_payment_error
            .as_ref()
            .and_then(|e| e.message.clone())
            .unwrap_or_else(|| format!("payment intent is {}", self.status))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateIntentRequest {
    pub amount_minor: i64,
    pub currency: String,
    pub metadata: BTreeMap<String, String>,
    pub idempotency_key: String,
    pub receipt_email: Option<String>,
}

/// What a confirmation attempt means for the checkout
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmOutcome {
    Succeeded(PaymentIntent),
    RequiresAction {
        client_secret: Option<String>,
        intent: PaymentIntent,
    },
    Failed {
        reason: String,
        decline_code: Option<String>,
    },
}

impl ConfirmOutcome {
    pub fn from_intent(intent: PaymentIntent) -> Self {
        match intent.status {
            IntentStatus::Succeeded => ConfirmOutcome::Succeeded(intent),
            IntentStatus::RequiresAction => ConfirmOutcome::RequiresAction {
                client_secret: intent.client_secret.clone(),
                intent,
            },
            _ => ConfirmOutcome::Failed {
                reason: intent.failure_reason(),
                decline_code: intent
                    .last_payment_error
                    .as_ref()
                    .and_then(|e| e.decline_code.clone()),
            },
        }
    }

    /// Folds card declines into [`ConfirmOutcome::Failed`]; anything else stays an error.
    pub fn from_result(result: Result<PaymentIntent, GatewayError>) -> Result<Self, GatewayError> {
        match result {
            Ok(intent) => Ok(Self::from_intent(intent)),
            Err(GatewayError::CardDeclined {
                message,
                decline_code,
                ..
            }) => Ok(ConfirmOutcome::Failed {
                reason: message,
                decline_code,
            }),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    #[error("card declined: {message}")]
    CardDeclined {
        code: Option<String>,
        decline_code: Option<String>,
        message: String,
    },
    #[error("additional authentication required")]
    AuthenticationRequired { client_secret: Option<String> },
    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        code: Option<String>,
        param: Option<String>,
    },
    #[error("idempotency conflict: {0}")]
    IdempotencyConflict(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("authentication with gateway failed: {0}")]
    Authentication(String),
    #[error("gateway api error: {0}")]
    Api(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Network(_) | GatewayError::RateLimited(_) | GatewayError::Api(_)
        )
    }

    fn is_unexpected_state(&self) -> bool {
        matches!(self, GatewayError::InvalidRequest { code: Some(c), .. } if c == UNEXPECTED_STATE)
    }
}

/// Payment-intent lifecycle operations
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_intent(&self, request: CreateIntentRequest)
        -> Result<PaymentIntent, GatewayError>;

    /// Sets the payment method on an intent. Re-attaching the same method is not an error.
    async fn attach_payment_method(
        &self,
        intent_id: &str,
        payment_method_id: &str,
    ) -> Result<PaymentIntent, GatewayError>;

    /// Confirming an intent that already succeeded returns it unchanged.
    async fn confirm_intent(
        &self,
        intent_id: &str,
        payment_method_id: &str,
    ) -> Result<PaymentIntent, GatewayError>;

    async fn retrieve_intent(
        &self,
        intent_id: &str,
        expand_charge: bool,
    ) -> Result<PaymentIntent, GatewayError>;
}

// { error: { type, code, decline_code, message, param, payment_intent } }
#[derive(Debug, Deserialize)]
struct StripeErrorEnvelope {
    error: StripeErrorDetails,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetails {
    #[serde(rename = "type")]
    type_: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    decline_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    param: Option<String>,
    #[serde(default)]
    payment_intent: Option<serde_json::Value>,
}

fn map_error(status: StatusCode, body: &str) -> GatewayError {
    let Ok(env) = serde_json::from_str::<StripeErrorEnvelope>(body) else {
        return if status.is_server_error() {
            GatewayError::Api(format!("status={} body={}", status.as_u16(), body))
        } else {
            GatewayError::Decode(format!("status={} body={}", status.as_u16(), body))
        };
    };

    let e = env.error;
    let message = e
        .message
        .clone()
        .unwrap_or_else(|| format!("stripe {} ({})", e.type_, status.as_u16()));

    match e.type_.as_str() {
        "card_error" if e.code.as_deref() == Some("authentication_required") => {
            GatewayError::AuthenticationRequired {
                client_secret: e
                    .payment_intent
                    .as_ref()
                    .and_then(|pi| pi.get("client_secret"))
                    .and_then(|s| s.as_str())
                    .map(str::to_owned),
            }
        }
        "card_error" => GatewayError::CardDeclined {
            code: e.code,
            decline_code: e.decline_code,
            message,
        },
        "idempotency_error" => GatewayError::IdempotencyConflict(message),
        "rate_limit_error" => GatewayError::RateLimited(message),
        "authentication_error" => GatewayError::Authentication(message),
        "api_connection_error" => GatewayError::Network(message),
        "invalid_request_error" if status == StatusCode::TOO_MANY_REQUESTS => {
            GatewayError::RateLimited(message)
        }
        "invalid_request_error" => GatewayError::InvalidRequest {
            message,
            code: e.code,
            param: e.param,
        },
        _ if status.is_server_error() => GatewayError::Api(message),
        _ => GatewayError::Api(format!("{}: {}", e.type_, message)),
    }
}

/// One key per call: transport retries inside the call share it, while a later
/// call (new card attempt after a decline or failed 3DS) reaches Stripe afresh.
fn attempt_idempotency_key(operation: &str, intent_id: &str) -> String {
    format!("{}:{}:{}", operation, intent_id, Uuid::new_v4().simple())
}

/// Stripe REST client
#[derive(Clone)]
pub struct StripeGateway {
    http: Client,
    api_key: String,
    api_base: String,
    stripe_version: Option<String>,
    max_retries: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl StripeGateway {
    pub fn new(config: &StripeConfig) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        let base_delay_ms = config.base_delay_ms.max(1);
        Ok(Self {
            http,
            api_key: config.secret_key.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            stripe_version: config.api_version.clone().filter(|v| !v.is_empty()),
            max_retries: config.max_retries,
            base_delay_ms,
            max_delay_ms: config.max_delay_ms.max(base_delay_ms),
        })
    }

    fn apply_common_headers(
        &self,
        req: reqwest::RequestBuilder,
        idempotency_key: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let mut req = req.bearer_auth(&self.api_key);
        if let Some(k) = idempotency_key {
            req = req.header("Idempotency-Key", k);
        }
        if let Some(v) = &self.stripe_version {
            req = req.header("Stripe-Version", v);
        }
        req
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<PaymentIntent, GatewayError> {
        let resp = req
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        if status.is_success() {
            serde_json::from_str::<PaymentIntent>(&text)
                .map_err(|e| GatewayError::Decode(e.to_string()))
        } else {
            Err(map_error(status, &text))
        }
    }

    async fn post_form(
        &self,
        path: &str,
        form: &[(String, String)],
        idempotency_key: &str,
    ) -> Result<PaymentIntent, GatewayError> {
        let url = format!("{}{}", self.api_base, path);
        self.with_retries(path, self.max_retries, || {
            let req = self.http.post(&url).form(form);
            self.send(self.apply_common_headers(req, Some(idempotency_key)))
        })
        .await
    }

    async fn with_retries<F, Fut, T>(
        &self,
        desc: &str,
        max_retries: u32,
        mut op: F,
    ) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if !e.is_transient() || attempt >= max_retries {
                        return Err(e);
                    }

                    // exponential backoff with full jitter, capped at max_delay_ms
                    let exp = self
                        .base_delay_ms
                        .saturating_mul(1u64 << attempt.min(20));
                    let cap = exp.min(self.max_delay_ms);
                    let delay_ms = if cap > self.base_delay_ms {
                        rand::thread_rng().gen_range(self.base_delay_ms..=cap)
                    } else {
                        self.base_delay_ms
                    };

                    warn!(
                        target: "stripe",
                        desc = %desc,
                        attempt = attempt + 1,
                        max_retries = max_retries,
                        error = %e,
                        next_delay_ms = delay_ms,
                        "retrying transient Stripe error"
                    );
                    counter!("stripe.request.retries", 1);

                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    // POST /v1/payment_intents
    #[instrument(skip(self, request), fields(amount = request.amount_minor, currency = %request.currency, idempotency_key = %request.idempotency_key))]
    async fn create_intent(
        &self,
        request: CreateIntentRequest,
    ) -> Result<PaymentIntent, GatewayError> {
        if request.amount_minor <= 0 {
            return Err(GatewayError::InvalidRequest {
                message: "amount must be a positive number of minor units".to_string(),
                code: Some("amount_too_small".to_string()),
                param: Some("amount".to_string()),
            });
        }

        let mut form: Vec<(String, String)> = vec![
            ("amount".into(), request.amount_minor.to_string()),
            ("currency".into(), request.currency.to_ascii_lowercase()),
            ("payment_method_types[]".into(), "card".into()),
        ];
        for (k, v) in &request.metadata {
            form.push((format!("metadata[{}]", k), v.clone()));
        }
        if let Some(email) = &request.receipt_email {
            form.push(("receipt_email".into(), email.clone()));
        }

        info!(target: "stripe", method = "POST", path = "/v1/payment_intents", "stripe request");
        self.post_form("/v1/payment_intents", &form, &request.idempotency_key)
            .await
    }

    // POST /v1/payment_intents/{id}
    #[instrument(skip(self), fields(intent_id = %intent_id))]
    async fn attach_payment_method(
        &self,
        intent_id: &str,
        payment_method_id: &str,
    ) -> Result<PaymentIntent, GatewayError> {
        let form = vec![("payment_method".to_string(), payment_method_id.to_string())];
        let path = format!("/v1/payment_intents/{}", intent_id);
        let key = attempt_idempotency_key("attach", intent_id);

        match self.post_form(&path, &form, &key).await {
            Err(e) if e.is_unexpected_state() => {
                // confirmed intents reject updates; fine if our method is already on it
                let current = self.retrieve_intent(intent_id, false).await?;
                if current.payment_method_id() == Some(payment_method_id)
                    || current.status == IntentStatus::Succeeded
                {
                    debug!(intent_id = %intent_id, status = %current.status, "payment method already attached");
                    Ok(current)
                } else {
                    Err(e)
                }
            }
            other => other,
        }
    }

    // POST /v1/payment_intents/{id}/confirm
    #[instrument(skip(self), fields(intent_id = %intent_id))]
    async fn confirm_intent(
        &self,
        intent_id: &str,
        payment_method_id: &str,
    ) -> Result<PaymentIntent, GatewayError> {
        let form = vec![
            ("payment_method".to_string(), payment_method_id.to_string()),
            ("expand[]".to_string(), "latest_charge".to_string()),
        ];
        let path = format!("/v1/payment_intents/{}/confirm", intent_id);
        let key = attempt_idempotency_key("confirm", intent_id);

        match self.post_form(&path, &form, &key).await {
            Err(e) if e.is_unexpected_state() => {
                let current = self.retrieve_intent(intent_id, true).await?;
                if current.status == IntentStatus::Succeeded {
                    debug!(intent_id = %intent_id, "payment intent already confirmed");
                    Ok(current)
                } else {
                    Err(e)
                }
            }
            other => other,
        }
    }

    // GET /v1/payment_intents/{id}
    #[instrument(skip(self), fields(intent_id = %intent_id))]
    async fn retrieve_intent(
        &self,
        intent_id: &str,
        expand_charge: bool,
    ) -> Result<PaymentIntent, GatewayError> {
        let url = format!("{}/v1/payment_intents/{}", self.api_base, intent_id);
        self.with_retries("retrieve_intent", self.max_retries, || {
            let mut req = self.http.get(&url);
            if expand_charge {
                req = req.query(&[("expand[]", "latest_charge")]);
            }
            self.send(self.apply_common_headers(req, None))
        })
        .await
    }
}
