use axum::{
    body::Body,
    extract::{Request, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    middleware::Next,
    response::Response,
};
use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::BodyExt as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::auth::AuthUser;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const IDEMPOTENT_REPLAY_HEADER: &str = "idempotent-replayed";

/// In-process cache of successful POST responses keyed by `Idempotency-Key`.
#[derive(Clone)]
pub struct IdempotencyStore {
    entries: Arc<DashMap<String, StoredResponse>>,
    ttl: Duration,
    sweep_interval: Duration,
    last_sweep: Arc<Mutex<Instant>>,
}

impl Default for IdempotencyStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

impl IdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
            sweep_interval: ttl.min(Duration::from_secs(60)),
            last_sweep: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn get(&self, key: &str) -> Option<StoredResponse> {
        self.entries
            .get(key)
            .filter(|sr| sr.stored_at.elapsed() < self.ttl)
            .map(|sr| sr.value().clone())
    }

    pub fn insert(&self, key: &str, sr: StoredResponse) {
        self.entries.insert(key.to_string(), sr);
    }

    pub fn cleanup(&self) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.entries
            .retain(|_, sr| now.duration_since(sr.stored_at) < ttl);
    }

    /// Runs [`Self::cleanup`] at most once per sweep interval.
    pub fn cleanup_if_due(&self) {
        let Ok(mut last) = self.last_sweep.try_lock() else {
            return;
        };
        if last.elapsed() < self.sweep_interval {
            return;
        }
        *last = Instant::now();
        drop(last);
        self.cleanup();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone)]
pub struct StoredResponse {
    pub status: StatusCode,
    pub body: Bytes,
    pub content_type: Option<HeaderValue>,
    pub stored_at: Instant,
}

/// Replays the stored response for a repeated `Idempotency-Key` on POST routes.
///
/// Only 2xx responses are stored, so a client retrying after a decline or a
/// gateway outage reaches the handler again. Keys are scoped by caller and path.
pub async fn idempotency_middleware(
    State(store): State<IdempotencyStore>,
    req: Request,
    next: Next,
) -> Response {
    if req.method() != axum::http::Method::POST {
        return next.run(req).await;
    }

    let Some(key) = req
        .headers()
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    else {
        return next.run(req).await;
    };

    let caller = req
        .extensions()
        .get::<AuthUser>()
        .map(|user| user.user_id.to_string())
        .unwrap_or_else(|| "anonymous".to_string());
    let scoped_key = format!("{}:{}:{}", caller, req.uri().path(), key);
    store.cleanup_if_due();

    if let Some(stored) = store.get(&scoped_key) {
        debug!(idempotency_key = %key, "replaying stored response");
        let mut resp = Response::new(Body::from(stored.body.clone()));
        *resp.status_mut() = stored.status;
        if let Some(ct) = stored.content_type {
            resp.headers_mut().insert(CONTENT_TYPE, ct);
        }
        resp.headers_mut()
            .insert(IDEMPOTENT_REPLAY_HEADER, HeaderValue::from_static("true"));
        return resp;
    }

    let resp = next.run(req).await;
    if !resp.status().is_success() {
        return resp;
    }

    let (parts, body) = resp.into_parts();
    match body.collect().await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            store.insert(
                &scoped_key,
                StoredResponse {
                    status: parts.status,
                    body: bytes.clone(),
                    content_type: parts.headers.get(CONTENT_TYPE).cloned(),
                    stored_at: Instant::now(),
                },
            );
            Response::from_parts(parts, Body::from(bytes))
        }
        Err(err) => {
            warn!(error = %err, "failed to buffer response for idempotency store");
            Response::from_parts(parts, Body::empty())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::to_bytes, routing::post, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    fn app(store: IdempotencyStore, counter: Arc<AtomicUsize>, status: StatusCode) -> Router {
        Router::new()
            .route(
                "/orders",
                post(move || {
                    let counter = counter.clone();
                    async move {
                        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        (status, format!("call-{}", n))
                    }
                }),
            )
            .layer(axum::middleware::from_fn_with_state(
                store,
                idempotency_middleware,
            ))
    }

    fn request(key: &str) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .uri("/orders")
            .header(IDEMPOTENCY_KEY_HEADER, key)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn repeated_key_replays_first_success() {
        let store = IdempotencyStore::default();
        let counter = Arc::new(AtomicUsize::new(0));
        let router = app(store.clone(), counter.clone(), StatusCode::CREATED);

        let first = router.clone().oneshot(request("k1")).await.unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);
        let second = router.clone().oneshot(request("k1")).await.unwrap();
        assert_eq!(second.status(), StatusCode::CREATED);
        assert!(second.headers().contains_key(IDEMPOTENT_REPLAY_HEADER));

        let body = to_bytes(second.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"call-1");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_stored() {
        let store = IdempotencyStore::default();
        let counter = Arc::new(AtomicUsize::new(0));
        let router = app(store.clone(), counter.clone(), StatusCode::PAYMENT_REQUIRED);

        router.clone().oneshot(request("k2")).await.unwrap();
        router.clone().oneshot(request("k2")).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn expired_entries_are_ignored() {
        let store = IdempotencyStore::new(Duration::from_millis(0));
        store.insert(
            "/orders:k3",
            StoredResponse {
                status: StatusCode::OK,
                body: Bytes::from_static(b"x"),
                content_type: None,
                stored_at: Instant::now(),
            },
        );
        assert!(store.get("/orders:k3").is_none());
        store.cleanup();
        assert!(store.is_empty());
    }

    fn stored() -> StoredResponse {
        StoredResponse {
            status: StatusCode::OK,
            body: Bytes::from_static(b"x"),
            content_type: None,
            stored_at: Instant::now(),
        }
    }

    #[test]
    fn sweeps_wait_for_the_interval() {
        let store =
            IdempotencyStore::new(Duration::ZERO).with_sweep_interval(Duration::from_secs(3600));
        store.insert("/orders:k4", stored());
        store.cleanup_if_due();
        // expired but not swept yet
        assert!(store.get("/orders:k4").is_none());
        assert_eq!(store.len(), 1);

        let store = IdempotencyStore::new(Duration::ZERO).with_sweep_interval(Duration::ZERO);
        store.insert("/orders:k5", stored());
        store.cleanup_if_due();
        assert!(store.is_empty());
    }
}
