//! Gated dispatch to the external authentication handler.
//!
//! Every `GET`/`POST` on the authentication sub-path lands here. The handler
//! asks the readiness gate to ensure the client registry has been seeded and
//! only then forwards the request, unmodified, to the upstream authentication
//! service. When the gate reports a failure the request is refused: forwarding
//! without seeding could route requests against an unregistered client set.

use crate::gate::{ReadinessGate, SeedError};
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    extract::{Extension, Request},
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;
use tracing::error;
use url::Url;

// Auth payloads are small (credentials, tokens, form posts).
const MAX_AUTH_BODY_BYTES: usize = 1024 * 1024;

/// External authentication handler, opaque to the gate: takes a request,
/// returns a response.
#[async_trait]
pub trait AuthHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

/// Readiness gate plus the handler it guards, injected into the router as one
/// extension.
pub struct AuthGateway {
    gate: Arc<ReadinessGate>,
    handler: Arc<dyn AuthHandler>,
}

impl AuthGateway {
    #[must_use]
    pub fn new(gate: Arc<ReadinessGate>, handler: Arc<dyn AuthHandler>) -> Self {
        Self { gate, handler }
    }

    #[must_use]
    pub fn gate(&self) -> &Arc<ReadinessGate> {
        &self.gate
    }
}

// axum handler for the auth wildcard routes; identical for GET and POST
pub async fn auth(Extension(gateway): Extension<Arc<AuthGateway>>, request: Request) -> Response {
    if let Err(err) = gateway.gate.ensure_ready().await {
        error!(
            method = %request.method(),
            path = request.uri().path(),
            "refusing auth request, client registry not seeded: {err}"
        );

        // Generic body only; the real failure stays in the logs.
        let status = match err {
            SeedError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SeedError::Store(_) | SeedError::Gate => StatusCode::SERVICE_UNAVAILABLE,
        };

        return (
            status,
            Json(json!({"error": "authentication is temporarily unavailable"})),
        )
            .into_response();
    }

    gateway.handler.handle(request).await
}

/// Production [`AuthHandler`]: reverse-proxies the request verbatim to the
/// configured upstream authentication service.
pub struct UpstreamAuthHandler {
    client: reqwest::Client,
    base: Url,
}

impl UpstreamAuthHandler {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base: Url) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(crate::pordego::APP_USER_AGENT)
            .build()?;

        Ok(Self { client, base })
    }

    // The incoming path is appended to the base path, so an upstream mounted
    // under a prefix (`http://host/auth-svc`) keeps that prefix.
    fn upstream_url(&self, uri: &Uri) -> Url {
        let mut url = self.base.clone();
        let prefix = self.base.path().trim_end_matches('/');
        if prefix.is_empty() {
            url.set_path(uri.path());
        } else {
            url.set_path(&format!("{prefix}{}", uri.path()));
        }
        url.set_query(uri.query());
        url
    }
}

#[async_trait]
impl AuthHandler for UpstreamAuthHandler {
    async fn handle(&self, request: Request) -> Response {
        let (parts, body) = request.into_parts();

        let bytes = match to_bytes(body, MAX_AUTH_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("failed to read auth request body: {err}");
                return StatusCode::PAYLOAD_TOO_LARGE.into_response();
            }
        };

        let url = self.upstream_url(&parts.uri);

        let mut headers = parts.headers.clone();
        headers.remove(header::HOST);

        let upstream = self
            .client
            .request(parts.method.clone(), url)
            .headers(headers)
            .body(bytes.to_vec())
            .send()
            .await;

        let upstream = match upstream {
            Ok(response) => response,
            Err(err) => {
                error!("auth upstream unreachable: {err}");
                return (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({"error": "authentication upstream unreachable"})),
                )
                    .into_response();
            }
        };

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        headers.remove(header::TRANSFER_ENCODING);
        headers.remove(header::CONNECTION);

        let body = match upstream.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("failed to read auth upstream response: {err}");
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oidc::{
        store::testing::{HoldingStore, MemoryClientRegistryStore},
        store::StoreError,
        testing::{descriptor, StaticClientConfigSource},
        ConfigError,
    };
    use axum::{http::Method, routing::get, Router};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use tower::ServiceExt;

    struct FakeAuthHandler {
        calls: AtomicUsize,
        last_path: Mutex<Option<String>>,
    }

    impl FakeAuthHandler {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                last_path: Mutex::new(None),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AuthHandler for FakeAuthHandler {
        async fn handle(&self, request: Request) -> Response {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_path.lock() = Some(request.uri().path().to_string());
            (StatusCode::OK, "authenticated").into_response()
        }
    }

    fn router(gateway: Arc<AuthGateway>) -> Router {
        Router::new()
            .route("/api/auth", get(auth).post(auth))
            .route("/api/auth/*rest", get(auth).post(auth))
            .layer(Extension(gateway))
    }

    fn request(method: Method, path: &str) -> Request {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn concurrent_first_requests_seed_once_and_both_pass() {
        let source = Arc::new(StaticClientConfigSource::new(vec![descriptor("c1")]));
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let store = Arc::new(HoldingStore::new(
            MemoryClientRegistryStore::default(),
            Arc::clone(&entered),
            Arc::clone(&release),
        ));
        let gate = Arc::new(ReadinessGate::new(source.clone(), store.clone()));
        let handler = Arc::new(FakeAuthHandler::new());
        let gateway = Arc::new(AuthGateway::new(gate, handler.clone()));
        let app = router(gateway);

        let get_app = app.clone();
        let get_request = tokio::spawn(async move {
            get_app
                .oneshot(request(Method::GET, "/api/auth/session"))
                .await
                .unwrap()
        });

        // The GET opened the seeding window; a POST arriving inside it must
        // await the same attempt.
        entered.notified().await;
        let post_app = app.clone();
        let post_request = tokio::spawn(async move {
            post_app
                .oneshot(request(Method::POST, "/api/auth/callback"))
                .await
                .unwrap()
        });

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        release.notify_one();

        assert_eq!(get_request.await.unwrap().status(), StatusCode::OK);
        assert_eq!(post_request.await.unwrap().status(), StatusCode::OK);

        assert_eq!(store.inner().upsert_calls(), 1);
        assert!(store.inner().contains("c1"));
        let record = store.inner().record("c1").unwrap();
        assert_eq!(record.client_secret, "s1");
        assert_eq!(record.redirect_uris, vec!["https://a/cb".to_string()]);
        assert_eq!(handler.calls(), 2);
    }

    #[tokio::test]
    async fn store_failure_fails_closed_then_recovers() {
        let source = Arc::new(StaticClientConfigSource::new(vec![descriptor("c1")]));
        let store = Arc::new(MemoryClientRegistryStore::default());
        store.fail_next(StoreError::new("connection reset"));
        let gate = Arc::new(ReadinessGate::new(source.clone(), store.clone()));
        let handler = Arc::new(FakeAuthHandler::new());
        let gateway = Arc::new(AuthGateway::new(gate, handler.clone()));
        let app = router(gateway);

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/api/auth/session"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(handler.calls(), 0);

        // The store recovered; the next request re-attempts seeding.
        let response = app
            .oneshot(request(Method::GET, "/api/auth/session"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(store.contains("c1"));
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn configuration_failure_returns_a_server_error_without_leaking() {
        let source = Arc::new(StaticClientConfigSource::failing(ConfigError::new(
            "client c1 has an empty secret",
        )));
        let store = Arc::new(MemoryClientRegistryStore::default());
        let gate = Arc::new(ReadinessGate::new(source.clone(), store.clone()));
        let handler = Arc::new(FakeAuthHandler::new());
        let gateway = Arc::new(AuthGateway::new(gate, handler.clone()));
        let app = router(gateway);

        let response = app
            .oneshot(request(Method::POST, "/api/auth/signin"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(handler.calls(), 0);

        let body = to_bytes(response.into_body(), MAX_AUTH_BODY_BYTES)
            .await
            .unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(!body.contains("c1"));
        assert!(body.contains("temporarily unavailable"));
    }

    #[tokio::test]
    async fn disabled_gate_passes_requests_straight_through() {
        let gate = Arc::new(ReadinessGate::disabled());
        let handler = Arc::new(FakeAuthHandler::new());
        let gateway = Arc::new(AuthGateway::new(gate, handler.clone()));
        let app = router(gateway);

        let response = app
            .oneshot(request(Method::GET, "/api/auth/session"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(handler.calls(), 1);
        assert_eq!(
            handler.last_path.lock().as_deref(),
            Some("/api/auth/session")
        );
    }

    #[test]
    fn upstream_url_preserves_path_and_query() {
        let handler =
            UpstreamAuthHandler::new(Url::parse("http://auth.internal:3000").unwrap()).unwrap();

        let uri: Uri = "/api/auth/callback?state=xyz".parse().unwrap();
        let url = handler.upstream_url(&uri);

        assert_eq!(
            url.as_str(),
            "http://auth.internal:3000/api/auth/callback?state=xyz"
        );
    }

    #[test]
    fn upstream_url_keeps_the_base_path_prefix() {
        let handler =
            UpstreamAuthHandler::new(Url::parse("http://auth.internal:3000/auth-svc").unwrap())
                .unwrap();

        let uri: Uri = "/api/auth/session".parse().unwrap();
        let url = handler.upstream_url(&uri);

        assert_eq!(
            url.as_str(),
            "http://auth.internal:3000/auth-svc/api/auth/session"
        );
    }
}
