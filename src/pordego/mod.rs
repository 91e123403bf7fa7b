//! Server wiring: database pool, readiness gate, router, and listener.

pub mod handlers;

use crate::{
    gate::ReadinessGate,
    oidc::{store::PgClientRegistryStore, FileClientConfigSource},
};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    routing::get,
    Extension, Router,
};
use sqlx::postgres::PgPoolOptions;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{info, info_span, Span};
use ulid::Ulid;
use url::Url;

pub static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[derive(Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub dsn: String,
    pub auth_upstream: Url,
    pub oidc_enabled: bool,
    pub oidc_clients: Option<PathBuf>,
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(config: ServerConfig) -> Result<()> {
    // Connect to database
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&config.dsn)
        .await
        .context("Failed to connect to database")?;

    let gate = if config.oidc_enabled {
        let path = config.oidc_clients.context(
            "missing client registry path while the identity-provider integration is enabled",
        )?;

        Arc::new(ReadinessGate::new(
            Arc::new(FileClientConfigSource::new(path)),
            Arc::new(PgClientRegistryStore::new(pool.clone())),
        ))
    } else {
        info!("identity-provider integration disabled; auth requests pass through without seeding");
        Arc::new(ReadinessGate::disabled())
    };

    let handler = Arc::new(handlers::UpstreamAuthHandler::new(config.auth_upstream)?);
    let gateway = Arc::new(handlers::AuthGateway::new(Arc::clone(&gate), handler));

    let app = Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/api/auth",
            get(handlers::auth).post(handlers::auth),
        )
        .route(
            "/api/auth/*rest",
            get(handlers::auth).post(handlers::auth),
        )
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(gateway))
                .layer(Extension(gate))
                .layer(Extension(pool)),
        );

    let listener = TcpListener::bind(format!("::0:{}", config.port)).await?;

    info!("Listening on [::]:{}", config.port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
