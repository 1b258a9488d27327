//! api-server: HTTP surface for delayed-callback redirect links.
//!
//! Endpoints:
//! - `POST /api/links` (alias `POST /create-link`): issue a signed link for a
//!   target URL, callback URL, and delay.
//! - `GET /r/:token`: redirect (302) to the target and schedule the callback
//!   for `now + delay`. Invalid links answer 400, expired ones 410.
//! - `GET /health`: liveness plus callback delivery counters.
//!
//! No datastore: each link's parameters travel inside its token and pending
//! callbacks live in memory only.
//!
//! Run:
//! ```bash
//! LINK_SECRET=$(openssl rand -hex 32) cargo run -p api-server
//! ```
//!
//! Configuration: See `config.rs` for all environment variables.
//!

mod config;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use axum::http::HeaderValue;
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use callback_dispatcher::{CallbackDispatcher, DispatcherConfig};
use domain::service::{LinkService, NewLink};
use domain::token::TokenCodec;
use domain::{Clock, DecodeError};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

type Links = LinkService<CallbackDispatcher, StdClock>;

#[derive(Clone)]
struct AppState {
    links: Arc<Links>,
    dispatcher: CallbackDispatcher,
    public_base_url: Option<String>,
}

#[derive(Clone)]
struct StdClock;
impl Clock for StdClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

#[tokio::main]
async fn main() {
    // Load and validate config first (fail fast on misconfiguration)
    let cfg = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    init_tracing(&cfg);
    cfg.warn_if_insecure();

    let state = match build_state(&cfg) {
        Ok(s) => s,
        Err(msg) => {
            error!(err = %msg, "startup failed");
            std::process::exit(1);
        }
    };
    let callbacks = state.dispatcher.config();
    info!(
        method = %callbacks.method,
        retry = ?callbacks.retry,
        "callback dispatcher ready"
    );

    // Request ID header name
    let x_request_id = axum::http::HeaderName::from_static("x-request-id");

    let mut app = router(state)
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");
                // Tokens are bearer links; log the route, not the full path.
                let path = request.uri().path();
                let route = if path.starts_with(http_common::REDIRECT_PREFIX) {
                    "/r/:token"
                } else {
                    path
                };
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    route = %route,
                    request_id = %request_id,
                )
            }),
        )
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid));

    // CORS - already validated in Config::from_env()
    let cors = if cfg.cors_allow_origin == HeaderValue::from_static("*") {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::list([cfg.cors_allow_origin.clone()]))
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::OPTIONS,
            ])
            .allow_headers([axum::http::header::CONTENT_TYPE])
    };
    app = app.layer(cors);

    let addr: SocketAddr = ([0, 0, 0, 0], cfg.port).into();
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, err = %e, "bind failed");
            std::process::exit(1);
        }
    };
    info!(%addr, max_delay = cfg.max_delay, "api-server listening");
    if let Err(e) = axum::serve(listener, app).await {
        error!(err = %e, "server error");
        std::process::exit(1);
    }
}

fn init_tracing(cfg: &config::Config) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match cfg.log_format {
        config::LogFormat::Json => {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_timer(fmt::time::SystemTime)
                        .with_writer(std::io::stdout),
                )
                .init();
        }
        config::LogFormat::Pretty => {
            registry
                .with(
                    fmt::layer()
                        .pretty()
                        .with_target(true)
                        .with_writer(std::io::stdout),
                )
                .init();
        }
    }
}

// Wire codec, dispatcher, and service together. Must run inside the runtime.
fn build_state(cfg: &config::Config) -> Result<AppState, String> {
    let codec = TokenCodec::new(&cfg.link_secret, cfg.token_lifetime)
        .map_err(|e| format!("token codec: {e}"))?;
    let dispatcher = CallbackDispatcher::new(DispatcherConfig {
        method: cfg.callback_method.clone(),
        retry: cfg.retry.clone(),
        ..DispatcherConfig::default()
    })
    .map_err(|e| format!("callback dispatcher: {e}"))?;
    let links = LinkService::new(codec, dispatcher.clone(), StdClock).with_max_delay(cfg.max_delay);
    Ok(AppState {
        links: Arc::new(links),
        dispatcher,
        public_base_url: cfg.public_base_url.clone(),
    })
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/r/:token", get(follow_link))
        .route("/api/links", post(create_link))
        .route("/create-link", post(create_link))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Deserialize)]
struct CreateLinkReq {
    #[serde(alias = "redirect_url")]
    target_url: String,
    callback_url: String,
    #[serde(alias = "seconds")]
    delay_seconds: i64,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Serialize)]
struct CreateLinkOut {
    link: String,
    token: String,
    expires_at: String,
}

async fn create_link(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateLinkReq>,
) -> Response {
    let input = NewLink {
        target_url: body.target_url,
        callback_url: body.callback_url,
        delay_seconds: body.delay_seconds,
        state: body.state,
    };
    match state.links.create(input) {
        Ok(issued) => {
            let base = base_url(&headers, &state.public_base_url);
            let token = issued.token.into_string();
            info!(
                delay_seconds = issued.params.delay_seconds,
                callback_url = %issued.params.callback_url,
                "create ok"
            );
            (
                StatusCode::CREATED,
                Json(CreateLinkOut {
                    link: http_common::build_link_url(&base, &token),
                    token,
                    expires_at: http_common::system_time_to_rfc3339(issued.expires_at),
                }),
            )
                .into_response()
        }
        Err(e) => {
            warn!(err = %e, "create rejected");
            (
                StatusCode::BAD_REQUEST,
                Json(http_common::json_error_with_message(
                    "invalid_request",
                    &e.to_string(),
                )),
            )
                .into_response()
        }
    }
}

async fn follow_link(State(state): State<AppState>, Path(token): Path<String>) -> Response {
    match state.links.resolve(&token) {
        Ok(redirect) => {
            let location = match HeaderValue::from_str(&redirect.target_url) {
                Ok(v) => v,
                Err(e) => {
                    error!(err = %e, "target url is not a valid header value");
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(http_common::json_err("internal")),
                    )
                        .into_response();
                }
            };
            info!(
                redirect_to = %redirect.target_url,
                fire_at = %http_common::system_time_to_rfc3339(redirect.fire_at),
                "resolve ok"
            );
            (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
        }
        Err(DecodeError::Expired) => {
            warn!("resolve 410 expired link");
            (StatusCode::GONE, Json(http_common::json_err("link_expired"))).into_response()
        }
        Err(e) => {
            warn!(err = %e, "resolve 400");
            (
                StatusCode::BAD_REQUEST,
                Json(http_common::json_err("invalid_link")),
            )
                .into_response()
        }
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "callbacks": state.dispatcher.stats(),
    }))
}

/// Base for generated links: configured public URL, else request headers.
fn base_url(headers: &HeaderMap, public_base_url: &Option<String>) -> String {
    if let Some(base) = public_base_url {
        return base.clone();
    }
    let h = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    http_common::base_url_from_headers(
        h("x-forwarded-proto"),
        h("x-forwarded-host"),
        h("host"),
        "http",
    )
}
