//! REST service hosting the admission pipeline, wallet ledger, game
//! session/callback engine, AML queue, and reporting scheduler behind
//! an axum router.

#![deny(unsafe_code)]

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod state;
pub mod workers;

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderName, Method};
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub use error::{ApiError, ApiResult};
pub use state::{AppState, BootstrapError};

pub fn build_router(state: Arc<AppState>) -> Router {
    let config = &state.config;

    let cors = if config.server.cors_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers([
                HeaderName::from_static("x-api-key"),
                HeaderName::from_static("x-provider-signature"),
            ])
            .allow_origin(AllowOrigin::any())
    } else {
        let origins: Vec<_> = config
            .server
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers([
                HeaderName::from_static("x-api-key"),
                HeaderName::from_static("x-provider-signature"),
            ])
            .allow_origin(AllowOrigin::list(origins))
    };

    let body_limit = config.server.max_body_bytes;
    let request_timeout = Duration::from_secs(config.server.request_timeout_secs);

    let api = Router::new()
        .route("/auth/keys", post(handlers::auth::create_api_key))
        .route("/auth/keys/:id", delete(handlers::auth::delete_api_key))
        .route("/auth/ip-whitelist", post(handlers::auth::add_ip_whitelist))
        .route("/wallet/:player_id/balance", get(handlers::wallet::get_balance))
        .route("/wallet/:player_id/transactions", get(handlers::wallet::list_transactions))
        .route("/wallet/:player_id/deposit", post(handlers::wallet::deposit))
        .route("/wallet/:player_id/withdraw", post(handlers::wallet::withdraw))
        .route("/wallet/:player_id/bet", post(handlers::wallet::bet))
        .route("/wallet/:player_id/win", post(handlers::wallet::win))
        .route("/wallet/:player_id/cancel", post(handlers::wallet::cancel))
        .route("/games", get(handlers::games::list_games))
        .route("/games/:id", get(handlers::games::get_game))
        .route("/games/session", post(handlers::games::launch_session))
        .route("/games/callback", post(handlers::games::callback))
        .route("/reports", post(handlers::reports::schedule))
        .route("/reports/:id/download", get(handlers::reports::download))
        .route_layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            middleware::admission,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(cors)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
