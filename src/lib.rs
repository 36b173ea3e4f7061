//! Anonymous page-feedback beacon.
//!
//! Clients report whether a page was useful with a single GET whose
//! query string carries the vote. The server validates the payload,
//! coarsens the client address, and appends the vote to a bounded
//! Redis-backed store for offline analysis.
//!
//!
//!
//! # Query protocol
//!
//! Every parameter value is a JSON scalar (so strings arrive quoted,
//! e.g. `p=%22/home%22`). Two keys are reserved:
//!
//! - `p`: the page being rated, a string (required)
//! - `v`: whether the page was useful, a boolean (required; `0`/`1`
//!   from older clients still work)
//!
//! Any other key rides along as an extra field on the stored record,
//! namespaced with a `q-` prefix. Keys are capped at 25 characters
//! and values at 1024 bytes.
//!
//! A recorded vote answers with a fixed one-pixel `image/bmp` body,
//! so the endpoint can be wired up as `<img src=...>` without any
//! script on the page. Invalid votes get a bare 400 and nothing else;
//! the rejection reason stays in the server log.
//!
//!
//!
//! # Storage
//!
//! Votes land in a capped, append-only Redis structure: once the
//! configured byte budget is full, the oldest votes are evicted to
//! make room. Appends are atomic (a Lua script does the eviction and
//! insert in one step), so concurrent handlers share nothing but the
//! pooled connection. See [`database`] for the exact layout.
//!
//!
//!
//! # Configuration
//!
//! - `CONNECTION_STRING` (required): Redis URL; startup aborts
//!   without it
//! - `BEACON_PORT` (default 4000)
//! - `VOTES_CAPACITY_BYTES` (default 5 GiB)
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{header::CONTENT_TYPE, Method},
    routing::get,
    Router,
};

use signal::{
    ctrl_c,
    unix::{signal, SignalKind},
};
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

pub mod config;
pub mod database;
pub mod error;
pub mod routes;
pub mod state;
pub mod utils;
pub mod vote;

use database::VoteStore;
use routes::{health_handler, vote_handler};
use state::AppState;

pub async fn start_server() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Initializing state...");
    let state = AppState::new().await;

    info!("Starting server...");

    let address = format!("0.0.0.0:{}", state.config.port);
    let router = app(state);

    info!("Binding to {address}");

    let listener = TcpListener::bind(&address).await.unwrap();
    info!("Server running on {address}");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .unwrap();

    println!("Server shutting down...");
}

/// Build the router. `/health` answers without touching the pipeline;
/// every other GET path is a vote submission. Non-GET methods get a
/// 405 from the method router.
pub fn app<S: VoteStore>(state: Arc<AppState<S>>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/health", get(health_handler))
        .route("/", get(vote_handler::<S>))
        .route("/*page", get(vote_handler::<S>))
        .layer(cors)
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        ctrl_c().await.expect("Failed to install Ctrl+C handler");

        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        signal(SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;

        info!("Received terminate signal, shutting down");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
