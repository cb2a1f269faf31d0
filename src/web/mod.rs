//! Web layer: router, shared state, and server bootstrap (spec §4.7).
//!
//! Same shape as the teacher's `src/web/mod.rs` (`WebServer` owning a
//! `Router` + `SocketAddr`, `::new`/`::serve`/`::host`/`::port`), routes
//! swapped for the four proxy endpoints plus the ops/health surface.

pub mod handlers;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::cache::Caches;
use crate::config::Config;
use crate::http::{ClientPool, UpstreamPolicy};
use crate::resolver::StreamResolver;

/// Shared state reachable from every handler.
pub struct AppState {
    pub config: Config,
    pub client: Arc<ClientPool>,
    pub policy: Arc<UpstreamPolicy>,
    pub resolver: StreamResolver,
    pub caches: Caches,
    pub request_count: AtomicU64,
}

/// Run the expired-`PlaylistCache`-entry sweep every Nth request (spec
/// §4.4: "A periodic sweeper (triggered on every Nth request or by
/// wall-clock interval) evicts expired playlist entries... it must never
/// block request handlers for more than O(entries) time"). The sweep itself
/// runs after the request it piggybacks on, so it never adds latency to the
/// handler that triggered it.
async fn sweep_middleware(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let response = next.run(request).await;

    let n = state.config.cache.sweep_every_n_requests.max(1);
    let count = state.request_count.fetch_add(1, Ordering::Relaxed) + 1;
    if count % n == 0 {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            state.caches.playlists.remove_expired().await;
        });
    }

    response
}

/// Build the application router over a given state. Exposed (not just used
/// internally by `WebServer::new`) so integration tests can drive the exact
/// same route wiring with `tower::ServiceExt::oneshot`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/", get(handlers::index))
        .route("/proxy", get(handlers::proxy_ingest))
        .route("/proxy/m3u", get(handlers::proxy_m3u))
        .route("/proxy/ts", get(handlers::proxy_ts))
        .route("/proxy/key", get(handlers::proxy_key))
        .route("/cache/stats", get(handlers::cache_stats))
        .route("/cache/clear", get(handlers::cache_clear))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), sweep_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(state: AppState) -> Result<Self> {
        let addr: SocketAddr =
            format!("{}:{}", state.config.server.host, state.config.server.port).parse()?;
        let app = router(Arc::new(state));
        Ok(Self { app, addr })
    }

    pub async fn serve(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app).await?;
        Ok(())
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}
