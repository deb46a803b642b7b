use anyhow::Result;
use axum::{
    extract::Extension,
    routing::{get, post},
    Router,
};
use blast_core::BlastContext;
use std::env;
use std::net::SocketAddr;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;

fn cors_layer() -> CorsLayer {
    match env::var("CORS_ORIGINS") {
        Ok(origins) => {
            let mut cors = CorsLayer::new();
            for origin in origins.split(',').map(str::trim) {
                if let Ok(parsed) = origin.parse::<axum::http::HeaderValue>() {
                    cors = cors.allow_origin(parsed);
                }
            }
            cors.allow_methods(Any).allow_headers(Any)
        }
        Err(_) => {
            tracing::warn!("CORS_ORIGINS not set, using permissive CORS");
            CorsLayer::permissive()
        }
    }
}

pub fn router(ctx: BlastContext) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/queue/stats", get(handlers::queue_stats))
        .route("/api/v1/queue/stale", get(handlers::stale_report))
        .route("/api/v1/messages/:id/requeue", post(handlers::requeue_message))
        .route("/api/v1/messages/:id/cancel", post(handlers::cancel_message))
        .route("/api/v1/enrollment/run", post(handlers::run_enrollment))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(Extension(ctx))
                .layer(cors_layer()),
        )
}

pub async fn run(ctx: BlastContext) -> Result<()> {
    let host: std::net::IpAddr = ctx.config.server.host.parse()?;
    let addr = SocketAddr::from((host, ctx.config.server.api_port));
    let app = router(ctx);

    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
