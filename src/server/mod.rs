mod handlers;

use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/owners",
            get(handlers::list_owners).post(handlers::create_owner),
        )
        .route(
            "/owners/{id}",
            get(handlers::get_owner)
                .put(handlers::update_owner)
                .delete(handlers::delete_owner),
        )
        .route("/owners/{id}/companies", get(handlers::owner_companies))
        .route(
            "/companies",
            get(handlers::list_companies).post(handlers::create_company),
        )
        .route(
            "/companies/{id}",
            get(handlers::get_company)
                .put(handlers::update_company)
                .delete(handlers::delete_company),
        )
        .route("/geo/company/{id}", get(handlers::company_coordinates))
        .route("/geo/companies", get(handlers::companies_coordinates))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves until Ctrl-C, then gives in-flight resolutions the configured grace period.
pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = state.config().bind_addr.clone();
    let grace = state.config().shutdown_grace();
    let coordinator = state.coordinator().clone();

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind to {addr}"))?;
    info!(%addr, db_path = %state.db_path().display(), "company directory listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let abandoned = coordinator.drain(grace).await;
    info!(abandoned, "shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "unable to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
