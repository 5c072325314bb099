//! HTTP front end for the decode router

use crate::router::DecodeRouter;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use handoff_common::error::{Result, RouterError};
use handoff_protocol::{DispatchRequest, ReservationRequest, ReservationResponse, WorkerLoad};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Create the Axum router with all endpoints
pub fn create_router(router: Arc<DecodeRouter>, enable_metrics: bool) -> Router {
    let mut app = Router::new()
        .route("/prefill_finish", post(prefill_finish))
        .route("/generate_decode", post(generate_decode))
        .route("/workers", get(list_workers))
        .route("/health", get(health_check));

    if enable_metrics {
        app = app.route("/metrics", get(metrics));
    }

    app.with_state(router)
}

/// Bind `addr` and serve until the listener fails
pub async fn serve(router: Arc<DecodeRouter>, addr: &str, enable_metrics: bool) -> Result<()> {
    let app = create_router(router, enable_metrics);
    let listener = TcpListener::bind(addr).await?;

    info!("Decode router listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

// ===== HTTP Endpoint Handlers =====

// Bodies are extracted as `Result<Json<_>, JsonRejection>` so rejections go out
// through `RouterError` as `{"detail": ...}` with the extractor's status.

async fn prefill_finish(
    State(router): State<Arc<DecodeRouter>>,
    payload: std::result::Result<Json<ReservationRequest>, JsonRejection>,
) -> std::result::Result<Json<ReservationResponse>, RouterError> {
    let Json(request) = payload?;
    router.reserve(&request.text).map(Json)
}

async fn generate_decode(
    State(router): State<Arc<DecodeRouter>>,
    payload: std::result::Result<Json<DispatchRequest>, JsonRejection>,
) -> std::result::Result<Response, RouterError> {
    let Json(request) = payload?;
    let response = router.dispatch(&request).await?;

    let content_type = response
        .content_type
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));
    Ok(([(header::CONTENT_TYPE, content_type)], response.body).into_response())
}

async fn list_workers(State(router): State<Arc<DecodeRouter>>) -> Json<Vec<WorkerLoad>> {
    Json(router.worker_loads())
}

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

async fn metrics(
    State(router): State<Arc<DecodeRouter>>,
) -> std::result::Result<Response, RouterError> {
    let body = router.metrics().gather()?;
    Ok(([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response())
}
