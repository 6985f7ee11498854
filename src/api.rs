//! Read-only snapshot endpoint.
//!
//! `GET /api/:doc_id` returns the persisted snapshot straight from the
//! store, bypassing the live relay. Intended for cold reads and debugging.

use crate::store::RelayStore;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tracing::warn;

/// Create the snapshot read router.
pub fn router(store: Arc<dyn RelayStore>) -> Router {
    Router::new()
        .route("/api/:doc_id", get(get_snapshot))
        .with_state(store)
}

async fn get_snapshot(
    State(store): State<Arc<dyn RelayStore>>,
    Path(doc_id): Path<String>,
) -> Response {
    match store.load_snapshot(&doc_id).await {
        Ok(Some(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(doc_id, "snapshot read failed: {}", e);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}
