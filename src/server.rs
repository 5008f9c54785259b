//! Axum router construction and method dispatch.
//!
//! Every path names a blob, so there is no route table: a single fallback
//! handler dispatches on the method alone.
//!   `GET`  -> download
//!   `POST` -> multipart upload
//!   other  -> 405

use axum::{
    extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State},
    http::Method,
    middleware,
    response::Response,
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::errors::GatewayError;
use crate::handlers::blob;
use crate::metrics::metrics_middleware;
use crate::AppState;

/// Build the axum [`Router`] serving blob downloads and uploads.
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(dispatch)
        .with_state(state)
        // metrics_middleware sits inside the trace span.
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        // Uploads are streamed; no body size cap.
        .layer(DefaultBodyLimit::disable())
}

async fn dispatch(
    State(state): State<Arc<AppState>>,
    req: Request,
) -> Result<Response, GatewayError> {
    let uri = req.uri().clone();
    match *req.method() {
        Method::GET => blob::get_blob(state, &uri).await,
        Method::POST => {
            let form = Multipart::from_request(req, &state).await.map_err(|e| {
                debug!("Rejected upload form: {}", e);
                GatewayError::BadForm
            })?;
            blob::put_blob(state, &uri, form).await
        }
        _ => Err(GatewayError::MethodNotAllowed),
    }
}
