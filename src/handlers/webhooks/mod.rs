//! Provider callback endpoint.
//!
//! Providers only look at the status code and a short acknowledgement, so
//! errors are not rendered as JSON here. Anything that is not a 2xx gets
//! redelivered by the provider.

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
};

use crate::db::AppState;
use crate::engine::process_payment_callback;
use crate::error::{AppError, ErrorKind};
use crate::extractors::Path;

pub type WebhookResult = (StatusCode, &'static str);

pub fn router() -> Router<AppState> {
    Router::new().route("/webhook/{provider}", post(handle_webhook))
}

pub async fn handle_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResult {
    let gateway = match state.gateways.get(&provider) {
        Ok(g) => g,
        Err(_) => {
            tracing::warn!("Callback for unknown provider {}", provider);
            return (StatusCode::NOT_FOUND, "unknown provider");
        }
    };

    let signature = gateway.extract_signature(&headers, &body);
    match process_payment_callback(&state, gateway.name(), &body, signature.as_deref()).await {
        Ok(outcome) => {
            tracing::debug!("{} webhook handled: {:?}", provider, outcome);
            (StatusCode::OK, "success")
        }
        Err(e) => webhook_error(&provider, e),
    }
}

fn webhook_error(provider: &str, e: AppError) -> WebhookResult {
    match (e.kind(), &e) {
        (_, AppError::InvalidSignature) => (StatusCode::UNAUTHORIZED, "failure"),
        (ErrorKind::NotFound, _) | (ErrorKind::Precondition, _) => {
            tracing::warn!("{} webhook rejected: {}", provider, e);
            (StatusCode::BAD_REQUEST, "failure")
        }
        (_, AppError::BadRequest(_)) => {
            tracing::warn!("{} webhook rejected: {}", provider, e);
            (StatusCode::BAD_REQUEST, "failure")
        }
        _ => {
            tracing::error!("{} webhook failed: {}", provider, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "failure")
        }
    }
}
