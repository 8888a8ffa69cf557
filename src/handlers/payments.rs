use axum::extract::State;

use crate::db::AppState;
use crate::engine::ledger::{self, CreatedPayment};
use crate::error::Result;
use crate::extractors::{Json, Path, UserId};
use crate::models::{CreatePaymentBody, PaymentRecord};

pub async fn create_payment(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(input): Json<CreatePaymentBody>,
) -> Result<Json<CreatedPayment>> {
    Ok(Json(ledger::create_payment(&state, user_id, &input).await?))
}

pub async fn get_payment(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
) -> Result<Json<PaymentRecord>> {
    Ok(Json(ledger::get_payment(&state, user_id, &id)?))
}

/// Like `get_payment`, but asks the provider when the record is still pending.
pub async fn query_payment_status(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
) -> Result<Json<PaymentRecord>> {
    Ok(Json(ledger::query_payment_status(&state, user_id, &id).await?))
}
