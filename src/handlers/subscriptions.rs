use axum::{body::Bytes, extract::State};
use serde::de::DeserializeOwned;

use crate::db::AppState;
use crate::engine::subscriptions::{self, PlanChange};
use crate::error::Result;
use crate::extractors::{Json, Path, UserId};
use crate::models::{
    CancelSubscription, ChangePlan, ConsumeQuota, Permission, PermissionCheck, RenewSubscription,
    SetAutoRenew, Subscription, UserLimits,
};

/// Renew and cancel accept an empty body.
fn optional_body<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(body)?)
}

pub async fn list_subscriptions(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<Json<Vec<Subscription>>> {
    Ok(Json(subscriptions::list_user_subscriptions(&state, user_id)?))
}

/// The user's active subscription, or `null`.
pub async fn get_active_subscription(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<Json<Option<Subscription>>> {
    Ok(Json(subscriptions::get_active_subscription(&state, user_id)?))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
) -> Result<Json<Subscription>> {
    Ok(Json(subscriptions::get_subscription(&state, user_id, &id)?))
}

pub async fn renew_subscription(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<PlanChange>> {
    let input: RenewSubscription = optional_body(&body)?;
    Ok(Json(subscriptions::renew_subscription(&state, user_id, &id, &input)?))
}

pub async fn upgrade_subscription(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
    Json(input): Json<ChangePlan>,
) -> Result<Json<PlanChange>> {
    Ok(Json(subscriptions::upgrade_subscription(&state, user_id, &id, &input)?))
}

pub async fn downgrade_subscription(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
    Json(input): Json<ChangePlan>,
) -> Result<Json<PlanChange>> {
    Ok(Json(subscriptions::downgrade_subscription(&state, user_id, &id, &input)?))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Subscription>> {
    let input: CancelSubscription = optional_body(&body)?;
    Ok(Json(subscriptions::cancel_subscription(&state, user_id, &id, &input)?))
}

pub async fn pause_subscription(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
) -> Result<Json<Subscription>> {
    Ok(Json(subscriptions::pause_subscription(&state, user_id, &id)?))
}

pub async fn resume_subscription(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
) -> Result<Json<Subscription>> {
    Ok(Json(subscriptions::resume_subscription(&state, user_id, &id)?))
}

pub async fn set_auto_renew(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
    Json(input): Json<SetAutoRenew>,
) -> Result<Json<Subscription>> {
    Ok(Json(subscriptions::set_auto_renew(&state, user_id, &id, input.auto_renew)?))
}

pub async fn consume_quota(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
    Json(input): Json<ConsumeQuota>,
) -> Result<Json<Subscription>> {
    Ok(Json(subscriptions::consume_quota(&state, user_id, &id, input.amount)?))
}

pub async fn get_limits(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<Json<UserLimits>> {
    Ok(Json(subscriptions::user_limits(&state, user_id)?))
}

pub async fn check_permission(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(permission): Json<Permission>,
) -> Result<Json<PermissionCheck>> {
    Ok(Json(subscriptions::check_permission(&state, user_id, &permission)?))
}
