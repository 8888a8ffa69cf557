use axum::{extract::State, http::StatusCode};
use serde::Serialize;

use crate::db::AppState;
use crate::engine::activity;
use crate::error::Result;
use crate::extractors::{Json, Path, Query, UserId};
use crate::models::{ActivityFilter, UserActivity};
use crate::pagination::Paginated;

#[derive(Serialize)]
pub struct UnreadCount {
    pub unread: i64,
}

#[derive(Serialize)]
pub struct MarkedRead {
    pub updated: usize,
}

pub async fn list_activities(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Query(filter): Query<ActivityFilter>,
) -> Result<Json<Paginated<UserActivity>>> {
    Ok(Json(activity::list_activities(&state, user_id, &filter)?))
}

pub async fn unread_count(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<Json<UnreadCount>> {
    Ok(Json(UnreadCount {
        unread: activity::unread_count(&state, user_id)?,
    }))
}

pub async fn mark_read(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    activity::mark_read(&state, user_id, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<Json<MarkedRead>> {
    Ok(Json(MarkedRead {
        updated: activity::mark_all_read(&state, user_id)?,
    }))
}

pub async fn mark_resolved(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    activity::mark_resolved(&state, user_id, &id)?;
    Ok(StatusCode::NO_CONTENT)
}
