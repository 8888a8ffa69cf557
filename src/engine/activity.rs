use rusqlite::Connection;

use crate::db::{AppState, queries};
use crate::error::{AppError, Result, msg};
use crate::models::{
    ActivityFilter, ActivityType, NewActivity, Subscription, UserActivity,
};
use crate::pagination::Paginated;

/// Activity for a lifecycle event of `sub`, at the type's default priority.
pub(crate) fn for_subscription(
    sub: &Subscription,
    activity_type: ActivityType,
    title: impl Into<String>,
    description: Option<String>,
) -> NewActivity {
    NewActivity {
        user_id: sub.user_id,
        activity_type,
        subscription_id: Some(sub.id.clone()),
        title: title.into(),
        description,
        amount: None,
        priority: activity_type.default_priority(),
    }
}

/// Append an activity. Failures are logged and swallowed: the audit trail
/// never fails the operation that triggered it.
pub(crate) fn record(conn: &Connection, activity: NewActivity) {
    if let Err(e) = queries::insert_activity(conn, &activity) {
        tracing::warn!(
            "Failed to record {} activity for user {}: {}",
            activity.activity_type.as_ref(),
            activity.user_id,
            e
        );
    }
}

pub fn list_activities(
    state: &AppState,
    user_id: i64,
    filter: &ActivityFilter,
) -> Result<Paginated<UserActivity>> {
    let conn = state.db.get()?;
    let (items, total) = queries::list_activities(&conn, user_id, filter)?;
    Ok(Paginated::new(items, total, filter))
}

pub fn mark_read(state: &AppState, user_id: i64, id: &str) -> Result<()> {
    let conn = state.db.get()?;
    if !queries::mark_activity_read(&conn, user_id, id)? {
        return Err(AppError::NotFound(msg::ACTIVITY_NOT_FOUND));
    }
    Ok(())
}

pub fn mark_all_read(state: &AppState, user_id: i64) -> Result<usize> {
    let conn = state.db.get()?;
    queries::mark_all_activities_read(&conn, user_id)
}

pub fn mark_resolved(state: &AppState, user_id: i64, id: &str) -> Result<()> {
    let conn = state.db.get()?;
    if !queries::mark_activity_resolved(&conn, user_id, id)? {
        return Err(AppError::NotFound(msg::ACTIVITY_NOT_FOUND));
    }
    Ok(())
}

pub fn unread_count(state: &AppState, user_id: i64) -> Result<i64> {
    let conn = state.db.get()?;
    queries::count_unread_activities(&conn, user_id)
}
