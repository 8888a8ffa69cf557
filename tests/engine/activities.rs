//! Activity feed tests: recording, filtering and read state.

#[path = "../common/mod.rs"]
mod common;
use common::*;

use payflow::engine::activity;

fn of_type(state: &AppState, user_id: i64, activity_type: ActivityType) -> Vec<UserActivity> {
    let filter = ActivityFilter {
        activity_type: Some(activity_type),
        ..ActivityFilter::default()
    };
    activity::list_activities(state, user_id, &filter).unwrap().items
}

#[tokio::test]
async fn test_lifecycle_events_are_recorded() {
    let env = test_env();
    let plan = create_plan(&env.state, "Pro", 9_900, 1);
    buy(&env.state, 7, &plan.id).await;
    let sub = live_subscription(&env.state, 7).unwrap();

    subscriptions::consume_quota(&env.state, 7, &sub.id, 25).unwrap();
    subscriptions::pause_subscription(&env.state, 7, &sub.id).unwrap();
    subscriptions::resume_subscription(&env.state, 7, &sub.id).unwrap();
    subscriptions::cancel_subscription(&env.state, 7, &sub.id, &CancelSubscription::default()).unwrap();

    let created = of_type(&env.state, 7, ActivityType::SubscriptionCreated);
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].subscription_id.as_deref(), Some(sub.id.as_str()));
    assert_eq!(created[0].amount, Some(plan.price));
    assert_eq!(created[0].title, "Subscribed to Pro");

    let consumed = of_type(&env.state, 7, ActivityType::QuotaConsumed);
    assert_eq!(consumed.len(), 1);
    assert_eq!(consumed[0].amount, Some(25));
    assert_eq!(consumed[0].priority, ActivityPriority::Low);

    for t in [
        ActivityType::SubscriptionPaused,
        ActivityType::SubscriptionResumed,
        ActivityType::SubscriptionCanceled,
    ] {
        assert_eq!(of_type(&env.state, 7, t).len(), 1, "missing {:?}", t);
    }
    assert_eq!(activities_of(&env.state, 7).len(), 5);

    // Other users see nothing.
    assert!(activities_of(&env.state, 8).is_empty());
}

#[tokio::test]
async fn test_refused_operations_record_nothing() {
    let env = test_env();
    let plan = create_plan(&env.state, "Pro", 9_900, 1);
    buy(&env.state, 7, &plan.id).await;
    let sub = live_subscription(&env.state, 7).unwrap();

    let err = subscriptions::consume_quota(&env.state, 7, &sub.id, 5_000).unwrap_err();
    assert!(matches!(err, AppError::QuotaExceeded { .. }));
    assert!(of_type(&env.state, 7, ActivityType::QuotaConsumed).is_empty());
}

#[tokio::test]
async fn test_read_and_resolve() {
    let env = test_env();
    let plan = create_plan(&env.state, "Pro", 9_900, 1);
    buy(&env.state, 7, &plan.id).await;
    let sub = live_subscription(&env.state, 7).unwrap();
    subscriptions::consume_quota(&env.state, 7, &sub.id, 1).unwrap();
    subscriptions::consume_quota(&env.state, 7, &sub.id, 1).unwrap();

    assert_eq!(activity::unread_count(&env.state, 7).unwrap(), 3);

    let first = activities_of(&env.state, 7).remove(0);
    activity::mark_read(&env.state, 7, &first.id).unwrap();
    assert_eq!(activity::unread_count(&env.state, 7).unwrap(), 2);

    let unread = ActivityFilter {
        unread_only: true,
        ..ActivityFilter::default()
    };
    let page = activity::list_activities(&env.state, 7, &unread).unwrap();
    assert_eq!(page.total, 2);
    assert!(page.items.iter().all(|a| !a.is_read && a.id != first.id));

    // Another user's activity is invisible.
    let err = activity::mark_read(&env.state, 8, &first.id).unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    let err = activity::mark_resolved(&env.state, 8, &first.id).unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    activity::mark_resolved(&env.state, 7, &first.id).unwrap();
    let unresolved = ActivityFilter {
        unresolved_only: true,
        ..ActivityFilter::default()
    };
    assert_eq!(activity::list_activities(&env.state, 7, &unresolved).unwrap().total, 2);

    assert_eq!(activity::mark_all_read(&env.state, 7).unwrap(), 2);
    assert_eq!(activity::unread_count(&env.state, 7).unwrap(), 0);
    assert_eq!(activity::mark_all_read(&env.state, 7).unwrap(), 0);
}

#[tokio::test]
async fn test_pagination_and_priority_filter() {
    let env = test_env();
    let plan = create_plan(&env.state, "Pro", 9_900, 1);
    buy(&env.state, 7, &plan.id).await;
    let sub = live_subscription(&env.state, 7).unwrap();
    for _ in 0..4 {
        subscriptions::consume_quota(&env.state, 7, &sub.id, 1).unwrap();
    }

    let page = activity::list_activities(
        &env.state,
        7,
        &ActivityFilter {
            limit: Some(2),
            offset: Some(1),
            ..ActivityFilter::default()
        },
    )
    .unwrap();
    assert_eq!(page.total, 5);
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.limit, 2);
    assert_eq!(page.offset, 1);

    let low = activity::list_activities(
        &env.state,
        7,
        &ActivityFilter {
            priority: Some(ActivityPriority::Low),
            ..ActivityFilter::default()
        },
    )
    .unwrap();
    assert_eq!(low.total, 4);
    assert!(low.items.iter().all(|a| a.activity_type == ActivityType::QuotaConsumed));
}
