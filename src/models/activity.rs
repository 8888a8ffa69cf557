use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

use crate::pagination::PageParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActivityType {
    SubscriptionCreated,
    SubscriptionRenewed,
    SubscriptionUpgraded,
    SubscriptionDowngraded,
    SubscriptionPaused,
    SubscriptionResumed,
    SubscriptionCanceled,
    SubscriptionExpired,
    TrialEnding,
    QuotaConsumed,
}

impl ActivityType {
    pub fn default_priority(self) -> ActivityPriority {
        match self {
            ActivityType::SubscriptionExpired | ActivityType::TrialEnding => ActivityPriority::High,
            ActivityType::QuotaConsumed => ActivityPriority::Low,
            _ => ActivityPriority::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActivityPriority {
    Low,
    Normal,
    High,
}

/// User-visible audit trail entry for subscription lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserActivity {
    pub id: String,
    pub user_id: i64,
    pub activity_type: ActivityType,
    pub subscription_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub amount: Option<i64>,
    pub priority: ActivityPriority,
    pub is_read: bool,
    pub is_resolved: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewActivity {
    pub user_id: i64,
    pub activity_type: ActivityType,
    pub subscription_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub amount: Option<i64>,
    pub priority: ActivityPriority,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActivityFilter {
    pub activity_type: Option<ActivityType>,
    #[serde(default)]
    pub unread_only: bool,
    #[serde(default)]
    pub unresolved_only: bool,
    pub priority: Option<ActivityPriority>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

impl PageParams for ActivityFilter {
    fn requested_limit(&self) -> Option<i64> {
        self.limit
    }

    fn requested_offset(&self) -> Option<i64> {
        self.offset
    }
}
