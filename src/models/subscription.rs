use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

/// End time used for perpetual plans (`duration_secs == 0`): 9999-12-31T23:59:59Z.
pub const PERPETUAL_END_TIME: i64 = 253_402_300_799;

pub const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Paused,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    /// Active or paused: the subscription still holds plan benefits.
    pub fn is_live(self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Paused)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub user_id: i64,
    /// Product id of the subscribed plan
    pub plan_id: String,
    /// Order that most recently created, renewed or upgraded this subscription
    pub order_id: String,
    pub status: SubscriptionStatus,
    pub start_time: i64,
    pub end_time: i64,
    pub trial_start_time: Option<i64>,
    pub trial_end_time: Option<i64>,
    pub auto_renew: bool,
    pub quota_used: i64,
    pub quota_limit: i64,
    pub max_roles: i32,
    pub max_contexts: i32,
    pub available_models: Vec<String>,
    pub amount: i64,
    pub currency: String,
    pub cancel_reason: Option<String>,
    pub canceled_by: Option<String>,
    pub canceled_at: Option<i64>,
    /// Optimistic concurrency token, bumped on every plan or quota write
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Subscription {
    pub fn remaining_quota(&self) -> i64 {
        self.quota_limit - self.quota_used
    }

    pub fn is_perpetual(&self) -> bool {
        self.end_time == PERPETUAL_END_TIME
    }

    pub fn in_trial(&self, now: i64) -> bool {
        matches!((self.trial_start_time, self.trial_end_time), (Some(s), Some(e)) if s <= now && now < e)
    }
}

/// Billing window computed when a subscription is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionPeriod {
    pub trial_start_time: Option<i64>,
    pub trial_end_time: Option<i64>,
    pub start_time: i64,
    pub end_time: i64,
}

/// Benefits granted to users without an active subscription.
/// This is the only place the free-tier numbers live.
#[derive(Debug, Clone, Copy)]
pub struct FreeTier;

impl FreeTier {
    pub const MAX_ROLES: i32 = 2;
    pub const MAX_CONTEXTS: i32 = 1;
    pub const QUOTA: i64 = 0;
    pub const MODELS: &'static [&'static str] = &["base"];

    pub fn limits() -> UserLimits {
        UserLimits {
            subscription_id: None,
            plan_id: None,
            max_roles: Self::MAX_ROLES,
            max_contexts: Self::MAX_CONTEXTS,
            quota_limit: Self::QUOTA,
            quota_used: 0,
            available_models: Self::MODELS.iter().map(|m| m.to_string()).collect(),
            end_time: None,
        }
    }
}

/// Effective limits for a user: their active subscription's or the free tier's.
#[derive(Debug, Clone, Serialize)]
pub struct UserLimits {
    pub subscription_id: Option<String>,
    pub plan_id: Option<String>,
    pub max_roles: i32,
    pub max_contexts: i32,
    pub quota_limit: i64,
    pub quota_used: i64,
    pub available_models: Vec<String>,
    pub end_time: Option<i64>,
}

impl From<&Subscription> for UserLimits {
    fn from(sub: &Subscription) -> Self {
        Self {
            subscription_id: Some(sub.id.clone()),
            plan_id: Some(sub.plan_id.clone()),
            max_roles: sub.max_roles,
            max_contexts: sub.max_contexts,
            quota_limit: sub.quota_limit,
            quota_used: sub.quota_used,
            available_models: sub.available_models.clone(),
            end_time: Some(sub.end_time),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "permission", rename_all = "snake_case")]
pub enum Permission {
    /// Create one more role when the user already owns `current`
    CreateRole { current: i32 },
    /// Create one more context when the user already owns `current`
    CreateContext { current: i32 },
    UseModel { model: String },
    ConsumeQuota { amount: i64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct PermissionCheck {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub limits: UserLimits,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelSubscription {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChangePlan {
    pub plan_id: String,
    #[serde(default)]
    pub payment_method: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RenewSubscription {
    #[serde(default)]
    pub payment_method: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConsumeQuota {
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
pub struct SetAutoRenew {
    pub auto_renew: bool,
}
