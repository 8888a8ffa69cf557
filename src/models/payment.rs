use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

/// Normalized payment status. Every provider vocabulary maps onto this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
    Canceled,
    Expired,
}

impl PaymentStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_score(score: i32) -> Self {
        match score {
            s if s >= 60 => RiskLevel::High,
            s if s >= 30 => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }
}

/// How the buyer will complete the payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentScene {
    /// Redirect to a hosted payment page
    #[default]
    Web,
    /// Scan a QR code
    Qr,
    /// In-app / client SDK confirmation
    App,
}

/// One attempt to collect money for an order through a specific provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: String,
    pub order_id: String,
    pub user_id: i64,
    pub provider: String,
    /// Opaque provider-side id, stored verbatim for callback correlation
    pub provider_order_id: Option<String>,
    pub transaction_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub retry_count: i32,
    pub risk_level: RiskLevel,
    pub risk_score: i32,
    pub payment_url: Option<String>,
    pub qr_code_url: Option<String>,
    pub refund_id: Option<String>,
    pub expire_time: i64,
    pub payment_time: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewPaymentRecord {
    pub order_id: String,
    pub user_id: i64,
    pub provider: String,
    pub amount: i64,
    pub currency: String,
    pub risk_score: i32,
    pub expire_time: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreatePaymentBody {
    pub order_id: String,
    pub provider: String,
    #[serde(default)]
    pub scene: PaymentScene,
}
