use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Paid,
    Canceled,
    Expired,
    Refunded,
}

impl OrderStatus {
    /// Legal status transitions. Nothing ever moves back to `pending`.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Paid)
                | (OrderStatus::Pending, OrderStatus::Canceled)
                | (OrderStatus::Pending, OrderStatus::Expired)
                | (OrderStatus::Paid, OrderStatus::Refunded)
        )
    }
}

/// Why an order exists. Renewal and upgrade orders are raised by the
/// subscription engine; their effect is applied when they are paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderKind {
    Purchase,
    Renewal,
    Upgrade,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub order_number: String,
    pub user_id: i64,
    pub product_id: String,
    pub sku_id: Option<String>,
    pub quantity: i64,
    pub unit_price: i64,
    pub total_amount: i64,
    pub currency: String,
    pub status: OrderStatus,
    pub kind: OrderKind,
    /// Subscription this order renews or upgrades
    pub subscription_id: Option<String>,
    pub payment_method: String,
    pub expire_time: i64,
    pub paid_at: Option<i64>,
    pub refund_amount: Option<i64>,
    pub refund_reason: Option<String>,
    pub refunded_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrder {
    pub product_id: String,
    #[serde(default)]
    pub sku_id: Option<String>,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    pub payment_method: String,
}

fn default_quantity() -> i64 {
    1
}

#[derive(Debug, Deserialize)]
pub struct RefundOrder {
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
}
