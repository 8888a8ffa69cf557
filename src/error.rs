use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use strum::AsRefStr;
use thiserror::Error;

/// User-facing error messages shared across the engine.
pub mod msg {
    pub const PRODUCT_NOT_FOUND: &str = "Product not found";
    pub const SKU_NOT_FOUND: &str = "SKU not found";
    pub const ORDER_NOT_FOUND: &str = "Order not found";
    pub const PAYMENT_NOT_FOUND: &str = "Payment record not found";
    pub const SUBSCRIPTION_NOT_FOUND: &str = "Subscription not found";
    pub const ACTIVITY_NOT_FOUND: &str = "Activity not found";
    pub const PRODUCT_UNAVAILABLE: &str = "Product is not available for purchase";
    pub const SKU_PRODUCT_MISMATCH: &str = "SKU does not belong to this product";
    pub const INVALID_QUANTITY: &str = "Quantity must be at least 1";
    pub const AMOUNT_OVERFLOW: &str = "Order amount is too large";
    pub const INVALID_AMOUNT: &str = "Amount must be positive";
    pub const NAME_EMPTY: &str = "Name cannot be empty";
    pub const CURRENCY_EMPTY: &str = "Currency cannot be empty";
    pub const NOT_A_PLAN: &str = "Product is not a subscription plan";
    pub const MISSING_USER_ID: &str = "Missing or invalid X-User-Id header";
    pub const INVALID_SIGNATURE_FORMAT: &str = "Invalid signature format";
    pub const INVALID_WEBHOOK_SECRET: &str = "Invalid webhook secret";
    pub const INVALID_CALLBACK_PAYLOAD: &str = "Invalid callback payload";
}

/// Coarse classification of every [`AppError`].
///
/// Callers branch on the kind instead of matching individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Precondition,
    Provider,
    Invariant,
    Internal,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(&'static str),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Insufficient stock")]
    InsufficientStock,

    #[error("Order is not pending")]
    OrderNotPending,

    #[error("Order is not paid")]
    OrderNotPaid,

    #[error("Order has expired")]
    OrderExpired,

    #[error("Payment has expired")]
    PaymentExpired,

    #[error("Subscription has expired")]
    SubscriptionExpired,

    #[error("Quota exceeded: requested {requested}, remaining {remaining}")]
    QuotaExceeded { requested: i64, remaining: i64 },

    #[error("Invalid plan change: {0}")]
    InvalidPlanChange(String),

    #[error("Not eligible: {0}")]
    NotEligible(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Concurrent modification of {0}")]
    ConcurrentModification(&'static str),

    #[error("Unknown payment provider: {0}")]
    UnknownProvider(String),

    #[error("Payment provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Payment provider rejected the request: {0}")]
    ProviderRejected(String),

    #[error("Invalid callback signature")]
    InvalidSignature,

    #[error("{provider} does not support {capability}")]
    Unsupported {
        provider: &'static str,
        capability: &'static str,
    },

    #[error("Order number collision: {0}")]
    OrderNumberCollision(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::BadRequest(_)
            | AppError::Unauthorized
            | AppError::InsufficientStock
            | AppError::OrderNotPending
            | AppError::OrderNotPaid
            | AppError::OrderExpired
            | AppError::PaymentExpired
            | AppError::SubscriptionExpired
            | AppError::QuotaExceeded { .. }
            | AppError::InvalidPlanChange(_)
            | AppError::NotEligible(_)
            | AppError::PermissionDenied(_)
            | AppError::ConcurrentModification(_) => ErrorKind::Precondition,
            AppError::UnknownProvider(_)
            | AppError::ProviderUnavailable(_)
            | AppError::ProviderRejected(_)
            | AppError::InvalidSignature
            | AppError::Unsupported { .. } => ErrorKind::Provider,
            AppError::Invariant(_) => ErrorKind::Invariant,
            AppError::OrderNumberCollision(_)
            | AppError::Database(_)
            | AppError::Pool(_)
            | AppError::Json(_)
            | AppError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::BadRequest(_) => "bad_request",
            AppError::Unauthorized => "unauthorized",
            AppError::InsufficientStock => "insufficient_stock",
            AppError::OrderNotPending => "order_not_pending",
            AppError::OrderNotPaid => "order_not_paid",
            AppError::OrderExpired => "order_expired",
            AppError::PaymentExpired => "payment_expired",
            AppError::SubscriptionExpired => "subscription_expired",
            AppError::QuotaExceeded { .. } => "quota_exceeded",
            AppError::InvalidPlanChange(_) => "invalid_plan_change",
            AppError::NotEligible(_) => "not_eligible",
            AppError::PermissionDenied(_) => "permission_denied",
            AppError::ConcurrentModification(_) => "concurrent_modification",
            AppError::UnknownProvider(_) => "unknown_provider",
            AppError::ProviderUnavailable(_) => "provider_unavailable",
            AppError::ProviderRejected(_) => "provider_rejected",
            AppError::InvalidSignature => "invalid_signature",
            AppError::Unsupported { .. } => "unsupported",
            AppError::OrderNumberCollision(_) => "order_number_collision",
            AppError::Invariant(_) => "invariant_violation",
            AppError::Database(_) | AppError::Pool(_) | AppError::Internal(_) => "internal",
            AppError::Json(_) => "invalid_json",
        }
    }

    /// Provider failures worth another attempt (timeouts, transport errors).
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::ProviderUnavailable(_))
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, details) = match &self {
            AppError::NotFound(what) => (StatusCode::NOT_FOUND, "Not found", Some(what.to_string())),
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, "Bad request", Some(m.clone())),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized", None),
            AppError::PermissionDenied(m) => (StatusCode::FORBIDDEN, "Forbidden", Some(m.clone())),
            AppError::ConcurrentModification(_) => {
                (StatusCode::CONFLICT, "Conflict", Some(self.to_string()))
            }
            AppError::InsufficientStock
            | AppError::OrderNotPending
            | AppError::OrderNotPaid
            | AppError::OrderExpired
            | AppError::PaymentExpired
            | AppError::SubscriptionExpired
            | AppError::QuotaExceeded { .. }
            | AppError::InvalidPlanChange(_)
            | AppError::NotEligible(_) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "Precondition failed",
                Some(self.to_string()),
            ),
            AppError::UnknownProvider(_) | AppError::Unsupported { .. } => {
                (StatusCode::BAD_REQUEST, "Bad request", Some(self.to_string()))
            }
            AppError::InvalidSignature => (StatusCode::UNAUTHORIZED, "Invalid signature", None),
            AppError::ProviderUnavailable(m) | AppError::ProviderRejected(m) => {
                tracing::warn!("Payment provider error: {}", m);
                (StatusCode::BAD_GATEWAY, "Payment provider error", None)
            }
            AppError::Invariant(m) => {
                tracing::error!("Invariant violation: {}", m);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None)
            }
            AppError::OrderNumberCollision(m) => {
                tracing::error!("Order number collision: {}", m);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None)
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None)
            }
            AppError::Pool(e) => {
                tracing::error!("Pool error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None)
            }
            AppError::Json(e) => {
                tracing::error!("JSON error: {}", e);
                (StatusCode::BAD_REQUEST, "Invalid JSON", Some(e.to_string()))
            }
            AppError::Internal(m) => {
                tracing::error!("Internal error: {}", m);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None)
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            code: self.code(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

impl From<axum::extract::rejection::JsonRejection> for AppError {
    fn from(rejection: axum::extract::rejection::JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<axum::extract::rejection::QueryRejection> for AppError {
    fn from(rejection: axum::extract::rejection::QueryRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<axum::extract::rejection::PathRejection> for AppError {
    fn from(rejection: axum::extract::rejection::PathRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Turns `Option<T>` lookups into typed not-found errors.
pub trait OptionExt<T> {
    fn or_not_found(self, what: &'static str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn or_not_found(self, what: &'static str) -> Result<T> {
        self.ok_or(AppError::NotFound(what))
    }
}
