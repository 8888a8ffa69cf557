//! Payment gateway abstraction.
//!
//! Every provider implements [`PaymentGateway`] and maps its own status
//! vocabulary onto [`PaymentStatus`]. Gateways are registered once at startup
//! in a [`GatewayRegistry`] that is never mutated afterwards.

mod alipay;
mod apple;
mod stripe;
mod wechat;

pub use alipay::AlipayGateway;
pub use apple::AppleGateway;
pub use stripe::StripeGateway;
pub use wechat::WechatGateway;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use reqwest::{Client, Response};
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::Config;
use crate::error::{AppError, Result, msg};
use crate::models::{PaymentScene, PaymentStatus};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed callback timestamp (seconds).
pub const CALLBACK_TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// Everything a provider needs to open a payment for one attempt.
#[derive(Debug, Clone)]
pub struct CreatePaymentRequest {
    /// Local payment record id, used as the merchant-side trade number
    pub payment_id: String,
    pub order_number: String,
    /// Minor currency units
    pub amount: i64,
    pub currency: String,
    pub subject: String,
    pub scene: PaymentScene,
    pub notify_url: String,
    pub return_url: Option<String>,
    pub expire_time: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatePaymentResponse {
    pub provider_order_id: String,
    pub transaction_id: Option<String>,
    pub payment_url: Option<String>,
    pub qr_code_url: Option<String>,
    /// Opaque value the client SDK needs to confirm the payment (client secret,
    /// prepay id, signed order string). Returned to the caller, never stored.
    pub client_token: Option<String>,
    pub expire_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPaymentResponse {
    pub status: PaymentStatus,
    pub amount: i64,
    pub payment_time: Option<i64>,
    pub transaction_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub provider_order_id: String,
    pub transaction_id: Option<String>,
    /// Merchant-side refund number, unique per refund
    pub refund_no: String,
    pub amount: i64,
    /// Amount originally paid
    pub total_amount: i64,
    pub currency: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RefundResponse {
    pub refund_id: String,
    pub status: RefundStatus,
    pub refund_time: Option<i64>,
}

/// A provider notification after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackPayload {
    pub provider_order_id: String,
    pub status: PaymentStatus,
    pub amount: i64,
    pub payment_time: Option<i64>,
    pub transaction_id: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Registry key and the `provider` column value (e.g. "alipay").
    fn name(&self) -> &'static str;

    /// Pull the callback signature out of the request. Some providers put it
    /// in headers, others inside the body.
    fn extract_signature(&self, headers: &HeaderMap, body: &[u8]) -> Option<String>;

    async fn create_payment(&self, request: &CreatePaymentRequest) -> Result<CreatePaymentResponse>;

    async fn query_payment(&self, provider_order_id: &str) -> Result<QueryPaymentResponse>;

    async fn refund(&self, request: &RefundRequest) -> Result<RefundResponse>;

    /// Parse and normalize a callback body. Does not verify it.
    fn handle_callback(&self, body: &[u8]) -> Result<CallbackPayload>;

    fn verify_callback(&self, body: &[u8], signature: &str) -> Result<bool>;
}

/// Immutable name → gateway map.
#[derive(Default, Clone)]
pub struct GatewayRegistry {
    gateways: HashMap<&'static str, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn builder() -> GatewayRegistryBuilder {
        GatewayRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn PaymentGateway>> {
        self.gateways
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::UnknownProvider(name.to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.gateways.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Register every provider that has credentials configured.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = http_client(config.engine.provider_timeout)?;
        let mut builder = Self::builder();
        if let Some(c) = &config.stripe {
            builder = builder.register(StripeGateway::new(c, client.clone()));
        }
        if let Some(c) = &config.alipay {
            builder = builder.register(AlipayGateway::new(c, client.clone()));
        }
        if let Some(c) = &config.wechat {
            builder = builder.register(WechatGateway::new(c, client.clone()));
        }
        if let Some(c) = &config.apple {
            builder = builder.register(AppleGateway::new(c));
        }
        Ok(builder.build())
    }
}

#[derive(Default)]
pub struct GatewayRegistryBuilder {
    gateways: HashMap<&'static str, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistryBuilder {
    pub fn register(self, gateway: impl PaymentGateway + 'static) -> Self {
        self.register_arc(Arc::new(gateway))
    }

    pub fn register_arc(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        if self.gateways.insert(gateway.name(), gateway.clone()).is_some() {
            tracing::warn!("Payment gateway {} registered twice, keeping the last", gateway.name());
        }
        self
    }

    pub fn build(self) -> GatewayRegistry {
        GatewayRegistry {
            gateways: self.gateways,
        }
    }
}

pub fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::Internal(format!("failed to build HTTP client: {}", e)))
}

// ============ Shared helpers ============

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| AppError::Internal(msg::INVALID_WEBHOOK_SECRET.into()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Constant-time comparison. Length is not secret (fixed per scheme).
pub(crate) fn signatures_match(expected: &[u8], provided: &[u8]) -> bool {
    expected.len() == provided.len() && bool::from(expected.ct_eq(provided))
}

/// Reject signed timestamps that are stale or too far in the future.
pub(crate) fn timestamp_within_tolerance(provider: &str, timestamp: i64) -> bool {
    let age = chrono::Utc::now().timestamp() - timestamp;
    if age > CALLBACK_TIMESTAMP_TOLERANCE_SECS {
        tracing::warn!(
            "{} callback rejected: timestamp too old (age={}s, max={}s)",
            provider,
            age,
            CALLBACK_TIMESTAMP_TOLERANCE_SECS
        );
        return false;
    }
    if age < -60 {
        tracing::warn!("{} callback rejected: timestamp in the future (age={}s)", provider, age);
        return false;
    }
    true
}

/// Map a transport failure. Anything that never produced an HTTP answer is
/// worth retrying.
pub(crate) fn transport_error(provider: &str, e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::ProviderUnavailable(format!("{} request timed out", provider))
    } else {
        AppError::ProviderUnavailable(format!("{} request failed: {}", provider, e))
    }
}

/// Turn non-2xx answers into provider errors: 429/5xx are retryable, other
/// 4xx mean the provider refused the request.
pub(crate) async fn check_status(provider: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() || status.as_u16() == 429 {
        Err(AppError::ProviderUnavailable(format!(
            "{} returned {}: {}",
            provider, status, body
        )))
    } else {
        Err(AppError::ProviderRejected(format!(
            "{} returned {}: {}",
            provider, status, body
        )))
    }
}

pub(crate) fn invalid_payload(provider: &str, detail: impl std::fmt::Display) -> AppError {
    AppError::BadRequest(format!(
        "{} ({}): {}",
        msg::INVALID_CALLBACK_PAYLOAD,
        provider,
        detail
    ))
}

/// Minor units to a two-decimal major-unit string (9900 → "99.00").
pub(crate) fn format_major(amount: i64) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// Parse a major-unit decimal string into minor units ("99.5" → 9950).
pub(crate) fn parse_major(s: &str) -> Option<i64> {
    let s = s.trim();
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if whole.is_empty() || frac.len() > 2 || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let whole: i64 = whole.parse().ok()?;
    if whole < 0 {
        return None;
    }
    let frac: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().ok()? * 10,
        _ => frac.parse().ok()?,
    };
    whole.checked_mul(100)?.checked_add(frac)
}
