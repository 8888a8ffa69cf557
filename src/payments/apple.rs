use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::Deserialize;
use uuid::Uuid;

use crate::config::AppleConfig;
use crate::error::{AppError, Result};
use crate::models::{PaymentScene, PaymentStatus};

use super::{
    CallbackPayload, CreatePaymentRequest, CreatePaymentResponse, PaymentGateway,
    QueryPaymentResponse, RefundRequest, RefundResponse, hmac_sha256, invalid_payload,
    signatures_match,
};

const PROVIDER: &str = "apple";

/// Platform store. Purchases happen on-device, so creating a payment only
/// issues the `appAccountToken` the client attaches to its purchase. The
/// store reports the outcome through server notifications; status queries
/// and refunds are not available from the server side.
#[derive(Debug, Clone)]
pub struct AppleGateway {
    bundle_id: String,
    shared_secret: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Notification {
    notification_type: String,
    data: NotificationData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationData {
    #[serde(default)]
    bundle_id: Option<String>,
    app_account_token: String,
    #[serde(default)]
    transaction_id: Option<String>,
    /// Milliunits of the currency (9900 cents = 99000)
    #[serde(default)]
    price: i64,
    /// Milliseconds since the epoch
    #[serde(default)]
    purchase_date: Option<i64>,
}

pub(crate) fn map_notification_type(kind: &str) -> PaymentStatus {
    match kind {
        "SUBSCRIBED" | "DID_RENEW" | "ONE_TIME_CHARGE" => PaymentStatus::Success,
        "EXPIRED" | "GRACE_PERIOD_EXPIRED" => PaymentStatus::Expired,
        "REFUND" | "REVOKE" => PaymentStatus::Canceled,
        _ => PaymentStatus::Failed,
    }
}

impl AppleGateway {
    pub fn new(config: &AppleConfig) -> Self {
        Self {
            bundle_id: config.bundle_id.clone(),
            shared_secret: config.shared_secret.clone(),
        }
    }
}

#[async_trait]
impl PaymentGateway for AppleGateway {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn extract_signature(&self, headers: &HeaderMap, _body: &[u8]) -> Option<String> {
        headers
            .get("x-apple-signature")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    async fn create_payment(&self, request: &CreatePaymentRequest) -> Result<CreatePaymentResponse> {
        if request.scene == PaymentScene::Qr {
            return Err(AppError::Unsupported {
                provider: PROVIDER,
                capability: "qr_code",
            });
        }
        let token = Uuid::new_v4().to_string();
        Ok(CreatePaymentResponse {
            provider_order_id: token.clone(),
            transaction_id: None,
            payment_url: None,
            qr_code_url: None,
            client_token: Some(token),
            expire_time: request.expire_time,
        })
    }

    async fn query_payment(&self, _provider_order_id: &str) -> Result<QueryPaymentResponse> {
        Err(AppError::Unsupported {
            provider: PROVIDER,
            capability: "query",
        })
    }

    async fn refund(&self, _request: &RefundRequest) -> Result<RefundResponse> {
        Err(AppError::Unsupported {
            provider: PROVIDER,
            capability: "refund",
        })
    }

    fn handle_callback(&self, body: &[u8]) -> Result<CallbackPayload> {
        let notification: Notification =
            serde_json::from_slice(body).map_err(|e| invalid_payload(PROVIDER, e))?;
        let data = notification.data;
        match data.bundle_id.as_deref() {
            Some(bundle) if bundle != self.bundle_id => {
                return Err(invalid_payload(PROVIDER, format!("unexpected bundle id {}", bundle)));
            }
            _ => {}
        }

        let status = map_notification_type(&notification.notification_type);
        Ok(CallbackPayload {
            provider_order_id: data.app_account_token,
            status,
            amount: data.price / 10,
            payment_time: (status == PaymentStatus::Success)
                .then_some(data.purchase_date.map(|ms| ms / 1000))
                .flatten(),
            transaction_id: data.transaction_id,
        })
    }

    fn verify_callback(&self, body: &[u8], signature: &str) -> Result<bool> {
        let expected = hex::encode(hmac_sha256(self.shared_secret.as_bytes(), body)?);
        Ok(signatures_match(expected.as_bytes(), signature.as_bytes()))
    }
}
