use async_trait::async_trait;
use axum::http::HeaderMap;
use reqwest::Client;
use serde::Deserialize;

use crate::config::StripeConfig;
use crate::error::{AppError, Result, msg};
use crate::models::{PaymentScene, PaymentStatus};

use super::{
    CallbackPayload, CreatePaymentRequest, CreatePaymentResponse, PaymentGateway,
    QueryPaymentResponse, RefundRequest, RefundResponse, RefundStatus, check_status, hmac_sha256,
    invalid_payload, signatures_match, timestamp_within_tolerance, transport_error,
};

const PROVIDER: &str = "stripe";

/// Card gateway backed by Stripe PaymentIntents.
#[derive(Debug, Clone)]
pub struct StripeGateway {
    client: Client,
    secret_key: String,
    webhook_secret: String,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct PaymentIntent {
    id: String,
    status: String,
    amount: i64,
    #[serde(default)]
    amount_received: Option<i64>,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    latest_charge: Option<String>,
    #[serde(default)]
    created: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
    status: String,
    #[serde(default)]
    created: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct StripeEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    created: Option<i64>,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: PaymentIntent,
}

/// Map a PaymentIntent status onto the normalized set.
pub(crate) fn map_intent_status(status: &str) -> PaymentStatus {
    match status {
        "succeeded" => PaymentStatus::Success,
        "canceled" => PaymentStatus::Canceled,
        "requires_payment_method" | "requires_confirmation" | "requires_action" | "processing"
        | "requires_capture" => PaymentStatus::Pending,
        _ => PaymentStatus::Failed,
    }
}

fn map_refund_status(status: &str) -> RefundStatus {
    match status {
        "succeeded" => RefundStatus::Success,
        "pending" | "requires_action" => RefundStatus::Pending,
        _ => RefundStatus::Failed,
    }
}

impl StripeGateway {
    pub fn new(config: &StripeConfig, client: Client) -> Self {
        Self {
            client,
            secret_key: config.secret_key.clone(),
            webhook_secret: config.webhook_secret.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
        }
    }

    async fn fetch_intent(&self, id: &str) -> Result<PaymentIntent> {
        let response = self
            .client
            .get(format!("{}/v1/payment_intents/{}", self.api_base, id))
            .basic_auth(&self.secret_key, None::<&str>)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;
        let response = check_status(PROVIDER, response).await?;
        response
            .json()
            .await
            .map_err(|e| AppError::ProviderRejected(format!("Failed to parse Stripe response: {}", e)))
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn extract_signature(&self, headers: &HeaderMap, _body: &[u8]) -> Option<String> {
        headers
            .get("stripe-signature")
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

        let amount = request.amount.to_string();
        let currency = request.currency.to_lowercase();
        let response = self
            .client
            .post(format!("{}/v1/payment_intents", self.api_base))
            .basic_auth(&self.secret_key, None::<&str>)
            .header("Idempotency-Key", request.payment_id.as_str())
            .form(&[
                ("amount", amount.as_str()),
                ("currency", currency.as_str()),
                ("description", request.subject.as_str()),
                ("automatic_payment_methods[enabled]", "true"),
                ("metadata[payment_id]", request.payment_id.as_str()),
                ("metadata[order_number]", request.order_number.as_str()),
            ])
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;
        let response = check_status(PROVIDER, response).await?;
        let intent: PaymentIntent = response
            .json()
            .await
            .map_err(|e| AppError::ProviderRejected(format!("Failed to parse Stripe response: {}", e)))?;

        Ok(CreatePaymentResponse {
            provider_order_id: intent.id,
            transaction_id: intent.latest_charge,
            payment_url: None,
            qr_code_url: None,
            client_token: intent.client_secret,
            expire_time: request.expire_time,
        })
    }

    async fn query_payment(&self, provider_order_id: &str) -> Result<QueryPaymentResponse> {
        let intent = self.fetch_intent(provider_order_id).await?;
        let status = map_intent_status(&intent.status);
        Ok(QueryPaymentResponse {
            status,
            amount: intent.amount_received.filter(|a| *a > 0).unwrap_or(intent.amount),
            payment_time: (status == PaymentStatus::Success)
                .then(|| intent.created.unwrap_or_else(|| chrono::Utc::now().timestamp())),
            transaction_id: intent.latest_charge,
        })
    }

    async fn refund(&self, request: &RefundRequest) -> Result<RefundResponse> {
        let amount = request.amount.to_string();
        let reason = request.reason.as_deref().unwrap_or("");
        let response = self
            .client
            .post(format!("{}/v1/refunds", self.api_base))
            .basic_auth(&self.secret_key, None::<&str>)
            .header("Idempotency-Key", request.refund_no.as_str())
            .form(&[
                ("payment_intent", request.provider_order_id.as_str()),
                ("amount", amount.as_str()),
                ("reason", "requested_by_customer"),
                ("metadata[refund_no]", request.refund_no.as_str()),
                ("metadata[reason]", reason),
            ])
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;
        let response = check_status(PROVIDER, response).await?;
        let refund: StripeRefund = response
            .json()
            .await
            .map_err(|e| AppError::ProviderRejected(format!("Failed to parse Stripe response: {}", e)))?;

        Ok(RefundResponse {
            refund_id: refund.id,
            status: map_refund_status(&refund.status),
            refund_time: refund.created,
        })
    }

    fn handle_callback(&self, body: &[u8]) -> Result<CallbackPayload> {
        let event: StripeEvent =
            serde_json::from_slice(body).map_err(|e| invalid_payload(PROVIDER, e))?;
        if !event.event_type.starts_with("payment_intent.") {
            return Err(invalid_payload(
                PROVIDER,
                format!("unexpected event type {}", event.event_type),
            ));
        }

        let intent = event.data.object;
        let status = map_intent_status(&intent.status);
        Ok(CallbackPayload {
            status,
            amount: intent.amount_received.filter(|a| *a > 0).unwrap_or(intent.amount),
            payment_time: (status == PaymentStatus::Success)
                .then_some(event.created.or(intent.created))
                .flatten(),
            transaction_id: intent.latest_charge,
            provider_order_id: intent.id,
        })
    }

    fn verify_callback(&self, body: &[u8], signature: &str) -> Result<bool> {
        // Stripe signature format: t=timestamp,v1=signature
        let mut timestamp = None;
        let mut sig_v1 = None;
        for part in signature.split(',') {
            if let Some(t) = part.strip_prefix("t=") {
                timestamp = Some(t);
            } else if let Some(s) = part.strip_prefix("v1=") {
                sig_v1 = Some(s);
            }
        }

        let timestamp_str =
            timestamp.ok_or_else(|| AppError::BadRequest(msg::INVALID_SIGNATURE_FORMAT.into()))?;
        let sig_v1 =
            sig_v1.ok_or_else(|| AppError::BadRequest(msg::INVALID_SIGNATURE_FORMAT.into()))?;
        let timestamp: i64 = timestamp_str
            .parse()
            .map_err(|_| AppError::BadRequest(msg::INVALID_SIGNATURE_FORMAT.into()))?;

        if !timestamp_within_tolerance(PROVIDER, timestamp) {
            return Ok(false);
        }

        let mut signed_payload = format!("{}.", timestamp_str).into_bytes();
        signed_payload.extend_from_slice(body);
        let expected = hex::encode(hmac_sha256(self.webhook_secret.as_bytes(), &signed_payload)?);

        Ok(signatures_match(expected.as_bytes(), sig_v1.as_bytes()))
    }
}
