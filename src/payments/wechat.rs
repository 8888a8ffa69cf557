use async_trait::async_trait;
use axum::http::HeaderMap;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::config::WechatConfig;
use crate::error::{AppError, Result, msg};
use crate::models::{PaymentScene, PaymentStatus};

use super::{
    CallbackPayload, CreatePaymentRequest, CreatePaymentResponse, PaymentGateway,
    QueryPaymentResponse, RefundRequest, RefundResponse, RefundStatus, check_status, hmac_sha256,
    invalid_payload, signatures_match, timestamp_within_tolerance, transport_error,
};

const PROVIDER: &str = "wechat";
const AUTH_SCHEME: &str = "WECHATPAY2-HMAC-SHA256";

/// Wallet gateway using the v3 JSON API. Like Alipay, the local payment id is
/// sent as `out_trade_no` and used as the provider order id.
#[derive(Debug, Clone)]
pub struct WechatGateway {
    client: Client,
    app_id: String,
    mch_id: String,
    api_key: String,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct Amount {
    total: i64,
}

/// Trade state as returned by the query endpoint and carried by notifications.
#[derive(Debug, Deserialize)]
struct Transaction {
    out_trade_no: String,
    #[serde(default)]
    transaction_id: Option<String>,
    #[serde(default)]
    trade_state: Option<String>,
    /// Older notification format
    #[serde(default)]
    result_code: Option<String>,
    amount: Amount,
    #[serde(default)]
    success_time: Option<String>,
}

impl Transaction {
    fn status(&self) -> PaymentStatus {
        map_trade_state(
            self.trade_state
                .as_deref()
                .or(self.result_code.as_deref())
                .unwrap_or_default(),
        )
    }

    fn payment_time(&self) -> Option<i64> {
        self.success_time.as_deref().and_then(parse_rfc3339)
    }
}

#[derive(Debug, Deserialize)]
struct Refund {
    refund_id: String,
    status: String,
    #[serde(default)]
    success_time: Option<String>,
}

pub(crate) fn map_trade_state(state: &str) -> PaymentStatus {
    match state {
        "SUCCESS" => PaymentStatus::Success,
        "CLOSED" | "REVOKED" => PaymentStatus::Canceled,
        "NOTPAY" | "USERPAYING" => PaymentStatus::Pending,
        _ => PaymentStatus::Failed,
    }
}

fn parse_rfc3339(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.timestamp())
}

fn format_rfc3339(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// Message signed for notifications: `timestamp\nnonce\nbody\n`.
fn notification_message(timestamp: &str, nonce: &str, body: &[u8]) -> Vec<u8> {
    let mut message = format!("{}\n{}\n", timestamp, nonce).into_bytes();
    message.extend_from_slice(body);
    message.push(b'\n');
    message
}

impl WechatGateway {
    pub fn new(config: &WechatConfig, client: Client) -> Self {
        Self {
            client,
            app_id: config.app_id.clone(),
            mch_id: config.mch_id.clone(),
            api_key: config.api_key.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
        }
    }

    /// `Authorization` header for one request. The signed message is
    /// `METHOD\npath\ntimestamp\nnonce\nbody\n`.
    fn authorization(&self, method: &Method, path: &str, body: &str) -> Result<String> {
        let timestamp = Utc::now().timestamp();
        let nonce = Uuid::new_v4().as_simple().to_string();
        let message = format!("{}\n{}\n{}\n{}\n{}\n", method, path, timestamp, nonce, body);
        let signature = STANDARD.encode(hmac_sha256(self.api_key.as_bytes(), message.as_bytes())?);
        Ok(format!(
            "{} mchid=\"{}\",nonce_str=\"{}\",timestamp=\"{}\",signature=\"{}\"",
            AUTH_SCHEME, self.mch_id, nonce, timestamp, signature
        ))
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T> {
        let body = body.map(|b| b.to_string()).unwrap_or_default();
        let authorization = self.authorization(&method, path, &body)?;

        let mut request = self
            .client
            .request(method, format!("{}{}", self.api_base, path))
            .header("Authorization", authorization)
            .header("Accept", "application/json");
        if !body.is_empty() {
            request = request.header("Content-Type", "application/json").body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;
        let response = check_status(PROVIDER, response).await?;
        response
            .json()
            .await
            .map_err(|e| AppError::ProviderRejected(format!("Failed to parse WeChat Pay response: {}", e)))
    }
}

#[async_trait]
impl PaymentGateway for WechatGateway {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    /// Folds the three signature headers into `t=..,n=..,s=..`.
    fn extract_signature(&self, headers: &HeaderMap, _body: &[u8]) -> Option<String> {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        let timestamp = header("wechatpay-timestamp")?;
        let nonce = header("wechatpay-nonce")?;
        let signature = header("wechatpay-signature")?;
        Some(format!("t={},n={},s={}", timestamp, nonce, signature))
    }

    async fn create_payment(&self, request: &CreatePaymentRequest) -> Result<CreatePaymentResponse> {
        let mut body = json!({
            "appid": self.app_id,
            "mchid": self.mch_id,
            "description": request.subject,
            "out_trade_no": request.payment_id,
            "time_expire": format_rfc3339(request.expire_time),
            "notify_url": request.notify_url,
            "amount": { "total": request.amount, "currency": request.currency },
        });

        let (payment_url, qr_code_url, client_token) = match request.scene {
            PaymentScene::Qr => {
                let response: Value = self
                    .send(Method::POST, "/v3/pay/transactions/native", Some(body))
                    .await?;
                let code_url = response
                    .get("code_url")
                    .and_then(Value::as_str)
                    .ok_or_else(|| AppError::ProviderRejected("WeChat Pay returned no code_url".into()))?;
                (None, Some(code_url.to_string()), None)
            }
            PaymentScene::Web => {
                body["scene_info"] = json!({
                    "payer_client_ip": "127.0.0.1",
                    "h5_info": { "type": "Wap" },
                });
                let response: Value = self
                    .send(Method::POST, "/v3/pay/transactions/h5", Some(body))
                    .await?;
                let h5_url = response
                    .get("h5_url")
                    .and_then(Value::as_str)
                    .ok_or_else(|| AppError::ProviderRejected("WeChat Pay returned no h5_url".into()))?;
                (Some(h5_url.to_string()), None, None)
            }
            PaymentScene::App => {
                let response: Value = self
                    .send(Method::POST, "/v3/pay/transactions/app", Some(body))
                    .await?;
                let prepay_id = response
                    .get("prepay_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| AppError::ProviderRejected("WeChat Pay returned no prepay_id".into()))?;
                (None, None, Some(prepay_id.to_string()))
            }
        };

        Ok(CreatePaymentResponse {
            provider_order_id: request.payment_id.clone(),
            transaction_id: None,
            payment_url,
            qr_code_url,
            client_token,
            expire_time: request.expire_time,
        })
    }

    async fn query_payment(&self, provider_order_id: &str) -> Result<QueryPaymentResponse> {
        let path = format!(
            "/v3/pay/transactions/out-trade-no/{}?mchid={}",
            provider_order_id, self.mch_id
        );
        let tx: Transaction = self.send(Method::GET, &path, None).await?;
        Ok(QueryPaymentResponse {
            status: tx.status(),
            amount: tx.amount.total,
            payment_time: tx.payment_time(),
            transaction_id: tx.transaction_id,
        })
    }

    async fn refund(&self, request: &RefundRequest) -> Result<RefundResponse> {
        let body = json!({
            "out_trade_no": request.provider_order_id,
            "out_refund_no": request.refund_no,
            "reason": request.reason,
            "amount": {
                "refund": request.amount,
                "total": request.total_amount,
                "currency": request.currency,
            },
        });
        let refund: Refund = self
            .send(Method::POST, "/v3/refund/domestic/refunds", Some(body))
            .await?;

        let status = match refund.status.as_str() {
            "SUCCESS" => RefundStatus::Success,
            "PROCESSING" => RefundStatus::Pending,
            _ => RefundStatus::Failed,
        };
        Ok(RefundResponse {
            refund_id: refund.refund_id,
            status,
            refund_time: refund.success_time.as_deref().and_then(parse_rfc3339),
        })
    }

    fn handle_callback(&self, body: &[u8]) -> Result<CallbackPayload> {
        let tx: Transaction =
            serde_json::from_slice(body).map_err(|e| invalid_payload(PROVIDER, e))?;
        if tx.trade_state.is_none() && tx.result_code.is_none() {
            return Err(invalid_payload(PROVIDER, "missing trade_state"));
        }
        Ok(CallbackPayload {
            status: tx.status(),
            amount: tx.amount.total,
            payment_time: tx.payment_time(),
            transaction_id: tx.transaction_id,
            provider_order_id: tx.out_trade_no,
        })
    }

    fn verify_callback(&self, body: &[u8], signature: &str) -> Result<bool> {
        let mut timestamp = None;
        let mut nonce = None;
        let mut sig = None;
        for part in signature.split(',') {
            if let Some(t) = part.strip_prefix("t=") {
                timestamp = Some(t);
            } else if let Some(n) = part.strip_prefix("n=") {
                nonce = Some(n);
            } else if let Some(s) = part.strip_prefix("s=") {
                sig = Some(s);
            }
        }

        let (Some(timestamp_str), Some(nonce), Some(sig)) = (timestamp, nonce, sig) else {
            return Err(AppError::BadRequest(msg::INVALID_SIGNATURE_FORMAT.into()));
        };
        let timestamp: i64 = timestamp_str
            .parse()
            .map_err(|_| AppError::BadRequest(msg::INVALID_SIGNATURE_FORMAT.into()))?;

        if !timestamp_within_tolerance(PROVIDER, timestamp) {
            return Ok(false);
        }

        let message = notification_message(timestamp_str, nonce, body);
        let expected = STANDARD.encode(hmac_sha256(self.api_key.as_bytes(), &message)?);
        Ok(signatures_match(expected.as_bytes(), sig.as_bytes()))
    }
}
