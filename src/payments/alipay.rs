use std::collections::BTreeMap;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use reqwest::Client;
use serde_json::{Value, json};

use crate::config::AlipayConfig;
use crate::error::{AppError, Result};
use crate::models::{PaymentScene, PaymentStatus};

use super::{
    CallbackPayload, CreatePaymentRequest, CreatePaymentResponse, PaymentGateway,
    QueryPaymentResponse, RefundRequest, RefundResponse, RefundStatus, check_status, format_major,
    hmac_sha256, invalid_payload, parse_major, signatures_match, transport_error,
};

const PROVIDER: &str = "alipay";
const SIGN_TYPE: &str = "HMAC-SHA256";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Gateway business code for a successful call
const CODE_SUCCESS: &str = "10000";
/// Gateway business code for "service temporarily unavailable"
const CODE_UNAVAILABLE: &str = "20000";

/// Wallet gateway using the open-platform form API. The local payment id is
/// the merchant trade number (`out_trade_no`), so it doubles as the provider
/// order id.
#[derive(Debug, Clone)]
pub struct AlipayGateway {
    client: Client,
    app_id: String,
    sign_key: String,
    gateway_url: String,
}

/// Timestamps on the wire are Beijing time without an offset.
fn beijing() -> FixedOffset {
    FixedOffset::east_opt(8 * 3600).unwrap_or_else(|| Utc.fix())
}

fn format_time(ts: i64) -> String {
    beijing()
        .timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format(TIME_FORMAT).to_string())
        .unwrap_or_default()
}

fn parse_time(s: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(s, TIME_FORMAT)
        .ok()?
        .and_local_timezone(beijing())
        .single()
        .map(|dt| dt.timestamp())
}

pub(crate) fn map_trade_status(status: &str) -> PaymentStatus {
    match status {
        "TRADE_SUCCESS" | "TRADE_FINISHED" => PaymentStatus::Success,
        "TRADE_CLOSED" => PaymentStatus::Canceled,
        "WAIT_BUYER_PAY" => PaymentStatus::Pending,
        _ => PaymentStatus::Failed,
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

impl AlipayGateway {
    pub fn new(config: &AlipayConfig, client: Client) -> Self {
        Self {
            client,
            app_id: config.app_id.clone(),
            sign_key: config.sign_key.clone(),
            gateway_url: config.gateway_url.clone(),
        }
    }

    /// Sign the raw (unencoded) `k=v` pairs in key order. `sign`, `sign_type`
    /// and empty values are not part of the signed content.
    fn sign(&self, params: &BTreeMap<String, String>) -> Result<String> {
        let content = params
            .iter()
            .filter(|(k, v)| k.as_str() != "sign" && k.as_str() != "sign_type" && !v.is_empty())
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        Ok(hex::encode(hmac_sha256(self.sign_key.as_bytes(), content.as_bytes())?))
    }

    fn signed_params(
        &self,
        method: &str,
        biz_content: &Value,
        notify_url: Option<&str>,
        return_url: Option<&str>,
    ) -> Result<BTreeMap<String, String>> {
        let mut params = BTreeMap::new();
        params.insert("app_id".to_string(), self.app_id.clone());
        params.insert("method".to_string(), method.to_string());
        params.insert("charset".to_string(), "utf-8".to_string());
        params.insert("sign_type".to_string(), SIGN_TYPE.to_string());
        params.insert(
            "timestamp".to_string(),
            format_time(Utc::now().timestamp()),
        );
        params.insert("version".to_string(), "1.0".to_string());
        params.insert("biz_content".to_string(), biz_content.to_string());
        if let Some(url) = notify_url {
            params.insert("notify_url".to_string(), url.to_string());
        }
        if let Some(url) = return_url {
            params.insert("return_url".to_string(), url.to_string());
        }
        let sign = self.sign(&params)?;
        params.insert("sign".to_string(), sign);
        Ok(params)
    }

    /// POST a signed API call and unwrap its `<method>_response` envelope.
    async fn call(&self, method: &str, biz_content: Value, notify_url: Option<&str>) -> Result<Value> {
        let params = self.signed_params(method, &biz_content, notify_url, None)?;
        let response = self
            .client
            .post(&self.gateway_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;
        let response = check_status(PROVIDER, response).await?;
        let mut body: Value = response
            .json()
            .await
            .map_err(|e| AppError::ProviderRejected(format!("Failed to parse Alipay response: {}", e)))?;

        let key = format!("{}_response", method.replace('.', "_"));
        let inner = body
            .get_mut(&key)
            .map(Value::take)
            .ok_or_else(|| AppError::ProviderRejected(format!("Alipay response missing {}", key)))?;

        match str_field(&inner, "code").unwrap_or_default() {
            CODE_SUCCESS => Ok(inner),
            CODE_UNAVAILABLE => Err(AppError::ProviderUnavailable(format!(
                "alipay {} temporarily unavailable",
                method
            ))),
            code => Err(AppError::ProviderRejected(format!(
                "alipay {} failed with {} {}",
                method,
                code,
                str_field(&inner, "sub_code").unwrap_or_default()
            ))),
        }
    }
}

#[async_trait]
impl PaymentGateway for AlipayGateway {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    /// The signature travels inside the form body.
    fn extract_signature(&self, _headers: &HeaderMap, body: &[u8]) -> Option<String> {
        url::form_urlencoded::parse(body)
            .find(|(k, _)| k == "sign")
            .map(|(_, v)| v.into_owned())
    }

    async fn create_payment(&self, request: &CreatePaymentRequest) -> Result<CreatePaymentResponse> {
        let mut biz = json!({
            "out_trade_no": request.payment_id,
            "total_amount": format_major(request.amount),
            "subject": request.subject,
            "time_expire": format_time(request.expire_time),
        });

        let (payment_url, qr_code_url, client_token) = match request.scene {
            PaymentScene::Web => {
                biz["product_code"] = json!("FAST_INSTANT_TRADE_PAY");
                let params = self.signed_params(
                    "alipay.trade.page.pay",
                    &biz,
                    Some(&request.notify_url),
                    request.return_url.as_deref(),
                )?;
                let url = url::Url::parse_with_params(&self.gateway_url, &params)
                    .map_err(|e| AppError::Internal(format!("Invalid Alipay gateway URL: {}", e)))?;
                (Some(url.to_string()), None, None)
            }
            PaymentScene::App => {
                biz["product_code"] = json!("QUICK_MSECURITY_PAY");
                let params =
                    self.signed_params("alipay.trade.app.pay", &biz, Some(&request.notify_url), None)?;
                let order_string = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(params.iter())
                    .finish();
                (None, None, Some(order_string))
            }
            PaymentScene::Qr => {
                let inner = self
                    .call("alipay.trade.precreate", biz, Some(&request.notify_url))
                    .await?;
                let qr = str_field(&inner, "qr_code")
                    .ok_or_else(|| AppError::ProviderRejected("Alipay precreate returned no qr_code".into()))?;
                (None, Some(qr.to_string()), None)
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
        let inner = self
            .call(
                "alipay.trade.query",
                json!({ "out_trade_no": provider_order_id }),
                None,
            )
            .await?;

        let status = map_trade_status(str_field(&inner, "trade_status").unwrap_or_default());
        Ok(QueryPaymentResponse {
            status,
            amount: str_field(&inner, "total_amount")
                .and_then(parse_major)
                .unwrap_or_default(),
            payment_time: str_field(&inner, "send_pay_date").and_then(parse_time),
            transaction_id: str_field(&inner, "trade_no").map(str::to_string),
        })
    }

    async fn refund(&self, request: &RefundRequest) -> Result<RefundResponse> {
        let inner = self
            .call(
                "alipay.trade.refund",
                json!({
                    "out_trade_no": request.provider_order_id,
                    "refund_amount": format_major(request.amount),
                    "out_request_no": request.refund_no,
                    "refund_reason": request.reason.as_deref().unwrap_or_default(),
                }),
                None,
            )
            .await?;

        let status = match str_field(&inner, "fund_change") {
            Some("Y") => RefundStatus::Success,
            _ => RefundStatus::Pending,
        };
        Ok(RefundResponse {
            refund_id: request.refund_no.clone(),
            status,
            refund_time: str_field(&inner, "gmt_refund_pay").and_then(parse_time),
        })
    }

    fn handle_callback(&self, body: &[u8]) -> Result<CallbackPayload> {
        let fields: BTreeMap<String, String> = url::form_urlencoded::parse(body).into_owned().collect();
        let field = |key: &str| fields.get(key).filter(|v| !v.is_empty());

        let provider_order_id = field("out_trade_no")
            .ok_or_else(|| invalid_payload(PROVIDER, "missing out_trade_no"))?
            .clone();
        let trade_status = field("trade_status")
            .ok_or_else(|| invalid_payload(PROVIDER, "missing trade_status"))?;
        let amount = field("total_amount")
            .and_then(|a| parse_major(a))
            .ok_or_else(|| invalid_payload(PROVIDER, "invalid total_amount"))?;

        Ok(CallbackPayload {
            provider_order_id,
            status: map_trade_status(trade_status),
            amount,
            payment_time: field("gmt_payment").and_then(|t| parse_time(t)),
            transaction_id: field("trade_no").cloned(),
        })
    }

    fn verify_callback(&self, body: &[u8], signature: &str) -> Result<bool> {
        let fields: BTreeMap<String, String> = url::form_urlencoded::parse(body).into_owned().collect();
        let expected = self.sign(&fields)?;
        Ok(signatures_match(expected.as_bytes(), signature.as_bytes()))
    }
}
