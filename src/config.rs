use std::env;
use std::time::Duration;

/// Stripe (card gateway) credentials.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub api_base: String,
}

/// Alipay (domestic wallet A) credentials.
#[derive(Debug, Clone)]
pub struct AlipayConfig {
    pub app_id: String,
    pub sign_key: String,
    pub gateway_url: String,
}

/// WeChat Pay (domestic wallet B) credentials.
#[derive(Debug, Clone)]
pub struct WechatConfig {
    pub app_id: String,
    pub mch_id: String,
    pub api_key: String,
    pub api_base: String,
}

/// App Store (platform store) credentials.
#[derive(Debug, Clone)]
pub struct AppleConfig {
    pub bundle_id: String,
    pub shared_secret: String,
}

/// Knobs the engine reads at runtime. Built once at startup and shared
/// through `AppState`.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// How long a pending order may wait for payment
    pub order_ttl_secs: i64,
    /// Upper bound for a single provider call
    pub provider_timeout: Duration,
    /// Extra attempts after the first failed provider call
    pub provider_max_retries: u32,
    /// Delay before retry N is `retry_backoff * N`
    pub retry_backoff: Duration,
    /// Age after which a pending payment record is reconciled against the provider
    pub reconcile_grace_secs: i64,
    /// Auto-renew subscriptions ending within this window
    pub renew_window_secs: i64,
    /// Warn about trials ending within this window
    pub trial_notice_secs: i64,
    /// Base URL providers call back to (`{base}/webhook/{provider}`)
    pub base_url: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            order_ttl_secs: 30 * 60,
            provider_timeout: Duration::from_secs(10),
            provider_max_retries: 2,
            retry_backoff: Duration::from_millis(200),
            reconcile_grace_secs: 10 * 60,
            renew_window_secs: 24 * 60 * 60,
            trial_notice_secs: 3 * 24 * 60 * 60,
            base_url: "http://127.0.0.1:3000".to_string(),
        }
    }
}

impl EngineSettings {
    pub fn notify_url(&self, provider: &str) -> String {
        format!("{}/webhook/{}", self.base_url, provider)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: String,
    pub dev_mode: bool,
    /// Interval between background sweep runs
    pub sweep_interval: Duration,
    pub engine: EngineSettings,
    pub stripe: Option<StripeConfig>,
    pub alipay: Option<AlipayConfig>,
    pub wechat: Option<WechatConfig>,
    pub apple: Option<AppleConfig>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let dev_mode = env::var("PAYFLOW_ENV")
            .map(|v| v == "dev" || v == "development")
            .unwrap_or(false);

        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port: u16 = env_parse("PORT", 3000);
        let base_url = env::var("BASE_URL").unwrap_or_else(|_| format!("http://{}:{}", host, port));

        let defaults = EngineSettings::default();
        let engine = EngineSettings {
            order_ttl_secs: env_parse("ORDER_TTL_SECS", defaults.order_ttl_secs),
            provider_timeout: Duration::from_secs(env_parse("PROVIDER_TIMEOUT_SECS", 10)),
            provider_max_retries: env_parse("PROVIDER_MAX_RETRIES", defaults.provider_max_retries),
            retry_backoff: Duration::from_millis(env_parse("PROVIDER_RETRY_BACKOFF_MS", 200)),
            reconcile_grace_secs: env_parse("RECONCILE_GRACE_SECS", defaults.reconcile_grace_secs),
            renew_window_secs: env_parse("RENEW_WINDOW_SECS", defaults.renew_window_secs),
            trial_notice_secs: env_parse("TRIAL_NOTICE_SECS", defaults.trial_notice_secs),
            base_url,
        };

        let stripe = match (env::var("STRIPE_SECRET_KEY"), env::var("STRIPE_WEBHOOK_SECRET")) {
            (Ok(secret_key), Ok(webhook_secret)) => Some(StripeConfig {
                secret_key,
                webhook_secret,
                api_base: env::var("STRIPE_API_BASE")
                    .unwrap_or_else(|_| "https://api.stripe.com".to_string()),
            }),
            _ => None,
        };

        let alipay = match (env::var("ALIPAY_APP_ID"), env::var("ALIPAY_SIGN_KEY")) {
            (Ok(app_id), Ok(sign_key)) => Some(AlipayConfig {
                app_id,
                sign_key,
                gateway_url: env::var("ALIPAY_GATEWAY_URL")
                    .unwrap_or_else(|_| "https://openapi.alipay.com/gateway.do".to_string()),
            }),
            _ => None,
        };

        let wechat = match (
            env::var("WECHAT_APP_ID"),
            env::var("WECHAT_MCH_ID"),
            env::var("WECHAT_API_KEY"),
        ) {
            (Ok(app_id), Ok(mch_id), Ok(api_key)) => Some(WechatConfig {
                app_id,
                mch_id,
                api_key,
                api_base: env::var("WECHAT_API_BASE")
                    .unwrap_or_else(|_| "https://api.mch.weixin.qq.com".to_string()),
            }),
            _ => None,
        };

        let apple = match (env::var("APPLE_BUNDLE_ID"), env::var("APPLE_SHARED_SECRET")) {
            (Ok(bundle_id), Ok(shared_secret)) => Some(AppleConfig {
                bundle_id,
                shared_secret,
            }),
            _ => None,
        };

        Self {
            host,
            port,
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "payflow.db".to_string()),
            dev_mode,
            sweep_interval: Duration::from_secs(env_parse("SWEEP_INTERVAL_SECS", 60)),
            engine,
            stripe,
            alipay,
            wechat,
            apple,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
