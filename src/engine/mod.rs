//! Business operations.
//!
//! Public operations take the shared [`AppState`](crate::db::AppState) plus the
//! already-resolved user id and read the clock themselves. Most of them
//! delegate to an `*_at` / `*_tx` variant that takes a connection and an
//! explicit `now`, which is what the sweeps and tests drive directly.

pub mod activity;
pub mod callbacks;
pub mod catalog;
pub mod jobs;
pub mod ledger;
pub mod orders;
pub mod subscriptions;

use std::future::Future;

use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::config::EngineSettings;
use crate::error::{AppError, Result};

pub use callbacks::{CallbackOutcome, process_payment_callback};

/// Actor recorded when the engine itself cancels a subscription.
pub const SYSTEM_ACTOR: &str = "system";

/// Rows handled per sweep batch.
pub(crate) const SWEEP_BATCH: i64 = 200;

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Start a write transaction that takes the database write lock up front, so
/// reads inside it cannot go stale before the writes land.
pub(crate) fn begin_immediate(conn: &mut Connection) -> Result<Transaction<'_>> {
    Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
}

/// Call a provider with a per-attempt timeout and bounded retries.
///
/// `on_failure` runs after every failed attempt (before any retry). Only
/// retryable errors are attempted again; the last error is returned as-is.
pub(crate) async fn call_provider<T, F, Fut>(
    settings: &EngineSettings,
    label: &str,
    mut call: F,
    mut on_failure: impl FnMut(&AppError) -> Result<()>,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = settings.provider_max_retries + 1;
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(settings.provider_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(AppError::ProviderUnavailable(format!(
                "{} timed out after {:?}",
                label, settings.provider_timeout
            ))),
        };
        let err = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        on_failure(&err)?;
        if !err.is_retryable() || attempt >= max_attempts {
            return Err(err);
        }
        tracing::warn!(
            "{} failed (attempt {}/{}): {}",
            label,
            attempt,
            max_attempts,
            err
        );
        tokio::time::sleep(settings.retry_backoff * attempt).await;
    }
}
