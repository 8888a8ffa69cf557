//! Periodic maintenance: order expiry, payment reconciliation, subscription
//! expiry, renewal orders and trial notices.

use std::time::Duration;

use serde::Serialize;

use crate::db::AppState;
use crate::error::Result;

use super::ledger::{self, ReconcileSummary};
use super::{now, orders, subscriptions};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub orders_expired: usize,
    pub payments: ReconcileSummary,
    pub subscriptions_expired: usize,
    pub renewal_orders: usize,
    pub trial_notices: usize,
}

impl SweepReport {
    fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

/// Run every sweep once at `now`. Each step is independent: one failing is
/// logged and the rest still run.
pub async fn run_sweeps_at(state: &AppState, now: i64) -> SweepReport {
    let mut report = SweepReport::default();

    match with_conn(state, |conn| orders::expire_orders_at(conn, now)) {
        Ok(n) => report.orders_expired = n,
        Err(e) => tracing::warn!("Order expiry sweep failed: {}", e),
    }

    match ledger::reconcile_payments_at(state, now).await {
        Ok(summary) => report.payments = summary,
        Err(e) => tracing::warn!("Payment reconcile sweep failed: {}", e),
    }

    match with_conn(state, |conn| subscriptions::expire_subscriptions_at(conn, now)) {
        Ok(n) => report.subscriptions_expired = n,
        Err(e) => tracing::warn!("Subscription expiry sweep failed: {}", e),
    }

    match with_conn(state, |conn| subscriptions::auto_renew_at(conn, &state.settings, now)) {
        Ok(n) => report.renewal_orders = n,
        Err(e) => tracing::warn!("Auto-renew sweep failed: {}", e),
    }

    match with_conn(state, |conn| subscriptions::notify_trials_ending_at(conn, &state.settings, now)) {
        Ok(n) => report.trial_notices = n,
        Err(e) => tracing::warn!("Trial notice sweep failed: {}", e),
    }

    report
}

pub async fn run_sweeps(state: &AppState) -> SweepReport {
    run_sweeps_at(state, now()).await
}

fn with_conn<T>(state: &AppState, f: impl FnOnce(&mut rusqlite::Connection) -> Result<T>) -> Result<T> {
    let mut conn = state.db.get()?;
    f(&mut conn)
}

/// Spawns the background sweeper. Runs every `interval` until the process
/// exits.
pub fn spawn_sweeper(state: AppState, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            let report = run_sweeps(&state).await;
            if report.is_empty() {
                tracing::trace!("Sweep found nothing to do");
            } else {
                tracing::debug!("Sweep finished: {:?}", report);
            }
        }
    });

    tracing::info!("Background sweeper started (runs every {:?})", interval);
}
