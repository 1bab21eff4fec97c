// src/subscriptions.rs
//
// Time-locked yield products. One live position per (user, address, symbol);
// the principal stays locked out of spendable until the contract completes.

use serde::Serialize;

use crate::accrual;
use crate::clock::TzMeta;
use crate::config::{Config, ALLOWED_CONTRACT_DAYS};
use crate::db::{Database, DebitOutcome, SubscriptionRow};
use crate::error::{CoreError, CoreResult};
use crate::utils::{add_days, date_str};

#[derive(Debug, Serialize)]
pub struct SubscriptionView {
    #[serde(flatten)]
    pub row: SubscriptionRow,
    /// Ledger profit posted for today so far.
    pub profit_today: f64,
    /// Full-day figure today converges to.
    pub profit_per_day: f64,
}

/// Open (or replace) the position for `symbol` funded from `address`.
/// The daily rate comes from the contract-length step table; the start is
/// today in business time and the window spans `contract_days` calendar
/// days inclusive.
pub fn subscribe(
    db: &Database,
    config: &Config,
    meta: TzMeta,
    user_id: i64,
    address: &str,
    symbol: &str,
    amount_usdt: f64,
    contract_days: i64,
) -> CoreResult<i64> {
    let symbol = symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return Err(CoreError::validation("symbol must not be empty"));
    }
    if !amount_usdt.is_finite() || amount_usdt <= 0.0 {
        return Err(CoreError::validation("amount must be positive"));
    }
    if !ALLOWED_CONTRACT_DAYS.contains(&contract_days) {
        return Err(CoreError::validation("contract length must be 7, 15, 30 or 60 days"));
    }

    let rate_daily = config.rate_for_contract_days(contract_days);
    let start = meta.today;
    let end = add_days(start, contract_days - 1);

    match db.create_subscription_checked(
        user_id,
        address,
        &symbol,
        amount_usdt,
        "USDT",
        contract_days,
        rate_daily,
        &date_str(start),
        &date_str(end),
    )? {
        DebitOutcome::Inserted(id) => {
            log::info!(
                "user {} subscribed {} USDT to {} for {} days at {}/day",
                user_id, amount_usdt, symbol, contract_days, rate_daily
            );
            Ok(id)
        }
        DebitOutcome::Insufficient { spendable } => Err(CoreError::InsufficientFunds { spendable }),
    }
}

pub fn list(
    db: &Database,
    meta: TzMeta,
    user_id: i64,
    address: Option<&str>,
) -> CoreResult<Vec<SubscriptionView>> {
    let today = date_str(meta.today);
    let rows = db.list_subscriptions(user_id, address)?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let in_window = row.status == "active"
            && row.start_date.as_str() <= today.as_str()
            && row.end_date.as_str() >= today.as_str();
        let profit_today = if in_window {
            db.profit_sum_for_day(user_id, &row.from_address, &today)?
        } else {
            0.0
        };
        let profit_per_day = row.amount_usdt * row.rate_daily;
        out.push(SubscriptionView {
            row,
            profit_today,
            profit_per_day,
        });
    }
    Ok(out)
}

pub fn pause(db: &Database, user_id: i64, address: &str, symbol: &str) -> CoreResult<()> {
    set_status(db, user_id, address, symbol, "paused", &["active"])
}

pub fn resume(db: &Database, user_id: i64, address: &str, symbol: &str) -> CoreResult<()> {
    set_status(db, user_id, address, symbol, "active", &["paused"])
}

/// Cancelling releases the principal back into spendable; posted profit
/// stays on the ledger.
pub fn cancel(db: &Database, user_id: i64, address: &str, symbol: &str) -> CoreResult<()> {
    set_status(db, user_id, address, symbol, "canceled", &["active", "paused"])
}

// Completion belongs to the accrual engine alone; user-facing transitions
// move between active, paused and canceled.
fn set_status(
    db: &Database,
    user_id: i64,
    address: &str,
    symbol: &str,
    to: &str,
    from: &[&str],
) -> CoreResult<()> {
    let rows = db.list_subscriptions(user_id, Some(address))?;
    let current = rows
        .iter()
        .find(|r| r.symbol == symbol)
        .ok_or_else(|| CoreError::validation("no such subscription"))?;
    if !from.contains(&current.status.as_str()) {
        return Err(CoreError::conflict(format!(
            "subscription is {}, cannot move to {}",
            current.status, to
        )));
    }
    db.set_subscription_status(user_id, address, symbol, to)?;
    Ok(())
}

/* ------------------------------ profit views ------------------------------ */

#[derive(Debug, Serialize)]
pub struct ProfitToday {
    /// Full-day target across active in-window subscriptions.
    pub expected: f64,
    /// What the ledger holds for today so far.
    pub credited: f64,
    pub remaining: f64,
    /// Fraction of the business day elapsed.
    pub fraction: f64,
}

pub fn profit_today(db: &Database, meta: TzMeta, user_id: i64, address: &str) -> CoreResult<ProfitToday> {
    let today = date_str(meta.today);
    let expected = db.expected_profit_for_day(user_id, address, &today)?;
    let credited = db.profit_sum_for_day(user_id, address, &today)?;
    Ok(ProfitToday {
        expected,
        credited,
        remaining: (expected - credited).max(0.0),
        fraction: meta.frac,
    })
}

#[derive(Debug, Serialize)]
pub struct ProfitSummary {
    pub lifetime: f64,
    pub today: f64,
    pub expected_today: f64,
}

/// Runs both posters synchronously first, so the figures are current even
/// when the interval tickers have not caught up yet.
pub fn profit_summary(
    db: &Database,
    config: &Config,
    meta: TzMeta,
    user_id: i64,
    address: &str,
) -> CoreResult<ProfitSummary> {
    accrual::run_daily_accrual(db, config, meta)?;
    accrual::run_realtime_poster(db, config, meta)?;

    let today = date_str(meta.today);
    Ok(ProfitSummary {
        lifetime: db.profit_sum(user_id, address)?,
        today: db.profit_sum_for_day(user_id, address, &today)?,
        expected_today: db.expected_profit_for_day(user_id, address, &today)?,
    })
}
