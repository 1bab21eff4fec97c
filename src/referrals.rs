// src/referrals.rs
use rusqlite::Transaction;
use serde::Serialize;

use crate::config::Config;
use crate::db::{CommissionRow, Database, ReferredUserRow};
use crate::error::{CoreError, CoreResult};
use crate::utils;

/// Resolved uplines for a profit source: level 1 is the direct referrer,
/// level 2 the referrer's referrer. The relation graph is acyclic by
/// construction (a user can never become their own ancestor), and the
/// lookup stops at depth 2 because the commission rate table only has two
/// tiers.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Uplines {
    pub level1: Option<i64>,
    pub level2: Option<i64>,
}

pub fn find_uplines(db: &Database, source_user_id: i64) -> CoreResult<Uplines> {
    let level1 = db.referrer_of(source_user_id)?;
    let level2 = match level1 {
        Some(l1) => db.referrer_of(l1)?,
        None => None,
    };
    Ok(Uplines { level1, level2 })
}

fn upsert_commission(
    db: &Database,
    earner_id: i64,
    source_user_id: i64,
    tier: i64,
    day: &str,
    amount: f64,
    additive: bool,
) -> CoreResult<()> {
    if amount <= 0.0 {
        return Ok(());
    }
    if additive {
        db.upsert_commission_add(earner_id, source_user_id, tier, day, amount)?;
    } else {
        db.upsert_commission_set(earner_id, source_user_id, tier, day, amount)?;
    }
    Ok(())
}

/// Additive mode: the daily catch-up poster contributes one day's freshly
/// inserted credit as a delta.
pub fn credit_referral_delta(
    db: &Database,
    config: &Config,
    source_user_id: i64,
    day: &str,
    delta_profit: f64,
) -> CoreResult<()> {
    let up = find_uplines(db, source_user_id)?;
    if let Some(l1) = up.level1 {
        upsert_commission(db, l1, source_user_id, 1, day, delta_profit * config.ref_l1_rate, true)?;
    }
    if let Some(l2) = up.level2 {
        upsert_commission(db, l2, source_user_id, 2, day, delta_profit * config.ref_l2_rate, true)?;
    }
    Ok(())
}

/// Absolute mode: the realtime poster republishes the source's whole-day
/// profit total, so the commission row self-corrects however many times the
/// tick re-runs.
pub fn credit_referral_absolute(
    db: &Database,
    config: &Config,
    source_user_id: i64,
    day: &str,
    total_profit_for_day: f64,
) -> CoreResult<()> {
    let up = find_uplines(db, source_user_id)?;
    if let Some(l1) = up.level1 {
        upsert_commission(db, l1, source_user_id, 1, day, total_profit_for_day * config.ref_l1_rate, false)?;
    }
    if let Some(l2) = up.level2 {
        upsert_commission(db, l2, source_user_id, 2, day, total_profit_for_day * config.ref_l2_rate, false)?;
    }
    Ok(())
}

/// Re-rate one day's commissions for every user who had profit that day.
/// Used after a tier-rate change; paid rows stay untouched.
pub fn rerate_day(db: &Database, config: &Config, day: &str) -> CoreResult<usize> {
    let uids = db.users_with_profit_on(day)?;
    for &uid in &uids {
        let total = db.user_profit_for_day(uid, day)?;
        credit_referral_absolute(db, config, uid, day, total)?;
    }
    Ok(uids.len())
}

/* ------------------------------ codes & links ------------------------------ */

/// Unique generated code; first tries a readable U<uid>XXX shape, then
/// falls back to longer random codes.
pub fn generate_unique_code_tx(tx: &Transaction, user_id: i64) -> rusqlite::Result<String> {
    for attempt in 0..20 {
        let base = if attempt < 10 {
            format!("U{}{}", user_id, utils::random_code(3))
        } else {
            utils::random_code(10)
        };
        let code: String = base.chars().take(12).collect::<String>().to_uppercase();
        if !Database::code_exists_tx(tx, &code)? {
            return Ok(code);
        }
    }
    // 20 collisions in a row means the readable space around this uid is
    // exhausted; degrade to uid + random tail.
    Ok(format!("U{}{}", user_id, utils::random_code(6)))
}

/// Create-if-missing for a user's code outside a registration transaction.
pub fn ensure_referral_code(db: &Database, user_id: i64) -> CoreResult<String> {
    if let Some((code, _)) = db.referral_code_of(user_id)? {
        return Ok(code);
    }
    let code = {
        let mut conn = db.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let code = generate_unique_code_tx(&tx, user_id)?;
        Database::insert_referral_code_tx(&tx, user_id, &code)?;
        tx.commit()?;
        code
    };
    Ok(code)
}

/// Claim a custom code. Empty input returns the existing (or a fresh
/// generated) code; a clash with another user's code is a Conflict.
pub fn claim_code(db: &Database, user_id: i64, desired: &str) -> CoreResult<String> {
    let desired = desired.trim().to_uppercase();
    if desired.is_empty() {
        return ensure_referral_code(db, user_id);
    }
    if !utils::is_valid_referral_code(&desired) {
        return Err(CoreError::validation("referral code must be 4-32 chars A-Z 0-9 _ -"));
    }
    db.claim_referral_code(user_id, &desired)
        .map_err(|e| CoreError::from_store_unique(e, "referral code already taken"))?;
    Ok(desired)
}

/// Attribute the referral edge during signup, inside the registration
/// transaction. Silently skips invalid/unknown codes and self-referral;
/// signup must not fail because a code went stale.
pub fn attribute_referral_tx(
    tx: &Transaction,
    new_user_id: i64,
    referral_code: Option<&str>,
) -> rusqlite::Result<Option<i64>> {
    let code = match referral_code {
        Some(c) => c.trim().to_uppercase(),
        None => return Ok(None),
    };
    if !utils::is_valid_referral_code(&code) {
        return Ok(None);
    }
    let referrer_id = match Database::code_owner_tx(tx, &code)? {
        Some(id) if id != new_user_id => id,
        _ => return Ok(None),
    };
    if Database::insert_relation_tx(tx, referrer_id, new_user_id)? {
        Ok(Some(referrer_id))
    } else {
        Ok(None)
    }
}

/* ------------------------------- dashboard ------------------------------- */

#[derive(Debug, Serialize)]
pub struct ReferralSummary {
    pub code: String,
    pub clicks: i64,
    pub referred_count: i64,
    pub total_paid: f64,
    pub total_pending: f64,
}

pub fn referral_summary(db: &Database, user_id: i64) -> CoreResult<ReferralSummary> {
    let code = ensure_referral_code(db, user_id)?;
    let clicks = db.referral_code_of(user_id)?.map(|(_, c)| c).unwrap_or(0);
    let referred_count = db.referred_count(user_id)?;
    let (total_paid, total_pending) = db.commission_totals(user_id)?;
    Ok(ReferralSummary {
        code,
        clicks,
        referred_count,
        total_paid,
        total_pending,
    })
}

pub fn list_referred(db: &Database, user_id: i64, limit: i64) -> CoreResult<Vec<ReferredUserRow>> {
    Ok(db.referred_users(user_id, limit.min(500))?)
}

pub fn list_commissions(db: &Database, user_id: i64, limit: i64) -> CoreResult<Vec<CommissionRow>> {
    Ok(db.list_commissions(user_id, limit.min(500))?)
}

/// Visit tracking for referral links; unknown codes are ignored.
pub fn record_code_click(db: &Database, code: &str) -> CoreResult<()> {
    let code = code.trim().to_uppercase();
    if utils::is_valid_referral_code(&code) {
        db.bump_code_clicks(&code)?;
    }
    Ok(())
}
