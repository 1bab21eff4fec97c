// src/balance.rs
//
// Read-side balance aggregation. Every view runs the two accrual engines
// synchronously first, so a balance read after downtime already includes
// the caught-up profit (both engines are idempotent, the extra runs cost
// one query each).

use serde::Serialize;

use crate::accrual;
use crate::clock::TzMeta;
use crate::config::Config;
use crate::db::Database;
use crate::error::{CoreError, CoreResult};
use crate::utils::date_str;

#[derive(Debug, Serialize)]
pub struct BalanceView {
    pub address: String,
    pub token_symbol: String,
    /// Spendable as reported to clients, floored at zero.
    pub spendable: f64,
    pub deposited: f64,
    pub deposits_pending: f64,
    pub withdrawals_active: f64,
    pub bank_cashouts_active: f64,
    pub subscribed: f64,
    pub profit_total: f64,
    pub profit_today: f64,
    pub referral_paid: f64,
}

pub fn balance_for(
    db: &Database,
    config: &Config,
    meta: TzMeta,
    user_id: i64,
    address: &str,
    token_symbol: &str,
) -> CoreResult<BalanceView> {
    accrual::run_daily_accrual(db, config, meta)?;
    accrual::run_realtime_poster(db, config, meta)?;

    let parts = db.balance_parts(user_id, address, token_symbol)?;
    let profit_today = db.profit_sum_for_day(user_id, address, &date_str(meta.today))?;

    Ok(BalanceView {
        address: address.to_string(),
        token_symbol: token_symbol.to_string(),
        spendable: parts.spendable().max(0.0),
        deposited: parts.dep_verified,
        deposits_pending: parts.dep_pending,
        withdrawals_active: parts.wd_active,
        bank_cashouts_active: parts.bank_active,
        subscribed: parts.ai_active,
        profit_total: parts.ai_profit,
        profit_today,
        referral_paid: parts.referral_paid,
    })
}

/// Balance of the user's default wallet.
pub fn default_balance(
    db: &Database,
    config: &Config,
    meta: TzMeta,
    user_id: i64,
    token_symbol: &str,
) -> CoreResult<BalanceView> {
    let address = db
        .default_address(user_id)?
        .ok_or(CoreError::NoDefaultAddress)?;
    balance_for(db, config, meta, user_id, &address, token_symbol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DebitOutcome;
    use crate::mailer::Mailer;
    use crate::user::{register, RegisterInput};
    use chrono::NaiveDate;

    fn setup() -> (Database, Config) {
        (Database::open_in_memory().unwrap(), Config::for_tests())
    }

    fn add_user(db: &Database, identifier: &str) -> (i64, String) {
        let out = register(
            db,
            &Mailer::disabled(),
            RegisterInput {
                name: identifier.to_string(),
                identifier: identifier.to_string(),
                password: "secret1".to_string(),
                referral_code: None,
            },
        )
        .unwrap();
        (out.user_id, out.wallet_address)
    }

    fn meta(y: i32, m: u32, d: u32, sec: u32) -> TzMeta {
        TzMeta::new(NaiveDate::from_ymd_opt(y, m, d).unwrap(), sec)
    }

    #[test]
    fn aggregates_all_parts() {
        let (db, config) = setup();
        let (uid, addr) = add_user(&db, "a@x");

        // 500 verified deposit
        let dep = db.insert_deposit(uid, &addr, 500.0, "USDT", "ethereum", None, None, None).unwrap();
        db.set_deposit_status(dep, "verified").unwrap();
        // 200 pending withdrawal
        db.create_transfer_checked(uid, &addr, "0x00000000000000000000000000000000000000ff", 200.0, "USDT", "ethereum", None)
            .unwrap();
        // 300 locked in a subscription
        match db
            .create_subscription_checked(uid, &addr, "BTC", 300.0, "USDT", 15, 0.03, "2024-05-01", "2024-05-15")
            .unwrap()
        {
            DebitOutcome::Inserted(_) => {}
            other => panic!("unexpected {:?}", other),
        }
        // 10 profit posted for an earlier day
        db.insert_profit_ignore(uid, &addr, "BTC", 10.0, "2024-04-30").unwrap();

        // midnight view, so the engines post nothing new for today
        let view = balance_for(&db, &config, meta(2024, 5, 1, 0), uid, &addr, "USDT").unwrap();
        assert_eq!(view.deposited, 500.0);
        assert_eq!(view.withdrawals_active, 200.0);
        assert_eq!(view.subscribed, 300.0);
        assert_eq!(view.profit_total, 10.0);
        assert_eq!(view.spendable, 10.0);
    }

    #[test]
    fn reading_catches_up_missed_days() {
        let (db, config) = setup();
        let (uid, addr) = add_user(&db, "a@x");
        let dep = db.insert_deposit(uid, &addr, 2000.0, "USDT", "ethereum", None, None, None).unwrap();
        db.set_deposit_status(dep, "verified").unwrap();
        db.create_subscription_checked(uid, &addr, "BTC", 1000.0, "USDT", 15, 0.03, "2024-05-01", "2024-05-15")
            .unwrap();

        // first read happens days later; days 1..4 get posted plus half of day 5
        let view = balance_for(&db, &config, meta(2024, 5, 5, 43_200), uid, &addr, "USDT").unwrap();
        assert_eq!(view.profit_total, 4.0 * 30.0 + 15.0);
        assert_eq!(view.profit_today, 15.0);
    }

    #[test]
    fn reported_spendable_never_negative() {
        let (db, config) = setup();
        let (uid, addr) = add_user(&db, "a@x");
        // pending deposit only: raw spendable is 0, report stays 0
        db.insert_deposit(uid, &addr, 100.0, "USDT", "ethereum", None, None, None).unwrap();

        let view = balance_for(&db, &config, meta(2024, 5, 1, 0), uid, &addr, "USDT").unwrap();
        assert_eq!(view.spendable, 0.0);
        assert_eq!(view.deposits_pending, 100.0);
    }

    #[test]
    fn default_balance_requires_a_wallet() {
        let (db, config) = setup();
        let (uid, _) = add_user(&db, "a@x");
        assert!(default_balance(&db, &config, meta(2024, 5, 1, 0), uid, "USDT").is_ok());
        assert!(matches!(
            default_balance(&db, &config, meta(2024, 5, 1, 0), 999, "USDT"),
            Err(CoreError::NoDefaultAddress)
        ));
    }
}
