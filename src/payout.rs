// src/payout.rs
//
// Referral payout scheduler: shortly after the business-day rollover it
// promotes yesterday's pending commissions to paid. Paid rows enter the
// earner's spendable balance and become immutable to the posters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;

use crate::clock::{Clock, TzMeta};
use crate::config::Config;
use crate::db::Database;
use crate::error::CoreResult;
use crate::utils::date_str;

/// Promote yesterday's pending commissions once the cutoff has passed.
/// Idempotent: rows already paid are not matched again.
pub fn run_referral_payout(
    db: &Database,
    config: &Config,
    meta: TzMeta,
    paid_at: &str,
) -> CoreResult<usize> {
    if meta.sec_of_day < config.payout_cutoff_min * 60 {
        return Ok(0);
    }
    let day = date_str(meta.yesterday());
    let paid = db.pay_commissions_for_day(&day, config.min_payout_usdt, paid_at)?;
    Ok(paid)
}

pub struct ReferralPayout {
    db: Arc<Database>,
    config: Config,
    clock: Clock,
    ticking: AtomicBool,
    // last business day we completed a payout for, to skip redundant scans
    last_paid_day: Mutex<Option<NaiveDate>>,
}

impl ReferralPayout {
    pub fn new(db: Arc<Database>, config: Config, clock: Clock) -> Self {
        ReferralPayout {
            db,
            config,
            clock,
            ticking: AtomicBool::new(false),
            last_paid_day: Mutex::new(None),
        }
    }

    pub fn tick(&self) {
        let paid_at = chrono::Utc::now().to_rfc3339();
        self.tick_at(self.clock.now(), &paid_at);
    }

    /// The whole tick at an explicit instant, so the cutoff and the
    /// once-per-day marker are drivable without a wall clock.
    pub fn tick_at(&self, meta: TzMeta, paid_at: &str) {
        if self.ticking.swap(true, Ordering::SeqCst) {
            return;
        }
        self.run_once(meta, paid_at);
        self.ticking.store(false, Ordering::SeqCst);
    }

    fn run_once(&self, meta: TzMeta, paid_at: &str) {
        if meta.sec_of_day < self.config.payout_cutoff_min * 60 {
            return;
        }
        {
            let marker = self.last_paid_day.lock().unwrap();
            if *marker == Some(meta.today) {
                return;
            }
        }
        match run_referral_payout(&self.db, &self.config, meta, paid_at) {
            Ok(n) => {
                if n > 0 {
                    log::info!("referral payout marked {} commission(s) paid for {}", n, date_str(meta.yesterday()));
                }
                *self.last_paid_day.lock().unwrap() = Some(meta.today);
            }
            Err(e) => log::error!("referral payout tick failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    use crate::mailer::Mailer;
    use crate::referrals;
    use crate::user::{register, RegisterInput};

    fn setup() -> (Database, Config) {
        (Database::open_in_memory().unwrap(), Config::for_tests())
    }

    fn add_user(db: &Database, identifier: &str, code: Option<&str>) -> i64 {
        register(
            db,
            &Mailer::disabled(),
            RegisterInput {
                name: identifier.to_string(),
                identifier: identifier.to_string(),
                password: "secret1".to_string(),
                referral_code: code.map(|c| c.to_string()),
            },
        )
        .unwrap()
        .user_id
    }

    fn meta(y: i32, m: u32, d: u32, sec: u32) -> TzMeta {
        TzMeta::new(NaiveDate::from_ymd_opt(y, m, d).unwrap(), sec)
    }

    fn seed_commission(db: &Database, config: &Config, day: &str) -> (i64, i64) {
        static SEED: AtomicU64 = AtomicU64::new(0);
        let n = SEED.fetch_add(1, Ordering::SeqCst);
        let b = add_user(db, &format!("b-{}-{}@x", day, n), None);
        let code = db.referral_code_of(b).unwrap().unwrap().0;
        let a = add_user(db, &format!("a-{}-{}@x", day, n), Some(&code));
        referrals::credit_referral_delta(db, config, a, day, 100.0).unwrap();
        (b, a)
    }

    #[test]
    fn nothing_before_the_cutoff() {
        let (db, config) = setup();
        let (b, a) = seed_commission(&db, &config, "2024-05-01");

        // 00:04 on the 2nd, cutoff is 00:05
        let n = run_referral_payout(&db, &config, meta(2024, 5, 2, 4 * 60), "t").unwrap();
        assert_eq!(n, 0);
        let (_, status) = db.commission_for(b, a, "2024-05-01", 1).unwrap().unwrap();
        assert_eq!(status, "pending");
    }

    #[test]
    fn pays_only_yesterday_after_the_cutoff() {
        let (db, config) = setup();
        let (b1, a1) = seed_commission(&db, &config, "2024-05-01");
        let (b2, a2) = seed_commission(&db, &config, "2024-05-02");

        // 00:05 on the 2nd pays the 1st, leaves the 2nd pending
        let n = run_referral_payout(&db, &config, meta(2024, 5, 2, 5 * 60), "t").unwrap();
        assert_eq!(n, 1);
        let (_, s1) = db.commission_for(b1, a1, "2024-05-01", 1).unwrap().unwrap();
        let (_, s2) = db.commission_for(b2, a2, "2024-05-02", 1).unwrap().unwrap();
        assert_eq!(s1, "paid");
        assert_eq!(s2, "pending");

        // replay is a no-op
        assert_eq!(run_referral_payout(&db, &config, meta(2024, 5, 2, 6 * 60), "t").unwrap(), 0);
    }

    #[test]
    fn minimum_amount_filters_dust() {
        let (db, mut config) = setup();
        let (b, a) = seed_commission(&db, &config, "2024-05-01"); // l1 = 20.0
        config.min_payout_usdt = 25.0;

        // the only row is the 20.0 tier-1 commission, below the minimum
        assert_eq!(run_referral_payout(&db, &config, meta(2024, 5, 2, 5 * 60), "t").unwrap(), 0);
        let (_, s1) = db.commission_for(b, a, "2024-05-01", 1).unwrap().unwrap();
        assert_eq!(s1, "pending");
    }

    #[test]
    fn paid_commissions_enter_spendable() {
        let (db, config) = setup();
        let (b, _) = seed_commission(&db, &config, "2024-05-01");

        assert_eq!(db.referral_paid_sum(b).unwrap(), 0.0);
        run_referral_payout(&db, &config, meta(2024, 5, 2, 5 * 60), "t").unwrap();
        assert_eq!(db.referral_paid_sum(b).unwrap(), 20.0);

        let addr = db.default_address(b).unwrap().unwrap();
        assert_eq!(db.balance_parts(b, &addr, "USDT").unwrap().spendable(), 20.0);
    }

    #[test]
    fn marker_allows_one_scan_per_business_day() {
        let (db, config) = setup();
        let db = Arc::new(db);
        let (b1, a1) = seed_commission(&db, &config, "2024-05-01");
        let payout = ReferralPayout::new(db.clone(), config.clone(), Clock::new("+08:00"));

        // before the cutoff nothing happens and the marker stays unset
        payout.tick_at(meta(2024, 5, 2, 4 * 60), "t1");
        let (_, s) = db.commission_for(b1, a1, "2024-05-01", 1).unwrap().unwrap();
        assert_eq!(s, "pending");

        payout.tick_at(meta(2024, 5, 2, 5 * 60), "t2");
        let (_, s) = db.commission_for(b1, a1, "2024-05-01", 1).unwrap().unwrap();
        assert_eq!(s, "paid");

        // a commission posted late for the same source day is NOT picked up
        // by a later tick on the same business day: the marker blocks the
        // second scan entirely
        let (b2, a2) = seed_commission(&db, &config, "2024-05-01");
        payout.tick_at(meta(2024, 5, 2, 10 * 60), "t3");
        let (_, s) = db.commission_for(b2, a2, "2024-05-01", 1).unwrap().unwrap();
        assert_eq!(s, "pending");

        // next business day the marker rolls over and the scan runs again,
        // now targeting the new yesterday
        let (b3, a3) = seed_commission(&db, &config, "2024-05-02");
        payout.tick_at(meta(2024, 5, 3, 5 * 60), "t4");
        let (_, s3) = db.commission_for(b3, a3, "2024-05-02", 1).unwrap().unwrap();
        assert_eq!(s3, "paid");
        let (_, s2) = db.commission_for(b2, a2, "2024-05-01", 1).unwrap().unwrap();
        assert_eq!(s2, "pending"); // still only yesterday's rows
    }

    #[test]
    fn reentrant_tick_is_skipped() {
        let (db, config) = setup();
        let (b, a) = seed_commission(&db, &config, "2024-05-01");
        let payout = ReferralPayout::new(Arc::new(db), config, Clock::new("+08:00"));

        payout.ticking.store(true, Ordering::SeqCst);
        payout.tick_at(meta(2024, 5, 2, 5 * 60), "t");
        // the guarded call did nothing: no payout ran, no marker was set
        assert!(payout.last_paid_day.lock().unwrap().is_none());
        let db = &payout.db;
        let (_, s) = db.commission_for(b, a, "2024-05-01", 1).unwrap().unwrap();
        assert_eq!(s, "pending");
    }
}
