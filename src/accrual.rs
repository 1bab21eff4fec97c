// src/accrual.rs
//
// The two profit posters. The daily engine back-fills whole days up to
// yesterday; today belongs exclusively to the realtime poster, which keeps
// re-publishing the pro-rated figure until it converges to the full-day
// credit. Both are safe to re-run and to run concurrently: the profit
// ledger's unique day key turns duplicates into no-ops.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::clock::{Clock, TzMeta};
use crate::config::Config;
use crate::db::Database;
use crate::error::CoreResult;
use crate::referrals;
use crate::utils::{add_days, date_str, parse_date};

/// Catch up every active subscription to yesterday. Returns the number of
/// ledger rows newly inserted.
pub fn run_daily_accrual(db: &Database, config: &Config, meta: TzMeta) -> CoreResult<usize> {
    let today = meta.today;
    let yesterday = meta.yesterday();
    let subs = db.subscriptions_for_accrual(&date_str(today))?;
    let mut inserted = 0usize;

    for sub in subs {
        let start = match parse_date(&sub.start_date) {
            Some(d) => d,
            None => {
                log::error!("subscription {} has bad start_date '{}'", sub.id, sub.start_date);
                continue;
            }
        };
        let end = match parse_date(&sub.end_date) {
            Some(d) => d,
            None => {
                log::error!("subscription {} has bad end_date '{}'", sub.id, sub.end_date);
                continue;
            }
        };

        // First uncredited day, then credit one row per missing day up to
        // yesterday (never today, never past the contract end).
        let mut next = match sub.last_credit_date.as_deref().and_then(parse_date) {
            Some(last) => add_days(last, 1),
            None => start,
        };
        let cap = if yesterday < end { yesterday } else { end };

        while next <= cap {
            let day = date_str(next);
            let credit = sub.amount_usdt * sub.rate_daily;

            let fresh =
                db.insert_profit_ignore(sub.user_id, &sub.from_address, &sub.symbol, credit, &day)?;
            if fresh {
                inserted += 1;
                // Commission delta only for days we actually posted;
                // replayed days were already propagated.
                referrals::credit_referral_delta(db, config, sub.user_id, &day, credit)?;
            }

            db.set_last_credit_date(sub.id, &day)?;
            next = add_days(next, 1);
        }

        if today > end {
            db.complete_subscription(sub.id)?;
        }
    }

    Ok(inserted)
}

/// Post today's pro-rated profit for every in-window subscription, then
/// republish each touched user's whole-day total to the commission
/// propagator in absolute mode.
pub fn run_realtime_poster(db: &Database, config: &Config, meta: TzMeta) -> CoreResult<usize> {
    if meta.frac <= 0.0 {
        return Ok(0);
    }
    let today = date_str(meta.today);
    let subs = db.subscriptions_in_window(&today)?;
    if subs.is_empty() {
        return Ok(0);
    }

    let mut touched: BTreeSet<i64> = BTreeSet::new();
    for sub in &subs {
        let partial = sub.amount_usdt * sub.rate_daily * meta.frac;
        db.upsert_profit_absolute(sub.user_id, &sub.from_address, &sub.symbol, partial, &today)?;
        touched.insert(sub.user_id);
    }

    for &uid in &touched {
        let total = db.user_profit_for_day(uid, &today)?;
        if total > 0.0 {
            referrals::credit_referral_absolute(db, config, uid, &today, total)?;
        }
    }

    Ok(subs.len())
}

/// Interval component for the daily catch-up. Owns its reentrancy flag;
/// `tick()` is the sole entry point so tests can drive it without a timer.
pub struct DailyAccrual {
    db: Arc<Database>,
    config: Config,
    clock: Clock,
    ticking: AtomicBool,
}

impl DailyAccrual {
    pub fn new(db: Arc<Database>, config: Config, clock: Clock) -> Self {
        DailyAccrual {
            db,
            config,
            clock,
            ticking: AtomicBool::new(false),
        }
    }

    pub fn tick(&self) {
        self.tick_at(self.clock.now());
    }

    /// The whole tick at an explicit instant, drivable without a wall clock.
    pub fn tick_at(&self, meta: TzMeta) {
        if self.ticking.swap(true, Ordering::SeqCst) {
            return; // previous tick still in flight
        }
        match run_daily_accrual(&self.db, &self.config, meta) {
            Ok(0) => {}
            Ok(n) => log::info!("daily accrual posted {} ledger row(s)", n),
            Err(e) => log::error!("daily accrual tick failed: {}", e),
        }
        self.ticking.store(false, Ordering::SeqCst);
    }
}

/// Interval component for the realtime pro-ration poster.
pub struct RealtimePoster {
    db: Arc<Database>,
    config: Config,
    clock: Clock,
    ticking: AtomicBool,
}

impl RealtimePoster {
    pub fn new(db: Arc<Database>, config: Config, clock: Clock) -> Self {
        RealtimePoster {
            db,
            config,
            clock,
            ticking: AtomicBool::new(false),
        }
    }

    pub fn tick(&self) {
        self.tick_at(self.clock.now());
    }

    pub fn tick_at(&self, meta: TzMeta) {
        if self.ticking.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = run_realtime_poster(&self.db, &self.config, meta) {
            log::error!("realtime poster tick failed: {}", e);
        }
        self.ticking.store(false, Ordering::SeqCst);
    }
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

    fn add_user(db: &Database, identifier: &str, code: Option<&str>) -> (i64, String) {
        let out = register(
            db,
            &Mailer::disabled(),
            RegisterInput {
                name: identifier.to_string(),
                identifier: identifier.to_string(),
                password: "secret1".to_string(),
                referral_code: code.map(|c| c.to_string()),
            },
        )
        .unwrap();
        (out.user_id, out.wallet_address)
    }

    fn fund(db: &Database, uid: i64, address: &str, amount: f64) {
        let id = db
            .insert_deposit(uid, address, amount, "USDT", "ethereum", None, None, None)
            .unwrap();
        db.set_deposit_status(id, "verified").unwrap();
    }

    fn subscribe(db: &Database, uid: i64, address: &str, amount: f64, days: i64, rate: f64, start: NaiveDate) {
        let end = add_days(start, days - 1);
        match db
            .create_subscription_checked(
                uid, address, "BTC", amount, "USDT", days, rate,
                &date_str(start), &date_str(end),
            )
            .unwrap()
        {
            DebitOutcome::Inserted(_) => {}
            DebitOutcome::Insufficient { spendable } => {
                panic!("test subscription unexpectedly rejected, spendable {}", spendable)
            }
        }
    }

    fn meta(y: i32, m: u32, d: u32, sec: u32) -> TzMeta {
        TzMeta::new(NaiveDate::from_ymd_opt(y, m, d).unwrap(), sec)
    }

    #[test]
    fn first_day_credit_and_window() {
        let (db, config) = setup();
        let (uid, addr) = add_user(&db, "a@x", None);
        fund(&db, uid, &addr, 2000.0);
        let start = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        subscribe(&db, uid, &addr, 1000.0, 15, 0.03, start);

        // day 2: exactly day 1 is owed
        let posted = run_daily_accrual(&db, &config, meta(2024, 5, 2, 3600)).unwrap();
        assert_eq!(posted, 1);
        assert_eq!(db.profit_sum_for_day(uid, &addr, "2024-05-01").unwrap(), 30.0);

        let sub = &db.list_subscriptions(uid, Some(&addr)).unwrap()[0];
        assert_eq!(sub.last_credit_date.as_deref(), Some("2024-05-01"));
        assert_eq!(sub.end_date, "2024-05-15"); // start + 14 days
    }

    #[test]
    fn repeated_runs_are_idempotent() {
        let (db, config) = setup();
        let (uid, addr) = add_user(&db, "a@x", None);
        fund(&db, uid, &addr, 2000.0);
        subscribe(&db, uid, &addr, 1000.0, 15, 0.03, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());

        let m = meta(2024, 5, 6, 3600);
        let first = run_daily_accrual(&db, &config, m).unwrap();
        assert_eq!(first, 5); // days 1..=5
        for _ in 0..1000 {
            assert_eq!(run_daily_accrual(&db, &config, m).unwrap(), 0);
        }
        assert_eq!(db.profit_sum(uid, &addr).unwrap(), 150.0);
    }

    #[test]
    fn never_credits_today_or_past_end() {
        let (db, config) = setup();
        let (uid, addr) = add_user(&db, "a@x", None);
        fund(&db, uid, &addr, 2000.0);
        subscribe(&db, uid, &addr, 1000.0, 7, 0.02, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());

        // mid-contract: today (5th) must stay uncredited
        run_daily_accrual(&db, &config, meta(2024, 5, 5, 3600)).unwrap();
        assert_eq!(db.profit_sum_for_day(uid, &addr, "2024-05-05").unwrap(), 0.0);

        // long after the end: only the 7 contract days exist and the
        // subscription is completed
        run_daily_accrual(&db, &config, meta(2024, 6, 1, 3600)).unwrap();
        assert_eq!(db.profit_sum(uid, &addr).unwrap(), 7.0 * 20.0);
        let sub = &db.list_subscriptions(uid, Some(&addr)).unwrap()[0];
        assert_eq!(sub.status, "completed");
    }

    #[test]
    fn paused_subscription_does_not_accrue() {
        let (db, config) = setup();
        let (uid, addr) = add_user(&db, "a@x", None);
        fund(&db, uid, &addr, 2000.0);
        subscribe(&db, uid, &addr, 1000.0, 15, 0.03, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        db.set_subscription_status(uid, &addr, "BTC", "paused").unwrap();

        assert_eq!(run_daily_accrual(&db, &config, meta(2024, 5, 6, 0)).unwrap(), 0);
        assert_eq!(db.profit_sum(uid, &addr).unwrap(), 0.0);
    }

    #[test]
    fn realtime_prorates_and_converges() {
        let (db, config) = setup();
        let (uid, addr) = add_user(&db, "a@x", None);
        fund(&db, uid, &addr, 2000.0);
        subscribe(&db, uid, &addr, 1000.0, 15, 0.03, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());

        // half the day elapsed
        run_realtime_poster(&db, &config, meta(2024, 5, 1, 43_200)).unwrap();
        assert_eq!(db.profit_sum_for_day(uid, &addr, "2024-05-01").unwrap(), 15.0);

        // replays overwrite, never add
        run_realtime_poster(&db, &config, meta(2024, 5, 1, 43_200)).unwrap();
        assert_eq!(db.profit_sum_for_day(uid, &addr, "2024-05-01").unwrap(), 15.0);

        // end of day: converged to the full-day figure the daily engine
        // would have posted
        run_realtime_poster(&db, &config, meta(2024, 5, 1, 86_400)).unwrap();
        assert_eq!(db.profit_sum_for_day(uid, &addr, "2024-05-01").unwrap(), 30.0);

        // next day the daily engine replays day 1 as a no-op
        assert_eq!(run_daily_accrual(&db, &config, meta(2024, 5, 2, 3600)).unwrap(), 0);
        assert_eq!(db.profit_sum_for_day(uid, &addr, "2024-05-01").unwrap(), 30.0);
    }

    #[test]
    fn realtime_skips_midnight_and_out_of_window() {
        let (db, config) = setup();
        let (uid, addr) = add_user(&db, "a@x", None);
        fund(&db, uid, &addr, 2000.0);
        subscribe(&db, uid, &addr, 1000.0, 7, 0.02, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());

        assert_eq!(run_realtime_poster(&db, &config, meta(2024, 5, 1, 0)).unwrap(), 0);
        assert_eq!(run_realtime_poster(&db, &config, meta(2024, 4, 30, 43_200)).unwrap(), 0);
        assert_eq!(run_realtime_poster(&db, &config, meta(2024, 5, 8, 43_200)).unwrap(), 0);
        assert_eq!(db.profit_sum(uid, &addr).unwrap(), 0.0);
    }

    #[test]
    fn realtime_commissions_track_whole_day_total() {
        let (db, config) = setup();
        let (b, _) = add_user(&db, "b@x", None);
        let b_code = db.referral_code_of(b).unwrap().unwrap().0;
        let (a, addr_a) = add_user(&db, "a@x", Some(&b_code));
        fund(&db, a, &addr_a, 2000.0);
        subscribe(&db, a, &addr_a, 1000.0, 15, 0.03, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());

        run_realtime_poster(&db, &config, meta(2024, 5, 1, 43_200)).unwrap();
        let (l1, _) = db.commission_for(b, a, "2024-05-01", 1).unwrap().unwrap();
        assert_eq!(l1, 15.0 * 0.20);

        // later in the day the absolute mode has replaced, not added
        run_realtime_poster(&db, &config, meta(2024, 5, 1, 86_400)).unwrap();
        let (l1, _) = db.commission_for(b, a, "2024-05-01", 1).unwrap().unwrap();
        assert_eq!(l1, 30.0 * 0.20);
    }

    #[test]
    fn daily_commissions_are_additive_per_fresh_day() {
        let (db, config) = setup();
        let (c, _) = add_user(&db, "c@x", None);
        let c_code = db.referral_code_of(c).unwrap().unwrap().0;
        let (b, _) = add_user(&db, "b@x", Some(&c_code));
        let b_code = db.referral_code_of(b).unwrap().unwrap().0;
        let (a, addr_a) = add_user(&db, "a@x", Some(&b_code));
        fund(&db, a, &addr_a, 2000.0);
        subscribe(&db, a, &addr_a, 1000.0, 15, 0.03, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());

        // three missed days, each worth 30 -> one delta per day
        run_daily_accrual(&db, &config, meta(2024, 5, 4, 3600)).unwrap();
        for day in ["2024-05-01", "2024-05-02", "2024-05-03"] {
            let (l1, _) = db.commission_for(b, a, day, 1).unwrap().unwrap();
            let (l2, _) = db.commission_for(c, a, day, 2).unwrap().unwrap();
            assert_eq!(l1, 6.0);
            assert_eq!(l2, 4.5);
        }

        // replaying the window adds nothing
        run_daily_accrual(&db, &config, meta(2024, 5, 4, 3600)).unwrap();
        let (l1, _) = db.commission_for(b, a, "2024-05-01", 1).unwrap().unwrap();
        assert_eq!(l1, 6.0);
    }

    #[test]
    fn resubscription_restarts_accrual_without_rewriting_history() {
        let (db, config) = setup();
        let (uid, addr) = add_user(&db, "a@x", None);
        fund(&db, uid, &addr, 5000.0);
        subscribe(&db, uid, &addr, 1000.0, 15, 0.03, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        run_daily_accrual(&db, &config, meta(2024, 5, 3, 3600)).unwrap();
        assert_eq!(db.profit_sum(uid, &addr).unwrap(), 60.0);

        // re-subscribe with new terms starting the 3rd; last_credit_date
        // resets but the already-posted days are skipped, not re-rated
        subscribe(&db, uid, &addr, 500.0, 7, 0.02, NaiveDate::from_ymd_opt(2024, 5, 3).unwrap());
        let sub = &db.list_subscriptions(uid, Some(&addr)).unwrap()[0];
        assert_eq!(sub.last_credit_date, None);

        run_daily_accrual(&db, &config, meta(2024, 5, 5, 3600)).unwrap();
        // days 1,2 keep their 30.0; days 3,4 post at the new 10.0
        assert_eq!(db.profit_sum_for_day(uid, &addr, "2024-05-02").unwrap(), 30.0);
        assert_eq!(db.profit_sum_for_day(uid, &addr, "2024-05-03").unwrap(), 10.0);
        assert_eq!(db.profit_sum_for_day(uid, &addr, "2024-05-04").unwrap(), 10.0);
    }

    #[test]
    fn tick_at_posts_through_the_component() {
        let (db, config) = setup();
        let db = Arc::new(db);
        let (uid, addr) = add_user(&db, "a@x", None);
        fund(&db, uid, &addr, 2000.0);
        subscribe(&db, uid, &addr, 1000.0, 15, 0.03, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());

        let daily = DailyAccrual::new(db.clone(), config.clone(), Clock::new("+08:00"));
        daily.tick_at(meta(2024, 5, 3, 3600));
        assert_eq!(db.profit_sum(uid, &addr).unwrap(), 60.0);

        let realtime = RealtimePoster::new(db.clone(), config, Clock::new("+08:00"));
        realtime.tick_at(meta(2024, 5, 3, 43_200));
        assert_eq!(db.profit_sum_for_day(uid, &addr, "2024-05-03").unwrap(), 15.0);
    }

    #[test]
    fn tick_guard_skips_reentrant_runs() {
        let (db, config) = setup();
        let db = Arc::new(db);
        let (uid, addr) = add_user(&db, "a@x", None);
        fund(&db, uid, &addr, 2000.0);
        subscribe(&db, uid, &addr, 1000.0, 15, 0.03, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());

        let engine = DailyAccrual::new(db.clone(), config, Clock::new("+08:00"));
        engine.ticking.store(true, Ordering::SeqCst);
        // the guarded call must not run the engine at all
        engine.tick_at(meta(2024, 5, 3, 3600));
        assert_eq!(db.profit_sum(uid, &addr).unwrap(), 0.0);
        assert!(engine.ticking.load(Ordering::SeqCst));

        engine.ticking.store(false, Ordering::SeqCst);
        engine.tick_at(meta(2024, 5, 3, 3600));
        assert_eq!(db.profit_sum(uid, &addr).unwrap(), 60.0);
    }
}
