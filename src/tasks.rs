// src/tasks.rs
use std::sync::Arc;

use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::accrual::{DailyAccrual, RealtimePoster};
use crate::clock::Clock;
use crate::config::Config;
use crate::db::Database;
use crate::payout::ReferralPayout;

/// Spawn the three background loops: daily catch-up, realtime pro-ration
/// and the referral payout scheduler. Each engine carries its own
/// reentrancy flag, so an overrunning tick is skipped rather than stacked.
pub fn start_scheduled_tasks(db: Arc<Database>, config: Config, clock: Clock) {
    let daily = Arc::new(DailyAccrual::new(db.clone(), config.clone(), clock.clone()));
    let realtime = Arc::new(RealtimePoster::new(db.clone(), config.clone(), clock.clone()));
    let payout = Arc::new(ReferralPayout::new(db, config.clone(), clock));

    spawn_loop("daily-accrual", config.accrual_interval_secs, move || daily.tick());
    spawn_loop("realtime-poster", config.realtime_interval_secs, move || realtime.tick());
    spawn_loop("referral-payout", config.payout_interval_secs, move || payout.tick());
}

fn spawn_loop<F>(name: &'static str, every_secs: u64, tick: F)
where
    F: Fn() + Send + 'static,
{
    tokio::spawn(async move {
        let mut timer = interval(Duration::from_secs(every_secs.max(1)));
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("{} loop started, every {}s", name, every_secs.max(1));
        loop {
            timer.tick().await;
            tick();
        }
    });
}
