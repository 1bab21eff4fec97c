// src/main.rs
mod accrual;
mod balance;
mod clock;
mod config;
mod db;
mod error;
mod funds;
mod mailer;
mod payout;
mod referrals;
mod subscriptions;
mod tasks;
mod user;
mod utils;

use std::env;
use std::sync::Arc;

use anyhow::Context;
use dotenv::dotenv;

use crate::clock::Clock;
use crate::config::Config;
use crate::db::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = Config::from_env();
    let clock = Clock::new(&config.app_tz);
    let db_file = env::var("DB_FILE").unwrap_or_else(|_| "walletcore.db".to_string());
    let db = Arc::new(Database::new(&db_file).context("database initialization failed")?);

    let args: Vec<String> = env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("run");

    match command {
        // long-running mode: the three schedulers keep the ledger current
        "run" => {
            tasks::start_scheduled_tasks(db, config, clock);
            log::info!("schedulers running, press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            log::info!("shutting down");
        }
        // one-shot operational commands
        "accrue" => {
            let n = accrual::run_daily_accrual(&db, &config, clock.now())?;
            println!("posted {} ledger row(s)", n);
        }
        "realtime" => {
            let n = accrual::run_realtime_poster(&db, &config, clock.now())?;
            println!("refreshed {} subscription(s)", n);
        }
        "payout" => {
            let paid_at = chrono::Utc::now().to_rfc3339();
            let n = payout::run_referral_payout(&db, &config, clock.now(), &paid_at)?;
            println!("marked {} commission(s) paid", n);
        }
        "register" => {
            let identifier = args.get(1).context("usage: register <identifier> <password> [referral-code]")?;
            let password = args.get(2).context("usage: register <identifier> <password> [referral-code]")?;
            let out = user::register(
                &db,
                &mailer::Mailer::from_env(),
                user::RegisterInput {
                    name: identifier.clone(),
                    identifier: identifier.clone(),
                    password: password.clone(),
                    referral_code: args.get(3).cloned(),
                },
            )?;
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        "balance" => {
            let user_id: i64 = args
                .get(1)
                .and_then(|v| v.parse().ok())
                .context("usage: balance <user-id>")?;
            let view = balance::default_balance(&db, &config, clock.now(), user_id, "USDT")?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        "subscribe" => {
            let usage = "usage: subscribe <user-id> <symbol> <amount-usdt> <days>";
            let user_id: i64 = args.get(1).and_then(|v| v.parse().ok()).context(usage)?;
            let symbol = args.get(2).context(usage)?;
            let amount: f64 = args.get(3).and_then(|v| v.parse().ok()).context(usage)?;
            let days: i64 = args.get(4).and_then(|v| v.parse().ok()).context(usage)?;
            let address = db
                .default_address(user_id)?
                .context("user has no default address")?;
            let id = subscriptions::subscribe(&db, &config, clock.now(), user_id, &address, symbol, amount, days)?;
            println!("subscription {} active", id);
        }
        "profit" => {
            let user_id: i64 = args
                .get(1)
                .and_then(|v| v.parse().ok())
                .context("usage: profit <user-id>")?;
            let address = db
                .default_address(user_id)?
                .context("user has no default address")?;
            let summary = subscriptions::profit_summary(&db, &config, clock.now(), user_id, &address)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        "review-deposit" => {
            let usage = "usage: review-deposit <id> <approve|reject>";
            let id: i64 = args.get(1).and_then(|v| v.parse().ok()).context(usage)?;
            let verdict = args.get(2).context(usage)?;
            let approve = match verdict.as_str() {
                "approve" => true,
                "reject" => false,
                _ => anyhow::bail!("{}", usage),
            };
            funds::review_deposit(&db, &mailer::Mailer::from_env(), id, approve)?;
            println!("deposit {} {}", id, if approve { "verified" } else { "rejected" });
        }
        "banks" => {
            for (code, name, channel) in funds::list_banks(&db)? {
                println!("{:<8} {:<40} {}", code, name, channel);
            }
        }
        "referrals" => {
            let user_id: i64 = args
                .get(1)
                .and_then(|v| v.parse().ok())
                .context("usage: referrals <user-id>")?;
            let summary = referrals::referral_summary(&db, user_id)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            for row in referrals::list_commissions(&db, user_id, 50)? {
                println!(
                    "{} tier {} from user {}: {} USDT [{}]",
                    row.source_day, row.tier, row.source_user_id, row.amount_usdt, row.status
                );
            }
        }
        "rerate" => {
            let day = args.get(1).context("usage: rerate <YYYY-MM-DD>")?;
            utils::parse_date(day).context("day must be YYYY-MM-DD")?;
            let n = referrals::rerate_day(&db, &config, day)?;
            println!("re-rated commissions for {} user(s) on {}", n, day);
        }
        "add-pool" => {
            let address = args.get(1).context("usage: add-pool <address> [network] [token]")?;
            let network = args.get(2).map(String::as_str).unwrap_or("ethereum");
            let token = args.get(3).map(String::as_str).unwrap_or("USDT");
            if !utils::is_valid_evm_address(&address.to_lowercase()) {
                anyhow::bail!("address must be 0x + 40 hex chars");
            }
            db.add_pool_address(address, network, token)?;
            println!("pooled {}", address.to_lowercase());
        }
        other => {
            eprintln!("unknown command '{}'", other);
            eprintln!(
                "commands: run | accrue | realtime | payout | register <identifier> <password> [code] | \
                 balance <user-id> | profit <user-id> | subscribe <user-id> <symbol> <amount> <days> | \
                 review-deposit <id> <approve|reject> | banks | referrals <user-id> | rerate <day> | \
                 add-pool <address> [network] [token]"
            );
            std::process::exit(2);
        }
    }

    Ok(())
}
