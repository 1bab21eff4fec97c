// src/config.rs
use std::env;

/// Runtime options, all overridable from the environment (.env is loaded
/// in main). Defaults match the production values of the original service.
#[derive(Clone, Debug)]
pub struct Config {
    /// Business timezone as a UTC offset string, e.g. "+08:00".
    pub app_tz: String,

    /// Two-tier referral commission rates (fractions of daily profit).
    pub ref_l1_rate: f64,
    pub ref_l2_rate: f64,

    /// Contract-length step table: daily rate by contract days.
    pub rate_7d: f64,
    pub rate_15d: f64,
    pub rate_30d: f64,
    pub rate_60d: f64,
    pub rate_default: f64,

    /// Referral payout: business-time cutoff (minutes after midnight) and
    /// minimum amount that gets promoted to paid.
    pub payout_cutoff_min: u32,
    pub min_payout_usdt: f64,

    /// Polling intervals for the three background tasks.
    pub accrual_interval_secs: u64,
    pub realtime_interval_secs: u64,
    pub payout_interval_secs: u64,

    /// Bank cash-out pricing.
    pub fx_fee_pct: f64,
    pub payout_fee_php: f64,
    pub fallback_usdt_php: f64,
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            app_tz: env::var("APP_TZ").unwrap_or_else(|_| "+08:00".to_string()),
            ref_l1_rate: env_f64("REF_L1_RATE", 0.20),
            ref_l2_rate: env_f64("REF_L2_RATE", 0.15),
            rate_7d: env_f64("RATE_7D", 0.02),
            rate_15d: env_f64("RATE_15D", 0.03),
            rate_30d: env_f64("RATE_30D", 0.035),
            rate_60d: env_f64("RATE_60D", 0.04),
            rate_default: env_f64("RATE_DEFAULT", 0.03),
            payout_cutoff_min: env_u64("PAYOUT_CUTOFF_MIN", 5) as u32,
            min_payout_usdt: env_f64("MIN_PAYOUT_USDT", 0.0),
            accrual_interval_secs: env_u64("ACCRUAL_INTERVAL_SECS", 60),
            realtime_interval_secs: env_u64("REALTIME_INTERVAL_SECS", 5),
            payout_interval_secs: env_u64("PAYOUT_INTERVAL_SECS", 120),
            fx_fee_pct: env_f64("FX_FEE_PCT", 0.01),
            payout_fee_php: env_f64("PAYOUT_FEE_PHP", 25.0),
            fallback_usdt_php: env_f64("FALLBACK_USDT_PHP", 58.0),
        }
    }

    /// Daily rate for a contract length. Callers validate the length against
    /// the allowed set first; the fallback only covers legacy rows.
    pub fn rate_for_contract_days(&self, days: i64) -> f64 {
        if days <= 7 {
            self.rate_7d
        } else if days <= 15 {
            self.rate_15d
        } else if days <= 30 {
            self.rate_30d
        } else if days <= 60 {
            self.rate_60d
        } else {
            self.rate_default
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::from_env()
    }
}

pub const ALLOWED_CONTRACT_DAYS: [i64; 4] = [7, 15, 30, 60];

#[cfg(test)]
impl Config {
    /// Fixed values independent of the process environment.
    pub fn for_tests() -> Self {
        Config {
            app_tz: "+08:00".to_string(),
            ref_l1_rate: 0.20,
            ref_l2_rate: 0.15,
            rate_7d: 0.02,
            rate_15d: 0.03,
            rate_30d: 0.035,
            rate_60d: 0.04,
            rate_default: 0.03,
            payout_cutoff_min: 5,
            min_payout_usdt: 0.0,
            accrual_interval_secs: 60,
            realtime_interval_secs: 5,
            payout_interval_secs: 120,
            fx_fee_pct: 0.01,
            payout_fee_php: 25.0,
            fallback_usdt_php: 58.0,
        }
    }
}
