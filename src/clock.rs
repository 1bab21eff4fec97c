// src/clock.rs
use chrono::{DateTime, FixedOffset, NaiveDate, Timelike, Utc};

/// Business-time snapshot: calendar date in the operating timezone and how
/// far through that date the clock has advanced.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TzMeta {
    pub today: NaiveDate,
    pub sec_of_day: u32,
    /// 0..=1 fraction of the business day elapsed.
    pub frac: f64,
}

impl TzMeta {
    pub fn new(today: NaiveDate, sec_of_day: u32) -> Self {
        let frac = (sec_of_day as f64 / 86_400.0).clamp(0.0, 1.0);
        TzMeta { today, sec_of_day, frac }
    }

    pub fn yesterday(&self) -> NaiveDate {
        self.today - chrono::Duration::days(1)
    }
}

/// Converts UTC to the configured business timezone. The offset comes from
/// APP_TZ ("+08:00" style), matching what the storefront runs on.
#[derive(Clone, Debug)]
pub struct Clock {
    offset: FixedOffset,
}

impl Clock {
    pub fn new(app_tz: &str) -> Self {
        let offset = parse_offset(app_tz).unwrap_or_else(|| {
            log::warn!("APP_TZ '{}' not parseable, falling back to +08:00", app_tz);
            FixedOffset::east_opt(8 * 3600).unwrap()
        });
        Clock { offset }
    }

    pub fn now(&self) -> TzMeta {
        self.meta_at(Utc::now())
    }

    pub fn meta_at(&self, at: DateTime<Utc>) -> TzMeta {
        let local = at.with_timezone(&self.offset);
        TzMeta::new(local.date_naive(), local.num_seconds_from_midnight())
    }
}

/// "+08:00" / "-05:30" -> FixedOffset.
fn parse_offset(s: &str) -> Option<FixedOffset> {
    let s = s.trim();
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => (1, s),
    };
    let mut parts = rest.split(':');
    let hours: i32 = parts.next()?.parse().ok()?;
    let mins: i32 = parts.next().unwrap_or("0").parse().ok()?;
    if hours > 14 || mins > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + mins * 60))
}
