//! Market clock utilities
//!
//! All market-hour decisions are made in US Eastern Time. Every predicate has
//! an `_at` form that is a pure function of the supplied instant, with a
//! now-based convenience wrapper on top.
//!
//! The storage date ("market date") rolls over at 08:30 ET, one hour before
//! the 09:30 open: between midnight and 08:30 ET a moment still belongs to
//! the previous day's session. Weekend dates collapse to the prior Friday.

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::America::New_York;
use chrono_tz::Tz;

/// Market timezone (US Eastern).
pub const MARKET_TIMEZONE: Tz = New_York;

fn market_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 30, 0).unwrap()
}

fn market_close() -> NaiveTime {
    NaiveTime::from_hms_opt(16, 0, 0).unwrap()
}

fn rollover_time() -> NaiveTime {
    NaiveTime::from_hms_opt(8, 30, 0).unwrap()
}

/// Current time in the market timezone.
pub fn now_market_time() -> DateTime<Tz> {
    Utc::now().with_timezone(&MARKET_TIMEZONE)
}

pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Friday for weekend dates, the date itself otherwise.
pub fn last_trading_day(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Days::new(1),
        Weekday::Sun => date - Days::new(2),
        _ => date,
    }
}

/// Whether the market is open at `now`: 09:30-16:00 ET, Monday-Friday.
pub fn is_market_open_at(now: DateTime<Utc>) -> bool {
    let et = now.with_timezone(&MARKET_TIMEZONE);
    if is_weekend(et.date_naive()) {
        return false;
    }
    let time = et.time();
    time >= market_open() && time <= market_close()
}

pub fn is_market_open() -> bool {
    is_market_open_at(Utc::now())
}

/// The market date that `now` belongs to. Before 08:30 ET the previous
/// calendar day is still the active session date. No weekend adjustment;
/// storage paths apply that separately via [`storage_date`].
pub fn market_date_at(now: DateTime<Utc>) -> NaiveDate {
    let et = now.with_timezone(&MARKET_TIMEZONE);
    if et.time() < rollover_time() {
        et.date_naive() - Days::new(1)
    } else {
        et.date_naive()
    }
}

pub fn market_date() -> NaiveDate {
    market_date_at(Utc::now())
}

/// Market date for an arbitrary epoch timestamp (seconds). Weekend moments
/// collapse to the prior Friday; weekday moments before 08:30 ET belong to
/// the previous day.
pub fn market_date_for_timestamp(timestamp_secs: f64) -> NaiveDate {
    let instant = DateTime::<Utc>::from_timestamp(timestamp_secs as i64, 0)
        .unwrap_or_else(Utc::now);
    let et = instant.with_timezone(&MARKET_TIMEZONE);
    let date = et.date_naive();
    if is_weekend(date) {
        return last_trading_day(date);
    }
    if et.time() < rollover_time() {
        date - Days::new(1)
    } else {
        date
    }
}

/// Date used for on-disk placement: weekends collapse to the prior Friday.
pub fn storage_date(date: NaiveDate) -> NaiveDate {
    if is_weekend(date) {
        last_trading_day(date)
    } else {
        date
    }
}
