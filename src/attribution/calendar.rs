//! US/Eastern exchange calendar: day parsing and market window alignment.
//!
//! Offsets follow the post-2007 US daylight-saving rule (second Sunday of
//! March through first Sunday of November). Exchange holidays are not
//! modelled; weekends are the only non-trading days.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use eventsense_common::MarketWindows;

use crate::errors::ValidationError;

const EST_OFFSET_MINUTES: i32 = -300;
const EDT_OFFSET_MINUTES: i32 = -240;

/// Years for which the daylight-saving rule set above is valid.
pub const SUPPORTED_YEARS: std::ops::RangeInclusive<i32> = 2007..=2099;

/// Parse a `YYYY-MM-DD` day and check it resolves against the exchange calendar.
pub fn parse_selected_day(raw: &str) -> Result<NaiveDate, ValidationError> {
    let trimmed = raw.trim();
    let well_formed = trimmed.len() == 10
        && trimmed
            .char_indices()
            .all(|(i, c)| if i == 4 || i == 7 { c == '-' } else { c.is_ascii_digit() });
    if !well_formed {
        return Err(ValidationError::MalformedDate(raw.to_string()));
    }
    let day = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .map_err(|_| ValidationError::MalformedDate(raw.to_string()))?;
    if !SUPPORTED_YEARS.contains(&day.year()) {
        return Err(ValidationError::UnresolvableDate(raw.to_string()));
    }
    Ok(day)
}

fn nth_sunday(year: i32, month: u32, n: u32) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, Weekday::Sun, n as u8)
}

/// US/Eastern UTC offset in minutes for wall-clock times after 02:00 on `day`.
pub fn utc_offset_minutes(day: NaiveDate) -> i32 {
    let year = day.year();
    match (nth_sunday(year, 3, 2), nth_sunday(year, 11, 1)) {
        (Some(dst_start), Some(dst_end)) if day >= dst_start && day < dst_end => {
            EDT_OFFSET_MINUTES
        }
        _ => EST_OFFSET_MINUTES,
    }
}

fn eastern_to_utc(day: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
    let local = day.and_time(NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN));
    let offset = Duration::minutes(i64::from(utc_offset_minutes(day)));
    Utc.from_utc_datetime(&(local - offset))
}

pub fn is_weekday(day: NaiveDate) -> bool {
    !matches!(day.weekday(), Weekday::Sat | Weekday::Sun)
}

fn previous_weekday(day: NaiveDate) -> NaiveDate {
    let mut prev = day - Duration::days(1);
    while !is_weekday(prev) {
        prev -= Duration::days(1);
    }
    prev
}

/// Resolve a calendar day into exchange-timezone bounded data windows.
pub fn align(day: NaiveDate) -> MarketWindows {
    MarketWindows {
        day,
        is_trading_day: is_weekday(day),
        utc_offset_minutes: utc_offset_minutes(day),
        lookback_start: eastern_to_utc(previous_weekday(day), 16, 0),
        premarket_open: eastern_to_utc(day, 4, 0),
        regular_open: eastern_to_utc(day, 9, 30),
        regular_close: eastern_to_utc(day, 16, 0),
        after_hours_close: eastern_to_utc(day, 20, 0),
    }
}

/// US/Eastern UTC offset in minutes in effect at `instant`.
///
/// Clocks spring forward at 02:00 EST (07:00 UTC) and fall back at 02:00 EDT
/// (06:00 UTC).
pub fn utc_offset_minutes_at(instant: DateTime<Utc>) -> i32 {
    let year = instant.year();
    let (Some(dst_start), Some(dst_end)) = (nth_sunday(year, 3, 2), nth_sunday(year, 11, 1))
    else {
        return EST_OFFSET_MINUTES;
    };
    let two_am = NaiveTime::from_hms_opt(2, 0, 0).unwrap_or(NaiveTime::MIN);
    let starts = Utc.from_utc_datetime(
        &(dst_start.and_time(two_am) - Duration::minutes(i64::from(EST_OFFSET_MINUTES))),
    );
    let ends = Utc.from_utc_datetime(
        &(dst_end.and_time(two_am) - Duration::minutes(i64::from(EDT_OFFSET_MINUTES))),
    );
    if instant >= starts && instant < ends {
        EDT_OFFSET_MINUTES
    } else {
        EST_OFFSET_MINUTES
    }
}

/// Render an instant as exchange wall-clock time, e.g. `16:05 ET`.
pub fn format_time_et(instant: DateTime<Utc>) -> String {
    let offset = utc_offset_minutes_at(instant);
    let local = instant.naive_utc() + Duration::minutes(i64::from(offset));
    format!("{} ET", local.format("%H:%M"))
}
