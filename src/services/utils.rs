//! # utils.rs
//!
//! Enthält allgemeine Hilfsfunktionen für Zeit und Datum: die `Clock`-Abstraktion
//! sowie die festen Datumsformate des Redemption-Payloads.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, Timelike, Utc};
use std::sync::Mutex;

/// Datumsformat des `ISSUED`-Segments (`YYYYMMDD`).
pub const PAYLOAD_DATE_FORMAT: &str = "%Y%m%d";
/// Zeitstempelformat des `TS`-Segments (`YYYYMMDDHHMM`).
pub const PAYLOAD_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M";

/// Zeitquelle der Zustandsmaschine.
///
/// "Heute" ist immer das lokale Datum des Servers.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        local_date(&self.now())
    }
}

/// Die Systemuhr.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Eine einstellbare Uhr für Tests und Replays.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        FixedClock { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Das lokale Kalenderdatum eines UTC-Zeitpunkts.
pub fn local_date(at: &DateTime<Utc>) -> NaiveDate {
    at.with_timezone(&Local).date_naive()
}

/// Die lokale Uhrzeit eines UTC-Zeitpunkts, auf die Minute gekürzt.
pub fn local_minute(at: &DateTime<Utc>) -> NaiveDateTime {
    let local = at.with_timezone(&Local).naive_local();
    local
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(local)
}

pub fn format_payload_date(date: NaiveDate) -> String {
    date.format(PAYLOAD_DATE_FORMAT).to_string()
}

pub fn format_payload_timestamp(at: NaiveDateTime) -> String {
    at.format(PAYLOAD_TIMESTAMP_FORMAT).to_string()
}

/// Parst ein `YYYYMMDD`-Datum. Es werden genau 8 Ziffern verlangt.
pub fn parse_payload_date(value: &str) -> Option<NaiveDate> {
    if value.len() != 8 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(value, PAYLOAD_DATE_FORMAT).ok()
}

/// Parst einen `YYYYMMDDHHMM`-Zeitstempel. Es werden genau 12 Ziffern verlangt.
pub fn parse_payload_timestamp(value: &str) -> Option<NaiveDateTime> {
    if value.len() != 12 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDateTime::parse_from_str(value, PAYLOAD_TIMESTAMP_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_payload_date_round_trip_and_strictness() {
        let date = NaiveDate::from_ymd_opt(2024, 12, 5).unwrap();
        assert_eq!(format_payload_date(date), "20241205");
        assert_eq!(parse_payload_date("20241205"), Some(date));
        assert_eq!(parse_payload_date("2024125"), None);
        assert_eq!(parse_payload_date("20241305"), None);
        assert_eq!(parse_payload_date("2024-1205"), None);
    }

    #[test]
    fn test_payload_timestamp_parsing() {
        let ts = parse_payload_timestamp("202412051430").unwrap();
        assert_eq!(format_payload_timestamp(ts), "202412051430");
        assert!(parse_payload_timestamp("2024120514").is_none());
        assert!(parse_payload_timestamp("202412052460").is_none());
    }

    #[test]
    fn test_local_minute_truncates_seconds() {
        let at = Local.with_ymd_and_hms(2024, 12, 5, 14, 30, 59).unwrap().with_timezone(&Utc);
        assert_eq!(format_payload_timestamp(local_minute(&at)), "202412051430");
    }

    #[test]
    fn test_fixed_clock_can_be_moved() {
        let start = Utc.with_ymd_and_hms(2024, 12, 5, 12, 0, 0).unwrap();
        let clock = FixedClock::new(start);
        assert_eq!(clock.now(), start);
        let later = start + chrono::Duration::days(1);
        clock.set(later);
        assert_eq!(clock.now(), later);
    }
}
