//! Injectable time source with exchange-local wall-clock helpers.
//!
//! Every actor takes a `DynClock` so the scheduler, EOD closer and tests
//! agree on what "now" means. The exchange offset is fixed (no DST on the
//! target market).

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, TimeZone, Utc, Weekday};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::CoreError;

/// Trait for obtaining current time, enabling testability.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Fixed UTC offset of the exchange's local time.
    fn exchange_offset(&self) -> FixedOffset;

    /// Milliseconds since Unix epoch.
    fn now_ms(&self) -> i64 {
        self.now_utc().timestamp_millis()
    }

    /// Current time in exchange-local terms.
    fn now_local(&self) -> DateTime<FixedOffset> {
        self.now_utc().with_timezone(&self.exchange_offset())
    }

    /// Monday through Friday in exchange-local terms. Exchange holidays
    /// are handled operationally (no batch is created), not here.
    fn is_business_day(&self) -> bool {
        !matches!(
            self.now_local().weekday(),
            Weekday::Sat | Weekday::Sun
        )
    }

    /// True once the exchange-local wall clock has reached `time`.
    fn local_time_reached(&self, time: NaiveTime) -> bool {
        self.now_local().time() >= time
    }
}

/// Arc wrapper for clock trait objects.
pub type DynClock = Arc<dyn Clock>;

/// Parse a `"HH:MM"` wall-clock string.
pub fn parse_hhmm(s: &str) -> Result<NaiveTime, CoreError> {
    NaiveTime::parse_from_str(s, "%H:%M").map_err(|e| CoreError::InvalidTime(format!("{s}: {e}")))
}

/// System clock with a fixed exchange offset.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    /// Create with the given UTC offset in hours (e.g. 9 for the default
    /// exchange timezone).
    pub fn with_offset_hours(hours: i32) -> Self {
        Self {
            offset: FixedOffset::east_opt(hours * 3600).expect("offset in range"),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::with_offset_hours(9)
    }
}

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn exchange_offset(&self) -> FixedOffset {
        self.offset
    }
}

/// Manually driven clock for tests.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    offset: FixedOffset,
}

impl ManualClock {
    /// Start at the given epoch milliseconds with the default offset.
    pub fn at_ms(ms: i64) -> Self {
        Self {
            now: Mutex::new(Utc.timestamp_millis_opt(ms).unwrap()),
            offset: FixedOffset::east_opt(9 * 3600).unwrap(),
        }
    }

    /// Start at an exchange-local date and time, e.g. `(2026, 3, 2, "09:05")`.
    pub fn at_local(year: i32, month: u32, day: u32, hhmm: &str) -> Self {
        let offset = FixedOffset::east_opt(9 * 3600).unwrap();
        let time = parse_hhmm(hhmm).expect("valid HH:MM");
        let local = offset
            .with_ymd_and_hms(year, month, day, 0, 0, 0)
            .unwrap()
            .with_time(time)
            .unwrap();
        Self {
            now: Mutex::new(local.with_timezone(&Utc)),
            offset,
        }
    }

    pub fn set_ms(&self, ms: i64) {
        *self.now.lock() = Utc.timestamp_millis_opt(ms).unwrap();
    }

    pub fn advance_ms(&self, ms: i64) {
        let mut now = self.now.lock();
        *now += chrono::Duration::milliseconds(ms);
    }

    /// Jump to an exchange-local wall-clock time on the current date.
    pub fn set_local_time(&self, hhmm: &str) {
        let time = parse_hhmm(hhmm).expect("valid HH:MM");
        let mut now = self.now.lock();
        let local = now.with_timezone(&self.offset);
        *now = local.with_time(time).unwrap().with_timezone(&Utc);
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    fn exchange_offset(&self) -> FixedOffset {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hhmm() {
        assert_eq!(
            parse_hhmm("14:30").unwrap(),
            NaiveTime::from_hms_opt(14, 30, 0).unwrap()
        );
        assert!(parse_hhmm("25:00").is_err());
        assert!(parse_hhmm("noon").is_err());
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::at_ms(1_000_000);
        assert_eq!(clock.now_ms(), 1_000_000);
        clock.advance_ms(2_500);
        assert_eq!(clock.now_ms(), 1_002_500);
    }

    #[test]
    fn test_business_day() {
        // 2026-03-02 is a Monday, 2026-03-01 a Sunday.
        let monday = ManualClock::at_local(2026, 3, 2, "09:00");
        assert!(monday.is_business_day());
        let sunday = ManualClock::at_local(2026, 3, 1, "09:00");
        assert!(!sunday.is_business_day());
    }

    #[test]
    fn test_local_time_reached() {
        let clock = ManualClock::at_local(2026, 3, 2, "14:29");
        let close = parse_hhmm("14:30").unwrap();
        assert!(!clock.local_time_reached(close));
        clock.set_local_time("14:30");
        assert!(clock.local_time_reached(close));
        clock.set_local_time("14:31");
        assert!(clock.local_time_reached(close));
    }

    #[test]
    fn test_system_clock_offset() {
        let clock = SystemClock::with_offset_hours(9);
        assert_eq!(clock.exchange_offset().local_minus_utc(), 9 * 3600);
    }
}
