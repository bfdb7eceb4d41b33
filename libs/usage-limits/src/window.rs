//! Accounting window arithmetic.
//!
//! Every computation here is done on `DateTime<Utc>`; nothing consults the host
//! timezone. Calendar windows are closed ranges that end one nanosecond before
//! the next window begins.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Months added to a window end to obtain a record's retention deadline.
pub const RETENTION_MONTHS: u32 = 3;

/// Maps a reference instant to the boundaries of the window that contains it.
pub trait WindowCalculator {
    fn window_start(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>>;

    fn window_end(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>>;

    fn window(&self, at: DateTime<Utc>) -> Window {
        Window {
            start: self.window_start(at),
            end: self.window_end(at),
        }
    }
}

/// A `[start, end]` range. Either bound may be open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Window {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl Window {
    pub const UNBOUNDED: Window = Window {
        start: None,
        end: None,
    };

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start.map_or(true, |start| start <= instant)
            && self.end.map_or(true, |end| instant <= end)
    }

    /// Retention deadline for records accounted in this window, if it has an end.
    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.end
            .and_then(|end| end.checked_add_months(Months::new(RETENTION_MONTHS)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Periodicity {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl Periodicity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Periodicity::Hour => "HOUR",
            Periodicity::Day => "DAY",
            Periodicity::Week => "WEEK",
            Periodicity::Month => "MONTH",
            Periodicity::Year => "YEAR",
        }
    }

    /// Start of the calendar unit enclosing `at`.
    pub fn truncate(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let date = at.date_naive();
        let start_date = match self {
            Periodicity::Hour => {
                let hour = NaiveTime::from_hms_opt(at.hour(), 0, 0).unwrap_or(NaiveTime::MIN);
                return date.and_time(hour).and_utc();
            }
            Periodicity::Day => date,
            Periodicity::Week => {
                date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
            }
            Periodicity::Month => date.with_day(1).unwrap_or(date),
            Periodicity::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date),
        };
        start_date.and_time(NaiveTime::MIN).and_utc()
    }

    /// Start of the calendar unit following the one that begins at `start`.
    fn advance(&self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Periodicity::Hour => start.checked_add_signed(Duration::hours(1)),
            Periodicity::Day => start.checked_add_signed(Duration::days(1)),
            Periodicity::Week => start.checked_add_signed(Duration::weeks(1)),
            Periodicity::Month => start.checked_add_months(Months::new(1)),
            Periodicity::Year => start.checked_add_months(Months::new(12)),
        }
    }
}

impl WindowCalculator for Periodicity {
    fn window_start(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        Some(self.truncate(at))
    }

    fn window_end(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.advance(self.truncate(at))
            .and_then(|next| next.checked_sub_signed(Duration::nanoseconds(1)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SlidingUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
}

impl SlidingUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlidingUnit::Minutes => "MINUTES",
            SlidingUnit::Hours => "HOURS",
            SlidingUnit::Days => "DAYS",
            SlidingUnit::Weeks => "WEEKS",
            SlidingUnit::Months => "MONTHS",
        }
    }

    /// `at` moved back by `amount` of this unit.
    pub fn rewind(&self, at: DateTime<Utc>, amount: u32) -> Option<DateTime<Utc>> {
        let amount_i64 = i64::from(amount);
        match self {
            SlidingUnit::Minutes => at.checked_sub_signed(Duration::minutes(amount_i64)),
            SlidingUnit::Hours => at.checked_sub_signed(Duration::hours(amount_i64)),
            SlidingUnit::Days => at.checked_sub_signed(Duration::days(amount_i64)),
            SlidingUnit::Weeks => at.checked_sub_signed(Duration::weeks(amount_i64)),
            SlidingUnit::Months => at.checked_sub_months(Months::new(amount)),
        }
    }
}

/// A window of fixed span that always ends at the reference instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingSpan {
    pub unit: SlidingUnit,
    pub duration: u32,
}

impl WindowCalculator for SlidingSpan {
    fn window_start(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.unit.rewind(at, self.duration)
    }

    fn window_end(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        Some(at)
    }
}

/// Usage accumulates without any time boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Unbounded;

impl WindowCalculator for Unbounded {
    fn window_start(&self, _at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        None
    }

    fn window_end(&self, _at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_week_window_is_monday_to_sunday() {
        let at = utc("2024-02-20T10:15:33.000007Z");
        let window = Periodicity::Week.window(at);
        assert_eq!(window.start, Some(utc("2024-02-19T00:00:00Z")));
        assert_eq!(window.end, Some(utc("2024-02-25T23:59:59.999999999Z")));
    }

    #[test]
    fn test_week_window_starting_on_monday() {
        let at = utc("2024-02-19T00:00:00Z");
        assert_eq!(Periodicity::Week.window_start(at), Some(at));
    }

    #[test]
    fn test_month_window_honors_leap_year() {
        let at = utc("2024-02-20T10:15:33Z");
        let window = Periodicity::Month.window(at);
        assert_eq!(window.start, Some(utc("2024-02-01T00:00:00Z")));
        assert_eq!(window.end, Some(utc("2024-02-29T23:59:59.999999999Z")));

        let non_leap = Periodicity::Month.window_end(utc("2023-02-10T00:00:00Z"));
        assert_eq!(non_leap, Some(utc("2023-02-28T23:59:59.999999999Z")));
    }

    #[test]
    fn test_hour_day_and_year_windows() {
        let at = utc("2024-12-31T23:42:01.5Z");
        assert_eq!(
            Periodicity::Hour.window(at),
            Window {
                start: Some(utc("2024-12-31T23:00:00Z")),
                end: Some(utc("2024-12-31T23:59:59.999999999Z")),
            }
        );
        assert_eq!(
            Periodicity::Day.window_start(at),
            Some(utc("2024-12-31T00:00:00Z"))
        );
        assert_eq!(
            Periodicity::Year.window(at),
            Window {
                start: Some(utc("2024-01-01T00:00:00Z")),
                end: Some(utc("2024-12-31T23:59:59.999999999Z")),
            }
        );
    }

    #[test]
    fn test_consecutive_calendar_windows_are_adjacent() {
        let periodicities = [
            Periodicity::Hour,
            Periodicity::Day,
            Periodicity::Week,
            Periodicity::Month,
            Periodicity::Year,
        ];
        let samples = [
            "2024-01-31T12:00:00Z",
            "2024-02-29T23:59:59.999999999Z",
            "2023-12-31T00:00:00Z",
            "2025-06-15T07:30:00.123Z",
        ];

        for periodicity in periodicities {
            for sample in samples {
                let at = utc(sample);
                let start = periodicity.window_start(at).unwrap();
                let end = periodicity.window_end(at).unwrap();
                assert!(start <= at && at <= end, "{periodicity:?} at {sample}");

                let next = end + Duration::nanoseconds(1);
                assert_eq!(periodicity.window_start(next), Some(next));
            }
        }
    }

    #[test]
    fn test_sliding_window_moves_with_reference() {
        let span = SlidingSpan {
            unit: SlidingUnit::Days,
            duration: 30,
        };
        let now = utc("2024-03-10T08:00:00Z");
        let window = span.window(now);
        assert_eq!(window.start, Some(now - Duration::days(30)));
        assert_eq!(window.end, Some(now));

        let later = now + Duration::minutes(90);
        let shifted = span.window(later);
        assert_eq!(
            shifted.start.unwrap() - window.start.unwrap(),
            Duration::minutes(90)
        );
        assert_eq!(shifted.end.unwrap() - window.end.unwrap(), Duration::minutes(90));
    }

    #[test]
    fn test_sliding_months_use_calendar_arithmetic() {
        let span = SlidingSpan {
            unit: SlidingUnit::Months,
            duration: 1,
        };
        assert_eq!(
            span.window_start(utc("2024-03-31T00:00:00Z")),
            Some(utc("2024-02-29T00:00:00Z"))
        );
    }

    #[test]
    fn test_unbounded_has_no_boundaries() {
        let window = Unbounded.window(Utc::now());
        assert!(window.is_unbounded());
        assert_eq!(window.expiration(), None);
    }

    #[test]
    fn test_expiration_is_three_months_after_end() {
        let window = Periodicity::Month.window(utc("2024-01-15T00:00:00Z"));
        assert_eq!(
            window.expiration(),
            Some(utc("2024-04-30T23:59:59.999999999Z"))
        );
    }
}
