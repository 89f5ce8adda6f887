//! Calendar math for booking ranges. Bookings are whole calendar days with no time
//! component; comparisons go through [`day_index`] so no time zone can shift them.

use jiff::civil::Date;
use jiff::tz::TimeZone;
use jiff::{Timestamp, ToSpan};

use crate::model::Ms;

const EPOCH: Date = jiff::civil::date(1970, 1, 1);

/// Parse a strict `YYYY-MM-DD` date. Anything else, including calendar dates that do
/// not exist (Feb 30), yields `None`.
pub fn parse_date(s: &str) -> Option<Date> {
    let bytes = s.as_bytes();
    if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return None;
    }
    let digits_ok = bytes
        .iter()
        .enumerate()
        .all(|(i, b)| i == 4 || i == 7 || b.is_ascii_digit());
    if !digits_ok {
        return None;
    }
    let year: i16 = s[0..4].parse().ok()?;
    let month: i8 = s[5..7].parse().ok()?;
    let day: i8 = s[8..10].parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    let date = Date::new(year, month, day).ok()?;
    // Round-trip the components back out.
    if date.year() != year || date.month() != month || date.day() != day {
        return None;
    }
    Some(date)
}

/// Whole UTC days since 1970-01-01.
pub fn day_index(date: Date) -> i64 {
    // Differences between two civil dates always fit a day span.
    date.since(EPOCH).map_or(0, |span| i64::from(span.get_days()))
}

/// Inclusive number of days from `start` to `end`; zero or negative when reversed.
pub fn duration_days(start: Date, end: Date) -> i64 {
    day_index(end) - day_index(start) + 1
}

/// Every date from `start` to `end` inclusive, or `None` when `start > end`.
pub fn list_dates(start: Date, end: Date) -> Option<Vec<Date>> {
    if start > end {
        return None;
    }
    Some(start.series(1.day()).take_while(|d| *d <= end).collect())
}

/// The calendar date a person in `tz` sees at instant `now`. `None` for an unknown
/// zone name or an out-of-range instant.
pub fn today_in_time_zone(tz: &str, now: Ms) -> Option<Date> {
    let ts = Timestamp::from_millisecond(now).ok()?;
    let zone = TimeZone::get(tz).ok()?;
    Some(ts.to_zoned(zone).date())
}

/// Today in `tz`, falling back to UTC when the zone is unknown.
pub fn today_or_utc(tz: &str, now: Ms) -> Date {
    if let Some(today) = today_in_time_zone(tz, now) {
        return today;
    }
    tracing::warn!("unknown time zone {tz:?}, using UTC");
    Timestamp::from_millisecond(now)
        .map(|ts| ts.to_zoned(TimeZone::UTC).date())
        .unwrap_or(EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jiff::civil::date;

    fn ms(s: &str) -> Ms {
        s.parse::<Timestamp>().unwrap().as_millisecond()
    }

    #[test]
    fn parse_accepts_strict_iso() {
        assert_eq!(parse_date("2025-06-01"), Some(date(2025, 6, 1)));
        assert_eq!(parse_date("2024-02-29"), Some(date(2024, 2, 29)));
    }

    #[test]
    fn parse_rejects_nonexistent_dates() {
        assert_eq!(parse_date("2025-02-29"), None);
        assert_eq!(parse_date("2025-02-30"), None);
        assert_eq!(parse_date("2025-04-31"), None);
        assert_eq!(parse_date("2025-13-01"), None);
        assert_eq!(parse_date("2025-00-10"), None);
        assert_eq!(parse_date("2025-01-00"), None);
    }

    #[test]
    fn parse_rejects_loose_formats() {
        for s in [
            "2025-6-1",
            "2025/06/01",
            "2025-06-01T00:00",
            " 2025-06-01",
            "+025-06-01",
            "20250601",
            "",
            "abcd-ef-gh",
        ] {
            assert_eq!(parse_date(s), None, "{s:?} should be rejected");
        }
    }

    #[test]
    fn day_index_counts_from_epoch() {
        assert_eq!(day_index(date(1970, 1, 1)), 0);
        assert_eq!(day_index(date(1970, 1, 2)), 1);
        assert_eq!(day_index(date(2000, 1, 1)), 10_957);
        assert_eq!(day_index(date(1969, 12, 31)), -1);
        assert!(day_index(date(2025, 3, 1)) - day_index(date(2025, 2, 28)) == 1);
    }

    #[test]
    fn duration_is_inclusive() {
        assert_eq!(duration_days(date(2025, 6, 1), date(2025, 6, 1)), 1);
        assert_eq!(duration_days(date(2025, 6, 1), date(2025, 6, 3)), 3);
        assert_eq!(duration_days(date(2025, 6, 3), date(2025, 6, 1)), -1);
    }

    #[test]
    fn list_dates_inclusive_across_month_end() {
        let dates = list_dates(date(2025, 1, 30), date(2025, 2, 2)).unwrap();
        let shown: Vec<String> = dates.iter().map(|d| d.to_string()).collect();
        assert_eq!(shown, vec!["2025-01-30", "2025-01-31", "2025-02-01", "2025-02-02"]);
        assert_eq!(list_dates(date(2025, 6, 1), date(2025, 6, 1)).unwrap().len(), 1);
    }

    #[test]
    fn list_dates_rejects_reversed_range() {
        assert_eq!(list_dates(date(2025, 6, 3), date(2025, 6, 1)), None);
    }

    #[test]
    fn today_depends_on_zone() {
        let now = ms("2025-06-01T02:00:00Z");
        assert_eq!(today_in_time_zone("UTC", now), Some(date(2025, 6, 1)));
        assert_eq!(today_in_time_zone("America/Los_Angeles", now), Some(date(2025, 5, 31)));
        assert_eq!(today_in_time_zone("Pacific/Auckland", now), Some(date(2025, 6, 1)));
        let late = ms("2025-06-01T13:00:00Z");
        assert_eq!(today_in_time_zone("Pacific/Auckland", late), Some(date(2025, 6, 2)));
    }

    #[test]
    fn unknown_zone_falls_back_to_utc() {
        let now = ms("2025-06-01T23:30:00Z");
        assert_eq!(today_in_time_zone("Mars/Olympus_Mons", now), None);
        assert_eq!(today_or_utc("Mars/Olympus_Mons", now), date(2025, 6, 1));
    }
}
