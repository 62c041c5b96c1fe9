//! Conversions between absolute instants and wall-clock fields in a named zone.
//!
//! Everything here is pure. Zones are IANA names resolved through `chrono-tz`;
//! the process-local zone is never consulted.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Offset, SecondsFormat, TimeDelta, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::model::Ms;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M";
const TIME_FORMAT_PRECISE: &str = "%H:%M:%S%.3f";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TzError {
    InvalidZone(String),
    InvalidDateTime(String),
}

impl std::fmt::Display for TzError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TzError::InvalidZone(z) => write!(f, "unknown timezone: {z}"),
            TzError::InvalidDateTime(s) => write!(f, "invalid date/time: {s}"),
        }
    }
}

impl std::error::Error for TzError {}

/// A calendar date and time of day with no zone attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WallClock {
    pub date: String,
    pub time: String,
}

pub fn parse_zone(name: &str) -> Result<Tz, TzError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| TzError::InvalidZone(name.to_string()))
}

pub fn parse_date(date: &str) -> Result<NaiveDate, TzError> {
    NaiveDate::parse_from_str(date.trim(), DATE_FORMAT)
        .map_err(|e| TzError::InvalidDateTime(format!("{date}: {e}")))
}

/// Accepts `HH:MM`, `HH:MM:SS` and `HH:MM:SS.fff`.
pub fn parse_time(time: &str) -> Result<NaiveTime, TzError> {
    let t = time.trim();
    NaiveTime::parse_from_str(t, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(t, TIME_FORMAT))
        .map_err(|e| TzError::InvalidDateTime(format!("{time}: {e}")))
}

fn utc_datetime(instant: Ms) -> Result<DateTime<Utc>, TzError> {
    DateTime::from_timestamp_millis(instant)
        .ok_or_else(|| TzError::InvalidDateTime(format!("instant out of range: {instant}")))
}

/// Project an instant into `zone` as wall-clock date and time.
///
/// Whole minutes render as `HH:MM`; anything finer keeps seconds and
/// milliseconds so that [`to_absolute`] gives back the same instant.
pub fn to_display(instant: Ms, zone: &str) -> Result<WallClock, TzError> {
    let tz = parse_zone(zone)?;
    let local = utc_datetime(instant)?.with_timezone(&tz);
    let time_format = if local.second() == 0 && local.nanosecond() == 0 {
        TIME_FORMAT
    } else {
        TIME_FORMAT_PRECISE
    };
    Ok(WallClock {
        date: local.format(DATE_FORMAT).to_string(),
        time: local.format(time_format).to_string(),
    })
}

/// Interpret `date` + `time` as wall-clock time in `zone` and return the UTC instant.
///
/// A repeated local time (DST fall-back) resolves to the earlier instant. A skipped
/// local time (spring-forward gap) uses the offset in force before the gap, which
/// lands past the transition.
pub fn to_absolute(date: &str, time: &str, zone: &str) -> Result<Ms, TzError> {
    let tz = parse_zone(zone)?;
    let naive = NaiveDateTime::new(parse_date(date)?, parse_time(time)?);
    if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
        return Ok(dt.timestamp_millis());
    }
    let before = naive
        .checked_sub_signed(TimeDelta::days(1))
        .ok_or_else(|| TzError::InvalidDateTime(format!("{date} {time}")))?;
    let offset = tz.offset_from_utc_datetime(&before).fix().local_minus_utc();
    let utc = naive
        .checked_sub_signed(TimeDelta::seconds(offset as i64))
        .ok_or_else(|| TzError::InvalidDateTime(format!("{date} {time}")))?;
    Ok(utc.and_utc().timestamp_millis())
}

/// RFC 3339 with milliseconds; offset-qualified in `zone`, or `Z` without one.
pub fn to_rfc3339(instant: Ms, zone: Option<&str>) -> Result<String, TzError> {
    let utc = utc_datetime(instant)?;
    match zone {
        Some(z) => {
            let tz = parse_zone(z)?;
            Ok(utc.with_timezone(&tz).to_rfc3339_opts(SecondsFormat::Millis, true))
        }
        None => Ok(utc.to_rfc3339_opts(SecondsFormat::Millis, true)),
    }
}

/// Integer Unix milliseconds or an RFC 3339 timestamp.
pub fn parse_instant(text: &str) -> Result<Ms, TzError> {
    let t = text.trim();
    if let Ok(ms) = t.parse::<Ms>() {
        return Ok(ms);
    }
    DateTime::parse_from_rfc3339(t)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| TzError::InvalidDateTime(format!("{text}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const JAN_10_14H: Ms = 1_736_517_600_000; // 2025-01-10T14:00:00Z

    #[test]
    fn display_in_zone() {
        let wc = to_display(JAN_10_14H, "America/New_York").unwrap();
        assert_eq!(wc.date, "2025-01-10");
        assert_eq!(wc.time, "09:00");

        let wc = to_display(JAN_10_14H, "Asia/Tokyo").unwrap();
        assert_eq!(wc.date, "2025-01-10");
        assert_eq!(wc.time, "23:00");

        let wc = to_display(JAN_10_14H, "Pacific/Kiritimati").unwrap();
        assert_eq!(wc.date, "2025-01-11");
        assert_eq!(wc.time, "04:00");
    }

    #[test]
    fn display_keeps_sub_minute_precision() {
        let wc = to_display(JAN_10_14H + 30_400, "UTC").unwrap();
        assert_eq!(wc.time, "14:00:30.400");
    }

    #[test]
    fn absolute_uses_given_zone() {
        assert_eq!(to_absolute("2025-01-10", "09:00", "America/New_York").unwrap(), JAN_10_14H);
        assert_eq!(to_absolute("2025-01-10", "14:00", "UTC").unwrap(), JAN_10_14H);
        assert_eq!(to_absolute("2025-01-10", "15:00:00", "Europe/Paris").unwrap(), JAN_10_14H);
        assert_eq!(
            to_absolute("2025-01-10", "14:00:00.250", "UTC").unwrap(),
            JAN_10_14H + 250
        );
    }

    #[test]
    fn round_trip_across_zones() {
        let zones = ["UTC", "America/New_York", "Asia/Kolkata", "Australia/Lord_Howe", "Europe/London"];
        let instants = [
            0,
            JAN_10_14H,
            JAN_10_14H + 1,
            JAN_10_14H + 59_999,
            1_751_328_000_000, // 2025-07-01T00:00:00Z
            1_900_000_000_123,
        ];
        for zone in zones {
            for &t in &instants {
                let wc = to_display(t, zone).unwrap();
                assert_eq!(to_absolute(&wc.date, &wc.time, zone).unwrap(), t, "{zone} {t}");
            }
        }
    }

    #[test]
    fn ambiguous_time_resolves_to_earliest() {
        // 2025-11-02 01:30 happens twice in New York; EDT (UTC-4) comes first.
        let t = to_absolute("2025-11-02", "01:30", "America/New_York").unwrap();
        assert_eq!(to_rfc3339(t, None).unwrap(), "2025-11-02T05:30:00.000Z");
    }

    #[test]
    fn skipped_time_shifts_forward() {
        // 2025-03-09 02:30 does not exist in New York.
        let t = to_absolute("2025-03-09", "02:30", "America/New_York").unwrap();
        assert_eq!(to_rfc3339(t, None).unwrap(), "2025-03-09T07:30:00.000Z");
        assert_eq!(to_display(t, "America/New_York").unwrap().time, "03:30");
    }

    #[test]
    fn invalid_zone() {
        assert!(matches!(to_display(0, "Mars/Olympus"), Err(TzError::InvalidZone(_))));
        assert!(matches!(to_absolute("2025-01-01", "09:00", ""), Err(TzError::InvalidZone(_))));
    }

    #[test]
    fn invalid_date_time() {
        assert!(matches!(to_absolute("2025-02-30", "09:00", "UTC"), Err(TzError::InvalidDateTime(_))));
        assert!(matches!(to_absolute("01/10/2025", "09:00", "UTC"), Err(TzError::InvalidDateTime(_))));
        assert!(matches!(to_absolute("2025-01-10", "25:00", "UTC"), Err(TzError::InvalidDateTime(_))));
        assert!(matches!(to_absolute("2025-01-10", "nine", "UTC"), Err(TzError::InvalidDateTime(_))));
    }

    #[test]
    fn rfc3339_projection() {
        assert_eq!(to_rfc3339(JAN_10_14H, None).unwrap(), "2025-01-10T14:00:00.000Z");
        assert_eq!(
            to_rfc3339(JAN_10_14H, Some("America/New_York")).unwrap(),
            "2025-01-10T09:00:00.000-05:00"
        );
    }

    #[test]
    fn parse_instant_forms() {
        assert_eq!(parse_instant("1736517600000").unwrap(), JAN_10_14H);
        assert_eq!(parse_instant("2025-01-10T14:00:00Z").unwrap(), JAN_10_14H);
        assert_eq!(parse_instant("2025-01-10T09:00:00-05:00").unwrap(), JAN_10_14H);
        assert_eq!(parse_instant("2025-01-10T15:00:00.400Z").unwrap(), JAN_10_14H + 3_600_400);
        assert!(parse_instant("yesterday").is_err());
    }
}
