//! Timezone-aware parsing and formatting of scheduling times.

use chrono::{DateTime, LocalResult, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use thiserror::Error;

/// Format used when rendering an instant for people, e.g. `10/20/2026, 02:30:00 PM`.
const DISPLAY_FORMAT: &str = "%m/%d/%Y, %I:%M:%S %p";

/// Wall-clock formats accepted for schedule input, as produced by `datetime-local` fields.
const LOCAL_INPUT_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimezoneError {
    #[error("unknown timezone `{0}`")]
    UnknownTimezone(String),
    #[error("invalid date/time `{0}`")]
    InvalidDateTime(String),
    #[error("{time} does not exist in {timezone}")]
    NonexistentLocalTime { time: NaiveDateTime, timezone: Tz },
}

/// Parses an IANA timezone name such as `Europe/Berlin`.
pub fn parse_timezone(name: &str) -> Result<Tz, TimezoneError> {
    let name = name.trim();
    name.parse::<Tz>()
        .map_err(|_| TimezoneError::UnknownTimezone(name.to_owned()))
}

/// Returns the timezone configured for this process via `TZ`, falling back to UTC.
pub fn default_timezone() -> Tz {
    std::env::var("TZ")
        .ok()
        .and_then(|name| parse_timezone(&name).ok())
        .unwrap_or(Tz::UTC)
}

/// Interprets `input` as a wall-clock time in `tz` and converts it to UTC.
///
/// RFC 3339 input already carries its offset and is converted as is. Local times that fall into
/// a DST gap are rejected; ambiguous ones resolve to the earlier instant.
pub fn local_to_utc(input: &str, tz: Tz) -> Result<DateTime<Utc>, TimezoneError> {
    let input = input.trim();

    if let Ok(instant) = DateTime::parse_from_rfc3339(input) {
        return Ok(instant.with_timezone(&Utc));
    }

    let naive = LOCAL_INPUT_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(input, format).ok())
        .ok_or_else(|| TimezoneError::InvalidDateTime(input.to_owned()))?;

    match tz.from_local_datetime(&naive) {
        LocalResult::Single(local) => Ok(local.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        LocalResult::None => Err(TimezoneError::NonexistentLocalTime {
            time: naive,
            timezone: tz,
        }),
    }
}

/// Renders `instant` in `tz` using the US style date format.
pub fn format_in_timezone(instant: &DateTime<Utc>, tz: Tz) -> String {
    instant.with_timezone(&tz).format(DISPLAY_FORMAT).to_string()
}

/// Returns the offset of `tz` from UTC in minutes at `instant`.
pub fn offset_minutes(tz: Tz, instant: &DateTime<Utc>) -> i32 {
    tz.offset_from_utc_datetime(&instant.naive_utc())
        .fix()
        .local_minus_utc()
        / 60
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn parses_known_timezones() {
        assert_eq!(parse_timezone("Europe/Berlin").unwrap(), Tz::Europe__Berlin);
        assert_eq!(parse_timezone(" UTC ").unwrap(), Tz::UTC);
        assert_eq!(
            parse_timezone("Mars/Olympus_Mons"),
            Err(TimezoneError::UnknownTimezone("Mars/Olympus_Mons".into()))
        );
    }

    #[test]
    fn converts_wall_clock_to_utc() {
        let tz = Tz::America__New_York;

        assert_eq!(
            local_to_utc("2026-10-20T14:30", tz).unwrap(),
            utc("2026-10-20T18:30:00Z")
        );
        assert_eq!(
            local_to_utc("2026-01-20T14:30:15", tz).unwrap(),
            utc("2026-01-20T19:30:15Z")
        );
        assert_eq!(
            local_to_utc("2026-10-20T14:30:00+02:00", tz).unwrap(),
            utc("2026-10-20T12:30:00Z")
        );
    }

    #[test]
    fn rejects_dst_gap_and_garbage() {
        let tz = Tz::Europe__Berlin;

        assert!(matches!(
            local_to_utc("2026-03-29T02:30", tz),
            Err(TimezoneError::NonexistentLocalTime { .. })
        ));
        assert_eq!(
            local_to_utc("tomorrow", tz),
            Err(TimezoneError::InvalidDateTime("tomorrow".into()))
        );
    }

    #[test]
    fn ambiguous_time_resolves_to_earliest() {
        // 02:30 happens twice in Berlin on 2026-10-25; the first one is still CEST.
        assert_eq!(
            local_to_utc("2026-10-25T02:30", Tz::Europe__Berlin).unwrap(),
            utc("2026-10-25T00:30:00Z")
        );
    }

    #[test]
    fn formats_in_timezone() {
        let instant = utc("2026-10-20T18:30:05Z");

        assert_eq!(
            format_in_timezone(&instant, Tz::America__New_York),
            "10/20/2026, 02:30:05 PM"
        );
        assert_eq!(format_in_timezone(&instant, Tz::UTC), "10/20/2026, 06:30:05 PM");
    }

    #[test]
    fn offsets() {
        assert_eq!(offset_minutes(Tz::Asia__Kolkata, &utc("2026-06-01T00:00:00Z")), 330);
        assert_eq!(offset_minutes(Tz::Europe__Berlin, &utc("2026-06-01T00:00:00Z")), 120);
        assert_eq!(offset_minutes(Tz::Europe__Berlin, &utc("2026-01-01T00:00:00Z")), 60);
        assert_eq!(offset_minutes(Tz::America__New_York, &utc("2026-01-01T00:00:00Z")), -300);
    }
}
