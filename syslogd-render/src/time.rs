//! Time styles for rendered output.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Local, TimeZone, Utc};

use crate::error::RenderError;

/// How a `Time` value is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeStyle {
    /// Seconds since the epoch, verbatim.
    Sec,
    /// `2024-03-01 12:00:00Z`
    Utc,
    /// `2024-03-01 04:00:00` in the local zone.
    Local,
    /// Classic syslog header `Mar  1 04:00:00` in the local zone.
    #[default]
    Legacy,
    /// `2024-03-01 13:00:00+01:00` at a fixed offset.
    Zone(FixedOffset),
}

impl FromStr for TimeStyle {
    type Err = RenderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "sec" | "raw" => return Ok(TimeStyle::Sec),
            "utc" | "zulu" | "z" => return Ok(TimeStyle::Utc),
            "lcl" | "local" => return Ok(TimeStyle::Local),
            "legacy" | "bsd" => return Ok(TimeStyle::Legacy),
            _ => {}
        }
        parse_offset(&lower)
            .map(TimeStyle::Zone)
            .ok_or_else(|| RenderError::UnknownTimeStyle(s.to_string()))
    }
}

impl fmt::Display for TimeStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeStyle::Sec => f.write_str("sec"),
            TimeStyle::Utc => f.write_str("utc"),
            TimeStyle::Local => f.write_str("lcl"),
            TimeStyle::Legacy => f.write_str("legacy"),
            TimeStyle::Zone(offset) => write!(f, "{offset}"),
        }
    }
}

/// `+hh`, `-hh`, `+hhmm` or `+hh:mm`.
fn parse_offset(s: &str) -> Option<FixedOffset> {
    let (sign, digits) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let digits: String = digits.chars().filter(|c| *c != ':').collect();
    let (hours, minutes) = match digits.len() {
        1 | 2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Render `secs` since the epoch in `style`. Values chrono cannot represent
/// fall back to the raw number.
pub fn format_time(secs: i64, style: TimeStyle) -> String {
    let Some(utc) = DateTime::<Utc>::from_timestamp(secs, 0) else {
        return secs.to_string();
    };
    match style {
        TimeStyle::Sec => secs.to_string(),
        TimeStyle::Utc => utc.format("%Y-%m-%d %H:%M:%SZ").to_string(),
        TimeStyle::Local => Local
            .from_utc_datetime(&utc.naive_utc())
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        TimeStyle::Legacy => Local
            .from_utc_datetime(&utc.naive_utc())
            .format("%b %e %H:%M:%S")
            .to_string(),
        TimeStyle::Zone(offset) => offset
            .from_utc_datetime(&utc.naive_utc())
            .format("%Y-%m-%d %H:%M:%S%:z")
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const T: i64 = 1_700_000_000; // 2023-11-14 22:13:20Z

    #[rstest]
    #[case("sec", "1700000000")]
    #[case("utc", "2023-11-14 22:13:20Z")]
    #[case("+01:00", "2023-11-14 23:13:20+01:00")]
    #[case("-0530", "2023-11-14 16:43:20-05:30")]
    fn styles_render(#[case] style: &str, #[case] expected: &str) {
        let style: TimeStyle = style.parse().unwrap();
        assert_eq!(format_time(T, style), expected);
    }

    #[test]
    fn legacy_header_has_fixed_width() {
        let text = format_time(T, TimeStyle::Legacy);
        assert_eq!(text.len(), "Nov 14 22:13:20".len());
    }

    #[test]
    fn unknown_style_is_an_error() {
        assert!("fortnight".parse::<TimeStyle>().is_err());
        assert!("+25".parse::<TimeStyle>().is_err());
    }
}
