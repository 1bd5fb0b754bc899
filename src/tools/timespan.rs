//! Cleanup-window time spans.
//!
//! The window setting is a list of `dow/hours` spans separated by `;`,
//! e.g. `1-7/3-4` (every day between 03:00 and 04:00) or `5/23-1`
//! (Fridays from 23:00 to 01:00, wrapping past midnight). Days use
//! 1 = Monday .. 7 = Sunday; hours may be fractional (`20.5-22`).

use anyhow::{bail, Error};
use chrono::{DateTime, Datelike, Local, Timelike};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSpan {
    pub dow_start: u32,
    pub dow_end: u32,
    pub hour_start: f64,
    pub hour_end: f64,
}

impl TimeSpan {
    fn contains(&self, dow: u32, hour: f64) -> bool {
        let dow_match = if self.dow_start <= self.dow_end {
            dow >= self.dow_start && dow <= self.dow_end
        } else {
            dow >= self.dow_start || dow <= self.dow_end
        };
        if !dow_match {
            return false;
        }
        if self.hour_start <= self.hour_end {
            hour >= self.hour_start && hour < self.hour_end
        } else {
            // wraps past midnight
            hour >= self.hour_start || hour < self.hour_end
        }
    }
}

fn parse_range(part: &str, max: f64) -> Result<(f64, f64), Error> {
    let mut it = part.splitn(2, '-');
    let start: f64 = it.next().unwrap_or("").trim().parse()?;
    let end: f64 = match it.next() {
        Some(end) => end.trim().parse()?,
        None => start,
    };
    if start < 0.0 || end < 0.0 || start > max || end > max {
        bail!("time span range '{}' out of bounds", part);
    }
    Ok((start, end))
}

pub fn parse_window(window: &str) -> Result<Vec<TimeSpan>, Error> {
    let mut spans = Vec::new();
    for item in window.split(';') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let mut it = item.splitn(2, '/');
        let dow_part = it.next().unwrap_or("");
        let hour_part = match it.next() {
            Some(hours) => hours,
            None => bail!("time span '{}' is missing the hour part", item),
        };
        let (dow_start, dow_end) = parse_range(dow_part, 7.0)?;
        let (hour_start, hour_end) = parse_range(hour_part, 24.0)?;
        spans.push(TimeSpan {
            dow_start: dow_start as u32,
            dow_end: dow_end as u32,
            hour_start,
            hour_end,
        });
    }
    Ok(spans)
}

/// Whether `now` falls inside any of the given spans.
///
/// An empty list means the default nightly window, 03:00 to 05:00.
pub fn is_in_window(spans: &[TimeSpan], now: DateTime<Local>) -> bool {
    let dow = now.weekday().number_from_monday();
    let hour = now.hour() as f64 + now.minute() as f64 / 60.0;

    if spans.is_empty() {
        return hour >= 3.0 && hour < 5.0;
    }

    spans.iter().any(|span| span.contains(dow, hour))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(dow_day: u32, hour: u32, minute: u32) -> DateTime<Local> {
        // 2021-03-01 is a Monday
        Local.ymd(2021, 3, dow_day).and_hms(hour, minute, 0)
    }

    #[test]
    fn parses_simple_window() {
        let spans = parse_window("1-7/3-4").unwrap();
        assert_eq!(spans.len(), 1);
        assert!(is_in_window(&spans, at(1, 3, 30)));
        assert!(!is_in_window(&spans, at(1, 4, 0)));
    }

    #[test]
    fn wrapping_hours() {
        let spans = parse_window("1-7/23-1").unwrap();
        assert!(is_in_window(&spans, at(2, 23, 15)));
        assert!(is_in_window(&spans, at(2, 0, 30)));
        assert!(!is_in_window(&spans, at(2, 12, 0)));
    }

    #[test]
    fn restricted_days() {
        // 2021-03-06 is a Saturday
        let spans = parse_window("6-7/0-24").unwrap();
        assert!(is_in_window(&spans, at(6, 13, 0)));
        assert!(!is_in_window(&spans, at(3, 13, 0)));
    }

    #[test]
    fn empty_window_means_default_night() {
        assert!(is_in_window(&[], at(1, 3, 10)));
        assert!(is_in_window(&[], at(1, 4, 10)));
        assert!(!is_in_window(&[], at(1, 6, 0)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_window("1-7").is_err());
        assert!(parse_window("1-9/3-4").is_err());
    }
}
