//! Date operators. Dates are converted into the requested timezone before
//! any component is read, so day, week and year boundaries follow local
//! time.

use chrono::{DateTime, Datelike, NaiveDateTime, Offset, TimeDelta, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use super::{string_arg, ArgShape, Registry};
use crate::context::EvalContext;
use crate::error::{Error, Result};
use crate::value::Value;

const DEFAULT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S.%LZ";

const DATE_PARTS: ArgShape = ArgShape::Named {
    names: &["date", "timezone"],
    required: &["date"],
};

pub(super) fn register(registry: &mut Registry) {
    registry.add(
        "$dateToString",
        ArgShape::Named {
            names: &["format", "date", "timezone", "onNull"],
            required: &["date"],
        },
        date_to_string,
    );
    registry.add("$year", DATE_PARTS, |a, c| part(a, c, "$year", |d| d.year() as i64));
    registry.add("$month", DATE_PARTS, |a, c| part(a, c, "$month", |d| d.month() as i64));
    registry.add("$dayOfMonth", DATE_PARTS, |a, c| part(a, c, "$dayOfMonth", |d| d.day() as i64));
    registry.add("$dayOfYear", DATE_PARTS, |a, c| part(a, c, "$dayOfYear", |d| d.ordinal() as i64));
    registry.add("$dayOfWeek", DATE_PARTS, |a, c| {
        part(a, c, "$dayOfWeek", |d| d.weekday().number_from_sunday() as i64)
    });
    registry.add("$isoDayOfWeek", DATE_PARTS, |a, c| {
        part(a, c, "$isoDayOfWeek", |d| d.weekday().number_from_monday() as i64)
    });
    registry.add("$hour", DATE_PARTS, |a, c| part(a, c, "$hour", |d| d.hour() as i64));
    registry.add("$minute", DATE_PARTS, |a, c| part(a, c, "$minute", |d| d.minute() as i64));
    registry.add("$second", DATE_PARTS, |a, c| part(a, c, "$second", |d| d.second() as i64));
    registry.add("$millisecond", DATE_PARTS, |a, c| {
        part(a, c, "$millisecond", |d| (d.nanosecond() / 1_000_000) as i64)
    });
    registry.add("$isoWeek", DATE_PARTS, |a, c| part(a, c, "$isoWeek", |d| d.iso_week().week() as i64));
    registry.add("$isoWeekYear", DATE_PARTS, |a, c| {
        part(a, c, "$isoWeekYear", |d| d.iso_week().year() as i64)
    });
}

/// A resolved timezone: an IANA zone or a fixed `+hh:mm` offset.
#[derive(Debug, Clone, Copy)]
enum Zone {
    Named(Tz),
    Fixed(i32),
}

impl Zone {
    fn parse(op: &str, spec: &str) -> Result<Self> {
        if let Some(secs) = parse_offset(spec) {
            return Ok(Zone::Fixed(secs));
        }
        spec.parse::<Tz>()
            .map(Zone::Named)
            .map_err(|_| Error::argument(op, format!("unknown timezone '{spec}'")))
    }

    /// Local wall time and its offset from UTC in seconds. Dates whose
    /// local time falls outside the representable range are rejected.
    fn localize(&self, op: &str, dt: &DateTime<Utc>) -> Result<(NaiveDateTime, i32)> {
        let offset = match self {
            Zone::Named(tz) => tz.offset_from_utc_datetime(&dt.naive_utc()).fix().local_minus_utc(),
            Zone::Fixed(secs) => *secs,
        };
        let local = TimeDelta::try_seconds(i64::from(offset))
            .and_then(|delta| dt.naive_utc().checked_add_signed(delta))
            .ok_or_else(|| Error::argument(op, "date is out of range in this timezone"))?;
        Ok((local, offset))
    }
}

/// `+hh`, `+hhmm` or `+hh:mm` (and the `-` forms).
fn parse_offset(spec: &str) -> Option<i32> {
    let sign = match spec.as_bytes().first()? {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let digits: String = spec[1..].chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(sign * (hours * 3600 + minutes * 60))
}

fn zone(op: &str, arg: Option<&Value>, ctx: &EvalContext<'_>) -> Result<Zone> {
    match arg.filter(|v| !v.is_nullish()) {
        Some(v) => Zone::parse(op, string_arg(op, v)?),
        None => Ok(Zone::Named(ctx.runtime.timezone)),
    }
}

fn to_date(op: &str, value: &Value) -> Result<DateTime<Utc>> {
    value
        .to_date()
        .ok_or_else(|| Error::argument(op, format!("expected a date, got {}", value.type_name())))
}

fn part(
    args: &[Value],
    ctx: &EvalContext<'_>,
    op: &str,
    extract: fn(&NaiveDateTime) -> i64,
) -> Result<Value> {
    if args[0].is_nullish() {
        return Ok(Value::Null);
    }
    let dt = to_date(op, &args[0])?;
    let (local, _) = zone(op, args.get(1), ctx)?.localize(op, &dt)?;
    Ok(Value::Int(extract(&local)))
}

fn date_to_string(args: &[Value], ctx: &EvalContext<'_>) -> Result<Value> {
    let date = args.get(1).unwrap_or(&Value::Missing);
    if date.is_nullish() {
        return Ok(match args.get(3) {
            Some(on_null) if !on_null.is_missing() => on_null.clone(),
            _ => Value::Null,
        });
    }
    let format = match args.first().filter(|v| !v.is_nullish()) {
        Some(v) => string_arg("$dateToString", v)?,
        None => DEFAULT_FORMAT,
    };
    let dt = to_date("$dateToString", date)?;
    let zone = zone("$dateToString", args.get(2), ctx)?;
    render(&dt, format, zone).map(Value::String)
}

/// Format `date` with `$dateToString` tokens in the given timezone (an IANA
/// name or a `+hh:mm` offset).
pub fn format_date_with(date: &DateTime<Utc>, format: &str, timezone: &str) -> Result<String> {
    render(date, format, Zone::parse("$dateToString", timezone)?)
}

fn render(dt: &DateTime<Utc>, format: &str, zone: Zone) -> Result<String> {
    let (local, offset) = zone.localize("$dateToString", dt)?;
    let mut out = String::with_capacity(format.len() + 8);
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let Some(token) = chars.next() else {
            return Err(Error::argument("$dateToString", "format ends with a lone '%'"));
        };
        match token {
            'd' => out.push_str(&format!("{:02}", local.day())),
            'G' => out.push_str(&format!("{:04}", local.iso_week().year())),
            'H' => out.push_str(&format!("{:02}", local.hour())),
            'j' => out.push_str(&format!("{:03}", local.ordinal())),
            'L' => out.push_str(&format!("{:03}", local.nanosecond() / 1_000_000)),
            'm' => out.push_str(&format!("{:02}", local.month())),
            'M' => out.push_str(&format!("{:02}", local.minute())),
            'S' => out.push_str(&format!("{:02}", local.second())),
            'w' => out.push_str(&local.weekday().number_from_sunday().to_string()),
            'u' => out.push_str(&local.weekday().number_from_monday().to_string()),
            'U' => out.push_str(&local.format("%U").to_string()),
            'V' => out.push_str(&format!("{:02}", local.iso_week().week())),
            'Y' => out.push_str(&format!("{:04}", local.year())),
            'z' => {
                let sign = if offset < 0 { '-' } else { '+' };
                let abs = offset.abs();
                out.push_str(&format!("{sign}{:02}{:02}", abs / 3600, (abs % 3600) / 60));
            }
            'Z' => out.push_str(&(offset / 60).to_string()),
            '%' => out.push('%'),
            other => {
                return Err(Error::argument(
                    "$dateToString",
                    format!("unsupported format token '%{other}'"),
                ));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> DateTime<Utc> {
        Value::from(s).to_date().unwrap()
    }

    #[test]
    fn day_boundary_moves_with_timezone() {
        let d = date("2021-11-09T23:15:00.000Z");
        assert_eq!(format_date_with(&d, "%d/%m/%G", "UTC").unwrap(), "09/11/2021");
        assert_eq!(format_date_with(&d, "%d/%m/%G", "Asia/Seoul").unwrap(), "10/11/2021");
    }

    #[test]
    fn iso_week_year_crosses_calendar_year() {
        // 2021-01-01 is a Friday in ISO week 53 of 2020.
        let d = date("2021-01-01T12:00:00Z");
        assert_eq!(format_date_with(&d, "%G-W%V", "UTC").unwrap(), "2020-W53");
        // Late on Dec 31 2024 UTC is already Jan 1 2025 in Seoul; both fall in
        // ISO week 1 of 2025.
        let d = date("2024-12-31T20:00:00Z");
        assert_eq!(format_date_with(&d, "%Y %G %V", "UTC").unwrap(), "2024 2025 01");
        assert_eq!(format_date_with(&d, "%Y %G %V", "Asia/Seoul").unwrap(), "2025 2025 01");
        // Sunday Jan 3 2021 local time is still ISO week 53 of 2020.
        let d = date("2021-01-03T20:00:00Z");
        assert_eq!(format_date_with(&d, "%G", "UTC").unwrap(), "2020");
        assert_eq!(format_date_with(&d, "%G", "Asia/Seoul").unwrap(), "2021");
    }

    #[test]
    fn full_token_set() {
        let d = date("2021-11-09T23:15:07.042Z");
        assert_eq!(
            format_date_with(&d, "%Y-%m-%dT%H:%M:%S.%L %j %w %u %z %Z %%", "UTC").unwrap(),
            "2021-11-09T23:15:07.042 313 3 2 +0000 0 %"
        );
        assert_eq!(format_date_with(&d, "%H:%M %z %Z", "+05:30").unwrap(), "04:45 +0530 330");
        assert_eq!(format_date_with(&d, "%H %z", "America/New_York").unwrap(), "18 -0500");
    }

    #[test]
    fn local_time_beyond_the_last_date_is_an_error() {
        let d = DateTime::<Utc>::MAX_UTC;
        let err = format_date_with(&d, "%Y", "+05:00").unwrap_err();
        assert_eq!(err.code(), "cortex.invalidArgument.operator");
        assert_eq!(format_date_with(&d, "%Y", "-05:00").unwrap(), "262143");
    }

    #[test]
    fn rejects_unknown_tokens_and_zones() {
        let d = date("2021-11-09T23:15:00Z");
        assert!(format_date_with(&d, "%Q", "UTC").is_err());
        assert!(format_date_with(&d, "%Y", "Mars/Base").is_err());
        assert!(format_date_with(&d, "abc%", "UTC").is_err());
    }
}
