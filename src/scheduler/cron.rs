use chrono::{DateTime, Datelike, Duration, DurationRound, Timelike, Utc};

use crate::error::{PipelineError, Result};

/// Parsed cron expression, evaluated in UTC.
///
/// Accepts 5 fields (`min hour dom month dow`) or 6 with a leading seconds
/// field (`sec min hour dom month dow`). Supported tokens per field:
/// - `*` all values
/// - `*/N`, `A-B/N` and `A/N` steps (`A/N` runs from A to the field maximum)
/// - `A-B` inclusive range
/// - `A,B,C` list
///
/// Day of week accepts both 0 and 7 for Sunday.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    second: Field,
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    min: u32,
    max: u32,
    allowed: Vec<bool>,
}

impl Field {
    fn new(min: u32, max: u32) -> Self {
        let size = (max - min + 1) as usize;
        Self {
            min,
            max,
            allowed: vec![false; size],
        }
    }

    fn set(&mut self, v: u32) -> Result<()> {
        if v < self.min || v > self.max {
            return Err(invalid(format!(
                "cron field value {v} out of range {}..={}",
                self.min, self.max
            )));
        }
        self.allowed[(v - self.min) as usize] = true;
        Ok(())
    }

    fn matches(&self, v: u32) -> bool {
        if v < self.min || v > self.max {
            return false;
        }
        self.allowed[(v - self.min) as usize]
    }
}

fn invalid(msg: impl Into<String>) -> PipelineError {
    PipelineError::Config(msg.into())
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        let (second, rest) = match parts.len() {
            5 => (parse_field("0", 0, 59)?, &parts[..]),
            6 => (parse_field(parts[0], 0, 59)?, &parts[1..]),
            _ => {
                return Err(invalid(format!(
                    "cron expr {expr:?} must have 5 or 6 fields: [sec] min hour dom month dow"
                )));
            }
        };

        let mut day_of_week = parse_field(rest[4], 0, 7)?;
        if day_of_week.matches(7) {
            day_of_week.set(0)?;
        }

        Ok(Self {
            source: expr.to_string(),
            second,
            minute: parse_field(rest[0], 0, 59)?,
            hour: parse_field(rest[1], 0, 23)?,
            day_of_month: parse_field(rest[2], 1, 31)?,
            month: parse_field(rest[3], 1, 12)?,
            day_of_week,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn minute_matches(&self, t: DateTime<Utc>) -> bool {
        self.minute.matches(t.minute())
            && self.hour.matches(t.hour())
            && self.day_of_month.matches(t.day())
            && self.month.matches(t.month())
            && self.day_of_week.matches(t.weekday().num_days_from_sunday())
    }

    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.second.matches(t.second()) && self.minute_matches(t)
    }

    /// The first matching instant strictly after `after`, at whole-second precision.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let start = after
            .duration_trunc(Duration::seconds(1))
            .unwrap_or(after)
            + Duration::seconds(1);
        let mut minute = start.duration_trunc(Duration::minutes(1)).unwrap_or(start);
        let mut first_second = start.second();

        // Search up to 366 days to avoid infinite loops on impossible schedules.
        for _ in 0..(366 * 24 * 60) {
            if self.minute_matches(minute) {
                if let Some(s) = (first_second..60).find(|s| self.second.matches(*s)) {
                    return Ok(minute + Duration::seconds(i64::from(s)));
                }
            }
            minute += Duration::minutes(1);
            first_second = 0;
        }
        Err(invalid(format!(
            "cron expr {:?} produced no matching time within 366 days",
            self.source
        )))
    }
}

fn parse_field(token: &str, min: u32, max: u32) -> Result<Field> {
    let mut f = Field::new(min, max);

    for part in token.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(invalid("empty cron field token"));
        }
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let n: u32 = s.parse().map_err(|_| invalid("invalid cron step"))?;
                if n == 0 {
                    return Err(invalid("cron step must be > 0"));
                }
                (r, n)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let start: u32 = a.parse().map_err(|_| invalid("invalid cron range start"))?;
            let end: u32 = b.parse().map_err(|_| invalid("invalid cron range end"))?;
            if start > end {
                return Err(invalid("cron range start > end"));
            }
            (start, end)
        } else {
            let v: u32 = range.parse().map_err(|_| invalid("invalid cron value"))?;
            // `5/15` means from 5 to the end of the range in steps of 15
            if step > 1 { (v, max) } else { (v, v) }
        };

        let mut v = start;
        while v <= end {
            f.set(v)?;
            v += step;
        }
    }
    Ok(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_five_field_next_minute() {
        let cron = CronExpr::parse("*/15 * * * *").unwrap();
        assert_eq!(
            cron.next_after(at("2022-07-07T10:07:30Z")).unwrap(),
            at("2022-07-07T10:15:00Z")
        );
        assert_eq!(
            cron.next_after(at("2022-07-07T10:15:00Z")).unwrap(),
            at("2022-07-07T10:30:00Z")
        );
    }

    #[test]
    fn test_six_field_seconds() {
        let cron = CronExpr::parse("*/30 * * * * *").unwrap();
        assert_eq!(
            cron.next_after(at("2022-07-07T10:07:10.500Z")).unwrap(),
            at("2022-07-07T10:07:30Z")
        );
        assert_eq!(
            cron.next_after(at("2022-07-07T10:07:30Z")).unwrap(),
            at("2022-07-07T10:08:00Z")
        );
    }

    #[test]
    fn test_daily_at_three_and_weekday_ranges() {
        let cron = CronExpr::parse("0 0 3 * * 1-5").unwrap();
        // 2022-07-08 is a Friday, the next weekday 03:00 after it is Monday.
        assert_eq!(
            cron.next_after(at("2022-07-08T04:00:00Z")).unwrap(),
            at("2022-07-11T03:00:00Z")
        );
    }

    #[test]
    fn test_sunday_as_seven_and_stepped_range() {
        let cron = CronExpr::parse("0 12 * * 7").unwrap();
        assert!(cron.matches(at("2022-07-10T12:00:00Z")));
        let stepped = CronExpr::parse("10-40/10 * * * *").unwrap();
        assert!(stepped.matches(at("2022-07-07T10:30:00Z")));
        assert!(!stepped.matches(at("2022-07-07T10:50:00Z")));
    }

    #[test]
    fn test_invalid_expressions() {
        for expr in ["", "* * * *", "61 * * * *", "*/0 * * * *", "5-2 * * * *", "a * * * *"] {
            assert!(
                matches!(CronExpr::parse(expr), Err(PipelineError::Config(_))),
                "{expr:?} should be rejected"
            );
        }
        let impossible = CronExpr::parse("0 0 31 2 *").unwrap();
        assert!(impossible.next_after(at("2022-01-01T00:00:00Z")).is_err());
    }
}
