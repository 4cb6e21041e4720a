//! Schedule recurrence: cron expressions and fixed `rate(...)` intervals.

use std::{str::FromStr, time::Duration};

use {
    chrono::{DateTime, TimeZone, Utc},
    cron::Schedule,
};

/// How many upcoming firings are inspected when deriving the spacing of a
/// cron expression. Irregular expressions (`0 9,17 * * *`) yield their
/// smallest gap.
const SPACING_SAMPLES: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum RecurrenceError {
    #[error("invalid cron expression: {0}")]
    Cron(#[from] cron::error::Error),
    #[error("cron expressions need 5, 6 or 7 fields, got {0}")]
    FieldCount(usize),
    #[error("invalid rate expression: {0}")]
    Rate(String),
    #[error("expression never fires twice")]
    NoFirings,
}

/// A parsed recurrence.
#[derive(Debug, Clone)]
pub enum Recurrence {
    Cron {
        expr: String,
        schedule: Box<Schedule>,
    },
    Rate(Duration),
}

impl Recurrence {
    /// Parse an expression.
    ///
    /// Accepted forms:
    /// - `*/5 * * * *` (5-field Unix cron, seconds fixed at 0)
    /// - `0 */5 * * * *` / `0 */5 * * * * 2030` (seconds-first cron)
    /// - `cron(*/5 * * * ? *)` (minute-first with year field)
    /// - `rate(5 minutes)`
    pub fn parse(expr: &str) -> Result<Self, RecurrenceError> {
        let expr = expr.trim();
        if let Some(inner) = strip_call(expr, "rate") {
            return parse_rate(inner).map(Self::Rate);
        }

        let normalized = match strip_call(expr, "cron") {
            Some(inner) => format!("0 {}", inner.trim().replace('?', "*")),
            None => match expr.split_whitespace().count() {
                5 => format!("0 {expr}"),
                6 | 7 => expr.to_string(),
                n => return Err(RecurrenceError::FieldCount(n)),
            },
        };

        let schedule = Schedule::from_str(&normalized)?;
        Ok(Self::Cron {
            expr: expr.to_string(),
            schedule: Box::new(schedule),
        })
    }

    /// First firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron { schedule, .. } => schedule.after(&after).next(),
            Self::Rate(every) => {
                let step = i64::try_from(every.as_millis()).ok().filter(|s| *s > 0)?;
                let now = after.timestamp_millis();
                let next = (now.div_euclid(step) + 1) * step;
                Utc.timestamp_millis_opt(next).single()
            },
        }
    }

    /// Smallest spacing between two consecutive firings from `from` onward.
    pub fn spacing(&self, from: DateTime<Utc>) -> Result<Duration, RecurrenceError> {
        match self {
            Self::Rate(every) => Ok(*every),
            Self::Cron { schedule, .. } => {
                let firings: Vec<DateTime<Utc>> =
                    schedule.after(&from).take(SPACING_SAMPLES + 1).collect();
                firings
                    .windows(2)
                    .filter_map(|pair| (pair[1] - pair[0]).to_std().ok())
                    .min()
                    .ok_or(RecurrenceError::NoFirings)
            },
        }
    }
}

fn strip_call<'a>(expr: &'a str, name: &str) -> Option<&'a str> {
    expr.strip_prefix(name)?
        .trim_start()
        .strip_prefix('(')?
        .strip_suffix(')')
}

fn parse_rate(inner: &str) -> Result<Duration, RecurrenceError> {
    let bad = || RecurrenceError::Rate(inner.to_string());
    let mut parts = inner.split_whitespace();
    let (Some(value), Some(unit), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(bad());
    };
    let value: u64 = value.parse().map_err(|_| bad())?;
    if value == 0 {
        return Err(bad());
    }
    let unit_secs = match unit.trim_end_matches('s') {
        "second" => 1,
        "minute" => 60,
        "hour" => 60 * 60,
        "day" => 24 * 60 * 60,
        _ => return Err(bad()),
    };
    Ok(Duration::from_secs(value * unit_secs))
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[rstest]
    #[case("*/5 * * * *", 5 * 60)]
    #[case("0 */10 * * * *", 10 * 60)]
    #[case("cron(0/15 * * * ? *)", 15 * 60)]
    #[case("0 9,17 * * *", 8 * 60 * 60)]
    #[case("rate(2 hours)", 2 * 60 * 60)]
    #[case("rate(1 minute)", 60)]
    fn spacing_of_expressions(#[case] expr: &str, #[case] secs: u64) {
        let recurrence = Recurrence::parse(expr).unwrap();
        let spacing = recurrence.spacing(at("2030-01-01T00:00:00Z")).unwrap();
        assert_eq!(spacing, Duration::from_secs(secs));
    }

    #[rstest]
    #[case("* * *")]
    #[case("rate(0 minutes)")]
    #[case("rate(5 fortnights)")]
    #[case("rate(five minutes)")]
    #[case("61 * * * *")]
    fn rejects_bad_expressions(#[case] expr: &str) {
        assert!(Recurrence::parse(expr).is_err());
    }

    #[test]
    fn next_after_cron() {
        let recurrence = Recurrence::parse("0 * * * *").unwrap();
        let next = recurrence.next_after(at("2030-01-01T10:15:00Z")).unwrap();
        assert_eq!(next, at("2030-01-01T11:00:00Z"));
    }

    #[test]
    fn next_after_rate_is_aligned() {
        let recurrence = Recurrence::parse("rate(15 minutes)").unwrap();
        let next = recurrence.next_after(at("2030-01-01T10:16:00Z")).unwrap();
        assert_eq!(next, at("2030-01-01T10:30:00Z"));
    }
}
