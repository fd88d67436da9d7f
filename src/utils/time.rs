//! Deadline helpers for the scheduler.
//!
//! Every deadline is normalised to a UTC instant exactly once, when it is
//! scheduled. Recurring schedules are plain iterators of deadlines:
//! [`periodic`] walks a fixed grid and [`cron`] walks the matches of a
//! 5-field cron expression.

use std::time::{Duration, SystemTime};

use chrono::{DateTime, Datelike, FixedOffset, Local, TimeDelta, Timelike, Utc};

use crate::error::{CoreError, Result};

/// Anything that can be turned into an absolute UTC deadline.
pub trait IntoDeadline {
    fn into_deadline(self) -> DateTime<Utc>;
}

impl IntoDeadline for DateTime<Utc> {
    fn into_deadline(self) -> DateTime<Utc> {
        self
    }
}

impl IntoDeadline for DateTime<FixedOffset> {
    fn into_deadline(self) -> DateTime<Utc> {
        self.with_timezone(&Utc)
    }
}

impl IntoDeadline for DateTime<Local> {
    fn into_deadline(self) -> DateTime<Utc> {
        self.with_timezone(&Utc)
    }
}

impl IntoDeadline for SystemTime {
    fn into_deadline(self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self)
    }
}

/// Seconds since the UTC epoch.
impl IntoDeadline for f64 {
    fn into_deadline(self) -> DateTime<Utc> {
        from_utc_seconds(self)
    }
}

/// Relative to now.
impl IntoDeadline for Duration {
    fn into_deadline(self) -> DateTime<Utc> {
        after(Utc::now(), self)
    }
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

fn after(base: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    base.checked_add_signed(to_delta(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Converts UTC epoch seconds into an instant, saturating out-of-range values.
pub fn from_utc_seconds(secs: f64) -> DateTime<Utc> {
    if !secs.is_finite() {
        return if secs.is_sign_negative() {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        };
    }
    let micros = (secs * 1_000_000.0).round();
    if micros >= i64::MAX as f64 {
        return DateTime::<Utc>::MAX_UTC;
    }
    if micros <= i64::MIN as f64 {
        return DateTime::<Utc>::MIN_UTC;
    }
    DateTime::<Utc>::from_timestamp_micros(micros as i64).unwrap_or(if secs > 0.0 {
        DateTime::<Utc>::MAX_UTC
    } else {
        DateTime::<Utc>::MIN_UTC
    })
}

/// Returns the instant as UTC epoch seconds.
pub fn utc_seconds(instant: DateTime<Utc>) -> f64 {
    instant.timestamp_micros() as f64 / 1_000_000.0
}

/// Time left until `deadline`, zero if it has passed.
pub fn until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}

/// Parse an ISO datetime string into a UTC instant.
pub fn parse_deadline(input: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M:%S") {
        return Ok(naive.and_utc());
    }
    Err(CoreError::Config(format!(
        "Invalid deadline '{}'. Use RFC3339 or YYYY-MM-DDTHH:MM:SS",
        input
    )))
}

// ============================================================================
// Periodic grid
// ============================================================================

/// Deadlines on a fixed grid: `start, start + period, start + 2 * period, ...`.
///
/// Each deadline is derived from the grid, never from when the previous
/// callback actually ran, so late wake-ups do not accumulate drift.
#[derive(Debug, Clone)]
pub struct Periodic {
    next: DateTime<Utc>,
    period: TimeDelta,
}

/// Grid starting one `period` from now. A zero period yields nothing.
///
/// # Example
/// ```
/// use std::time::Duration;
/// use vipcore::utils::time::periodic;
///
/// let mut grid = periodic(Duration::from_secs(30));
/// let first = grid.next().unwrap();
/// let second = grid.next().unwrap();
/// assert_eq!((second - first).num_seconds(), 30);
/// ```
pub fn periodic(period: Duration) -> Periodic {
    Periodic {
        next: after(Utc::now(), period),
        period: to_delta(period),
    }
}

impl Periodic {
    /// Moves the first deadline to `start`.
    pub fn starting_at(mut self, start: impl IntoDeadline) -> Self {
        self.next = start.into_deadline();
        self
    }

    /// Moves the first deadline to `wait` from now.
    pub fn starting_after(mut self, wait: Duration) -> Self {
        self.next = after(Utc::now(), wait);
        self
    }
}

impl Iterator for Periodic {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.period <= TimeDelta::zero() {
            return None;
        }
        let current = self.next;
        self.next = current.checked_add_signed(self.period)?;
        Some(current)
    }
}

// ============================================================================
// Cron expressions
// ============================================================================

fn parse_cron_field(field: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    if field == "*" {
        return Some((min..=max).collect());
    }
    if let Some(step_str) = field.strip_prefix("*/") {
        let step = step_str.parse::<u32>().ok()?;
        if step == 0 {
            return None;
        }
        return Some((min..=max).step_by(step as usize).collect());
    }

    let mut values = Vec::new();
    for part in field.split(',') {
        let value = part.parse::<u32>().ok()?;
        if !(min..=max).contains(&value) {
            return None;
        }
        values.push(value);
    }
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

/// Parsed `minute hour day-of-month month day-of-week` expression.
#[derive(Debug, Clone)]
struct CronFields {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    dom: Vec<u32>,
    month: Vec<u32>,
    dow: Vec<u32>,
}

impl CronFields {
    fn parse(expr: &str) -> Option<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return None;
        }
        Some(Self {
            minutes: parse_cron_field(fields[0], 0, 59)?,
            hours: parse_cron_field(fields[1], 0, 23)?,
            dom: parse_cron_field(fields[2], 1, 31)?,
            month: parse_cron_field(fields[3], 1, 12)?,
            dow: parse_cron_field(fields[4], 0, 6)?,
        })
    }

    fn matches(&self, t: &DateTime<Utc>) -> bool {
        self.minutes.contains(&t.minute())
            && self.hours.contains(&t.hour())
            && self.dom.contains(&t.day())
            && self.month.contains(&t.month())
            && self.dow.contains(&t.weekday().num_days_from_sunday())
    }

    /// First matching minute strictly after `after`, searched up to a year ahead.
    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = after.with_second(0)?.with_nanosecond(0)? + TimeDelta::minutes(1);
        let limit = candidate + TimeDelta::days(366);
        while candidate <= limit {
            if self.matches(&candidate) {
                return Some(candidate);
            }
            candidate += TimeDelta::minutes(1);
        }
        None
    }
}

/// Successive instants matching a cron expression.
#[derive(Debug, Clone)]
pub struct Cron {
    fields: CronFields,
    cursor: DateTime<Utc>,
    stop: Option<DateTime<Utc>>,
}

/// Iterates the matches of `expr` after now.
///
/// # Errors
/// Returns `CoreError::Config` for malformed expressions.
pub fn cron(expr: &str) -> Result<Cron> {
    let fields = CronFields::parse(expr)
        .ok_or_else(|| CoreError::Config(format!("Invalid cron expression '{}'", expr)))?;
    Ok(Cron {
        fields,
        cursor: Utc::now(),
        stop: None,
    })
}

impl Cron {
    /// Starts matching after `start` instead of now.
    pub fn starting_at(mut self, start: impl IntoDeadline) -> Self {
        self.cursor = start.into_deadline();
        self
    }

    /// Ends the sequence at `stop` (inclusive).
    pub fn until(mut self, stop: impl IntoDeadline) -> Self {
        self.stop = Some(stop.into_deadline());
        self
    }
}

impl Iterator for Cron {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.fields.next_after(self.cursor)?;
        if self.stop.is_some_and(|stop| next > stop) {
            return None;
        }
        self.cursor = next;
        Some(next)
    }
}

/// Returns true if the cron expression is valid and has a future run time.
pub fn is_valid_cron_expr(expr: &str) -> bool {
    CronFields::parse(expr)
        .and_then(|f| f.next_after(Utc::now()))
        .is_some()
}
