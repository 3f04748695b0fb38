// Recurrence parsing and due-time evaluation
//
// A task is "due" when its cron expression fires at some instant inside the
// minute containing now, evaluated in the task's timezone. Ticks only need
// to land somewhere inside the minute, not on its first second.

use crate::errors::ScheduleError;
use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// When a task gives no expression it is due every minute.
pub const DEFAULT_EXPRESSION: &str = "* * * * * *";

/// A parsed cron recurrence plus the timezone it is evaluated in.
/// `None` timezone means the host's local timezone.
#[derive(Debug, Clone)]
pub struct Recurrence {
    expression: String,
    schedule: CronSchedule,
    timezone: Option<Tz>,
}

impl Recurrence {
    /// Parse a cron expression with seconds precision. Five-field
    /// expressions (minute-precision, the common crontab form) are accepted
    /// and pinned to second zero.
    pub fn parse(expression: &str, timezone: Option<Tz>) -> Result<Self, ScheduleError> {
        let fields = expression.split_whitespace().count();
        let normalized = if fields == 5 {
            format!("0 {}", expression)
        } else {
            expression.to_string()
        };

        let schedule = CronSchedule::from_str(&normalized).map_err(|e| {
            ScheduleError::InvalidCronExpression {
                expression: expression.to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            expression: expression.to_string(),
            schedule,
            timezone,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Option<Tz> {
        self.timezone
    }

    /// Whether the recurrence fires within the minute containing `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.timezone {
            Some(tz) => fires_within_minute(&self.schedule, now.with_timezone(&tz)),
            None => fires_within_minute(&self.schedule, now.with_timezone(&chrono::Local)),
        }
    }

    /// The next instant the recurrence fires strictly after `now`.
    pub fn next_fire_utc(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.timezone {
            Some(tz) => self
                .schedule
                .after(&now.with_timezone(&tz))
                .next()
                .map(|t| t.with_timezone(&Utc)),
            None => self
                .schedule
                .after(&now.with_timezone(&chrono::Local))
                .next()
                .map(|t| t.with_timezone(&Utc)),
        }
    }
}

impl Default for Recurrence {
    fn default() -> Self {
        // DEFAULT_EXPRESSION is a valid six-field expression.
        Self::parse(DEFAULT_EXPRESSION, None).unwrap_or_else(|_| unreachable!())
    }
}

/// Resolve an IANA timezone name like "Asia/Tokyo".
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    name.parse::<Tz>()
        .map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))
}

fn fires_within_minute<Z: TimeZone>(schedule: &CronSchedule, now: DateTime<Z>) -> bool {
    let minute_start = match now.with_second(0).and_then(|t| t.with_nanosecond(0)) {
        Some(start) => start,
        None => return false,
    };
    let window_end = minute_start.clone() + Duration::seconds(60);
    // `after` is exclusive, so probe from one second before the window.
    let probe = minute_start - Duration::seconds(1);
    schedule
        .after(&probe)
        .next()
        .map(|next| next < window_end)
        .unwrap_or(false)
}
