//! Recurrence calculator.
//!
//! Maps a schedule descriptor to its next execution instant. Pure
//! function of its arguments: recomputing with the same `last_executed`
//! yields the same instant, so retried dispatches never drift.

use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};
use cron::Schedule as CronSchedule;

use crate::model::{Schedule, ScheduleType};

/// Hour of day (UTC) at which interval-based occurrences fire.
const REFERENCE_HOUR: u32 = 9;

/// Next execution instant for a schedule, or `None` when the schedule
/// is exhausted (one-shot already consumed, end date passed, or an
/// unparseable cron expression).
pub fn next_execution(schedule: &Schedule, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = match schedule.schedule_type {
        ScheduleType::Once => {
            if schedule.last_executed.is_none() && schedule.start_date > reference {
                Some(schedule.start_date)
            } else {
                None
            }
        }
        ScheduleType::Daily | ScheduleType::Weekly | ScheduleType::Monthly => {
            interval_next(schedule)
        }
        ScheduleType::Custom => cron_next(schedule, reference),
    }?;

    match schedule.end_date {
        Some(end) if next > end => None,
        _ => Some(next),
    }
}

fn interval_next(schedule: &Schedule) -> Option<DateTime<Utc>> {
    let interval = schedule.interval.unwrap_or(1).max(1);
    let base = match schedule.last_executed {
        // First occurrence: the earliest reference-hour instant that is
        // not before the declared start. A start already in the past
        // fires immediately (the dispatcher clamps the delay to zero).
        None => {
            let first = at_reference_hour(schedule.start_date)?;
            if first >= schedule.start_date {
                return Some(first);
            }
            let rolled = advance(schedule.schedule_type, schedule.start_date, 1)?;
            return at_reference_hour(rolled);
        }
        Some(last) => last,
    };
    at_reference_hour(advance(schedule.schedule_type, base, interval)?)
}

fn advance(
    schedule_type: ScheduleType,
    from: DateTime<Utc>,
    units: u32,
) -> Option<DateTime<Utc>> {
    match schedule_type {
        ScheduleType::Daily => from.checked_add_signed(Duration::days(i64::from(units))),
        ScheduleType::Weekly => from.checked_add_signed(Duration::weeks(i64::from(units))),
        ScheduleType::Monthly => from.checked_add_months(Months::new(units)),
        _ => None,
    }
}

fn at_reference_hour(instant: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(
        instant
            .date_naive()
            .and_hms_opt(REFERENCE_HOUR, 0, 0)?
            .and_utc(),
    )
}

fn cron_next(schedule: &Schedule, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let expr = schedule.cron_expression.as_deref()?;
    let normalized = normalize_cron_expr(expr);
    match CronSchedule::from_str(&normalized) {
        Ok(parsed) => parsed.after(&reference).next(),
        Err(err) => {
            tracing::warn!(expression = expr, error = %err, "Unparseable cron expression");
            None
        }
    }
}

/// Accept standard 5-field cron by prepending a seconds field.
fn normalize_cron_expr(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}
