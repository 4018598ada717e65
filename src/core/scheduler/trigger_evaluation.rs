//! Fire time computation and misfire decisions
//!
//! Everything here is a pure function of the trigger definition and the
//! instant it is evaluated at.

use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use cron::Schedule;

use crate::domain::entities::{MisfirePolicy, Trigger, TriggerSchedule};
use crate::error::{AppError, Result};

/// Parses a unix cron expression. Five-field expressions get a leading
/// seconds field of `0`; six and seven field expressions are taken as is.
///
/// Day-of-week numbers follow the `cron` crate, where 1 is Sunday. Names
/// (`MON-FRI`) avoid the ambiguity.
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    let fields = expression.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", expression.trim()),
        6 | 7 => expression.trim().to_string(),
        _ => {
            return Err(AppError::scheduler(format!(
                "Cron expression '{}' has {} fields, expected 5 to 7",
                expression, fields
            )))
        }
    };
    Ok(Schedule::from_str(&normalized)?)
}

fn offset(utc_offset_minutes: i32) -> Result<FixedOffset> {
    FixedOffset::east_opt(utc_offset_minutes * 60)
        .ok_or_else(|| AppError::scheduler(format!("Invalid UTC offset of {} minutes", utc_offset_minutes)))
}

fn cron_after(expression: &str, utc_offset_minutes: i32, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let schedule = parse_cron(expression)?;
    let zone = offset(utc_offset_minutes)?;
    Ok(schedule
        .after(&after.with_timezone(&zone))
        .next()
        .map(|fire| fire.with_timezone(&Utc)))
}

/// `from` moved forward by `millis`; `SchedulerError` when the result is
/// not a representable date
pub fn add_millis(from: DateTime<Utc>, millis: u64) -> Result<DateTime<Utc>> {
    i64::try_from(millis)
        .ok()
        .and_then(Duration::try_milliseconds)
        .and_then(|delay| from.checked_add_signed(delay))
        .ok_or_else(|| AppError::scheduler(format!("{} ms after {} is out of range", millis, from)))
}

fn within_end(trigger: &Trigger, candidate: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (candidate, trigger.end_at) {
        (Some(fire), Some(end)) if fire > end => None,
        (candidate, _) => candidate,
    }
}

/// Checks that the schedule can be evaluated
pub fn validate(trigger: &Trigger) -> Result<()> {
    match &trigger.schedule {
        TriggerSchedule::OneShot { .. } => Ok(()),
        TriggerSchedule::UnixCron { expression, utc_offset_minutes } => {
            parse_cron(expression)?;
            offset(*utc_offset_minutes).map(|_| ())
        }
        TriggerSchedule::Interval { every_millis, .. } if *every_millis == 0 => {
            Err(AppError::scheduler("Interval trigger needs a positive period"))
        }
        TriggerSchedule::Interval { every_millis, .. } => add_millis(trigger.start_at, *every_millis).map(|_| ()),
    }
}

/// First firing at or after the trigger start
pub fn first_fire_time(trigger: &Trigger) -> Result<Option<DateTime<Utc>>> {
    let first = match &trigger.schedule {
        TriggerSchedule::OneShot { at } => Some(*at),
        TriggerSchedule::UnixCron { expression, utc_offset_minutes } => cron_after(
            expression,
            *utc_offset_minutes,
            trigger.start_at - Duration::milliseconds(1),
        )?,
        TriggerSchedule::Interval { .. } => Some(trigger.start_at),
    };
    Ok(within_end(trigger, first))
}

/// Next natural firing strictly after `after`; `None` once the trigger is
/// exhausted
pub fn fire_time_after(trigger: &Trigger, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let next = match &trigger.schedule {
        TriggerSchedule::OneShot { .. } => None,
        TriggerSchedule::UnixCron { expression, utc_offset_minutes } => {
            let from = after.max(trigger.start_at - Duration::milliseconds(1));
            cron_after(expression, *utc_offset_minutes, from)?
        }
        TriggerSchedule::Interval { every_millis, repeat_count } => {
            if repeat_count.is_some_and(|total| trigger.fire_count >= total) {
                None
            } else if after < trigger.start_at {
                Some(trigger.start_at)
            } else {
                let every = i64::try_from(*every_millis)
                    .map_err(|_| AppError::scheduler(format!("Interval of {} ms is out of range", every_millis)))?;
                let elapsed = (after - trigger.start_at).num_milliseconds();
                let step = (elapsed / every + 1).checked_mul(every).ok_or_else(|| {
                    AppError::scheduler(format!("Interval trigger '{}' ran out of dates", trigger.name))
                })?;
                Some(add_millis(trigger.start_at, step as u64)?)
            }
        }
    };
    Ok(within_end(trigger, next))
}

/// Next firing for a trigger being put back on schedule at `now`. A
/// one-shot that never fired keeps its date, or fires at `now` if that
/// date has passed.
pub fn rescheduled_fire_time(trigger: &Trigger, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match &trigger.schedule {
        TriggerSchedule::OneShot { at } if trigger.fire_count == 0 => Ok(Some((*at).max(now))),
        TriggerSchedule::OneShot { .. } => Ok(None),
        _ => fire_time_after(trigger, now - Duration::milliseconds(1)),
    }
}

/// A firing more than `threshold` behind `now` is a misfire
pub fn is_misfire(scheduled: DateTime<Utc>, now: DateTime<Utc>, threshold: Duration) -> bool {
    now - scheduled > threshold
}

/// Where a trigger whose scheduled firing `scheduled` was missed goes next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MisfireDecision {
    /// Fire once now
    FireNow,
    /// Skip to this natural occurrence
    SkipTo(DateTime<Utc>),
    /// Nothing left to fire
    Exhausted,
}

/// Applies the misfire policy. Whatever the number of missed occurrences,
/// `Restart` fires once.
pub fn misfire_decision(trigger: &Trigger, now: DateTime<Utc>) -> Result<MisfireDecision> {
    match trigger.misfire_policy {
        MisfirePolicy::Restart => Ok(MisfireDecision::FireNow),
        MisfirePolicy::None => Ok(match fire_time_after(trigger, now)? {
            Some(next) => MisfireDecision::SkipTo(next),
            None => MisfireDecision::Exhausted,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, m, s).unwrap()
    }

    #[test]
    fn test_five_field_cron_gets_seconds() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 */5 * * * *").is_ok());
        assert!(parse_cron("* * *").is_err());
        assert!(matches!(parse_cron("61 * * * *"), Err(AppError::SchedulerError { .. })));
    }

    #[test]
    fn test_cron_fire_times() {
        let trigger = Trigger::unix_cron("every-minute", "* * * * *").starting_at(at(12, 0, 30));

        assert_eq!(first_fire_time(&trigger).unwrap(), Some(at(12, 1, 0)));
        assert_eq!(fire_time_after(&trigger, at(12, 1, 0)).unwrap(), Some(at(12, 2, 0)));
        assert_eq!(fire_time_after(&trigger, at(11, 0, 0)).unwrap(), Some(at(12, 1, 0)));
    }

    #[test]
    fn test_cron_honours_utc_offset() {
        let trigger = Trigger::unix_cron("nine-local", "0 9 * * *")
            .with_utc_offset_minutes(120)
            .starting_at(at(0, 0, 0));

        assert_eq!(first_fire_time(&trigger).unwrap(), Some(at(7, 0, 0)));
    }

    #[test]
    fn test_interval_fire_times() {
        let mut trigger = Trigger::interval("tick", Duration::seconds(10), Some(3)).starting_at(at(12, 0, 0));

        assert_eq!(first_fire_time(&trigger).unwrap(), Some(at(12, 0, 0)));
        assert_eq!(fire_time_after(&trigger, at(12, 0, 0)).unwrap(), Some(at(12, 0, 10)));
        assert_eq!(fire_time_after(&trigger, at(12, 0, 25)).unwrap(), Some(at(12, 0, 30)));

        trigger.fire_count = 3;
        assert_eq!(fire_time_after(&trigger, at(12, 0, 25)).unwrap(), None);
    }

    #[test]
    fn test_out_of_range_periods_are_rejected() {
        assert!(matches!(add_millis(at(12, 0, 0), u64::MAX), Err(AppError::SchedulerError { .. })));
        assert_eq!(add_millis(at(12, 0, 0), 1_000).unwrap(), at(12, 0, 1));

        let mut huge = Trigger::interval("huge", Duration::seconds(1), None).starting_at(at(12, 0, 0));
        huge.schedule = TriggerSchedule::Interval {
            every_millis: u64::MAX,
            repeat_count: None,
        };
        assert!(matches!(validate(&huge), Err(AppError::SchedulerError { .. })));
        assert!(matches!(fire_time_after(&huge, at(12, 0, 1)), Err(AppError::SchedulerError { .. })));
    }

    #[test]
    fn test_one_shot_and_end_date() {
        let once = Trigger::one_shot("once", at(8, 0, 0));
        assert_eq!(first_fire_time(&once).unwrap(), Some(at(8, 0, 0)));
        assert_eq!(fire_time_after(&once, at(7, 0, 0)).unwrap(), None);

        let bounded = Trigger::unix_cron("hourly", "0 * * * *")
            .starting_at(at(8, 30, 0))
            .ending_at(at(10, 0, 0));
        assert_eq!(fire_time_after(&bounded, at(9, 0, 0)).unwrap(), Some(at(10, 0, 0)));
        assert_eq!(fire_time_after(&bounded, at(10, 0, 0)).unwrap(), None);
    }

    #[test]
    fn test_rescheduled_fire_time() {
        let mut once = Trigger::one_shot("once", at(8, 0, 0));
        assert_eq!(rescheduled_fire_time(&once, at(9, 0, 0)).unwrap(), Some(at(9, 0, 0)));
        assert_eq!(rescheduled_fire_time(&once, at(7, 0, 0)).unwrap(), Some(at(8, 0, 0)));
        once.fire_count = 1;
        assert_eq!(rescheduled_fire_time(&once, at(7, 0, 0)).unwrap(), None);

        let hourly = Trigger::unix_cron("hourly", "0 * * * *").starting_at(at(0, 0, 0));
        assert_eq!(rescheduled_fire_time(&hourly, at(9, 0, 0)).unwrap(), Some(at(9, 0, 0)));
    }

    #[test]
    fn test_misfire_decision() {
        let threshold = Duration::seconds(60);
        assert!(is_misfire(at(12, 0, 0), at(12, 5, 0), threshold));
        assert!(!is_misfire(at(12, 0, 0), at(12, 0, 30), threshold));

        let skip = Trigger::unix_cron("every-minute", "* * * * *").starting_at(at(12, 0, 0));
        assert_eq!(misfire_decision(&skip, at(12, 5, 30)).unwrap(), MisfireDecision::SkipTo(at(12, 6, 0)));

        let restart = skip.clone().with_misfire_policy(MisfirePolicy::Restart);
        assert_eq!(misfire_decision(&restart, at(12, 5, 30)).unwrap(), MisfireDecision::FireNow);

        let once = Trigger::one_shot("once", at(12, 0, 0));
        assert_eq!(misfire_decision(&once, at(12, 5, 0)).unwrap(), MisfireDecision::Exhausted);
    }
}
