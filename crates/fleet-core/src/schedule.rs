use chrono::{DateTime, Duration, DurationRound, NaiveTime, Utc};

use crate::job::ScheduleType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextRun {
    pub at: DateTime<Utc>,
    /// Set when the schedule type was not recognized and hourly was assumed.
    pub defaulted: bool,
}

fn top_of_next_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = now
        .duration_trunc(Duration::hours(1))
        .unwrap_or(now);
    truncated + Duration::hours(1)
}

fn next_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + Duration::days(1);
    tomorrow.and_time(NaiveTime::MIN).and_utc()
}

/// Next run of a recurring job. The first run aligns to a boundary, later runs
/// are a fixed period after the previous one. Continuous jobs never run.
pub fn next_run(
    schedule: &ScheduleType,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<NextRun> {
    let (period, defaulted) = match schedule {
        ScheduleType::Continuous => return None,
        ScheduleType::Hourly => (Duration::hours(1), false),
        ScheduleType::Daily => (Duration::hours(24), false),
        ScheduleType::Other(_) => (Duration::hours(1), true),
    };

    let at = match last_run {
        Some(last) => last + period,
        None if matches!(schedule, ScheduleType::Daily) => next_midnight(now),
        None => top_of_next_hour(now),
    };
    Some(NextRun { at, defaulted })
}
