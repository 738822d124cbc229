use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use vmjobs_core::{JobDefinition, Schedule};

use crate::error::{Result, SchedulerError};

/// Compute the next UTC fire time for `schedule` strictly after `from`.
///
/// Returns `None` when the schedule is exhausted (a `Date` job whose instant
/// has passed) or the cron expression does not parse.
pub fn compute_next_run(schedule: &Schedule, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Cron { expression } => cron::Schedule::from_str(expression)
            .ok()?
            .after(&from)
            .next(),

        Schedule::Interval { every_secs } => Some(from + Duration::seconds(*every_secs as i64)),

        Schedule::Date { at } => (*at > from).then_some(*at),
    }
}

/// Rejects schedules that can never fire correctly.
pub fn validate(def: &JobDefinition) -> Result<()> {
    let invalid = |message: String| SchedulerError::InvalidSchedule {
        id: def.id.clone(),
        message,
    };
    match &def.schedule {
        Schedule::Cron { expression } => {
            cron::Schedule::from_str(expression).map_err(|e| invalid(format!("'{expression}': {e}")))?;
        }
        Schedule::Interval { every_secs: 0 } => {
            return Err(invalid("interval must be at least 1 second".into()));
        }
        Schedule::Interval { .. } | Schedule::Date { .. } => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, m, s).unwrap()
    }

    #[test]
    fn cron_fires_at_next_match() {
        let s = Schedule::Cron {
            expression: "0 */15 * * * *".into(),
        };
        assert_eq!(compute_next_run(&s, t(10, 7, 0)), Some(t(10, 15, 0)));
        // Strictly after.
        assert_eq!(compute_next_run(&s, t(10, 15, 0)), Some(t(10, 30, 0)));
    }

    #[test]
    fn cron_weekdays_only() {
        // 2024-01-19 is a Friday.
        let s = Schedule::Cron {
            expression: "0 0 7 * * Mon-Fri".into(),
        };
        let from = Utc.with_ymd_and_hms(2024, 1, 19, 8, 0, 0).unwrap();
        let next = Utc.with_ymd_and_hms(2024, 1, 22, 7, 0, 0).unwrap();
        assert_eq!(compute_next_run(&s, from), Some(next));
    }

    #[test]
    fn interval_and_date() {
        let s = Schedule::Interval { every_secs: 90 };
        assert_eq!(compute_next_run(&s, t(10, 0, 0)), Some(t(10, 1, 30)));

        let s = Schedule::Date { at: t(12, 0, 0) };
        assert_eq!(compute_next_run(&s, t(10, 0, 0)), Some(t(12, 0, 0)));
        assert_eq!(compute_next_run(&s, t(12, 0, 0)), None);
    }

    #[test]
    fn validation() {
        let mut def = JobDefinition {
            id: "j".into(),
            name: None,
            description: String::new(),
            enabled: true,
            kind: vmjobs_core::JobKind::Extractor,
            schedule: Schedule::Cron {
                expression: "not a cron".into(),
            },
            params: serde_json::json!({}),
        };
        assert!(matches!(validate(&def), Err(SchedulerError::InvalidSchedule { .. })));

        def.schedule = Schedule::Interval { every_secs: 0 };
        assert!(validate(&def).is_err());

        def.schedule = Schedule::Interval { every_secs: 60 };
        assert!(validate(&def).is_ok());
    }
}
