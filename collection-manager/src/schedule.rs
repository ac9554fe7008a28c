use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveTime, Utc};

/// Fixed daily trigger time (UTC).
#[derive(Clone, Copy, Debug)]
pub struct DailySchedule {
    at: NaiveTime,
}

impl DailySchedule {
    pub fn new(hour: u32, minute: u32) -> Result<Self> {
        let at = NaiveTime::from_hms_opt(hour, minute, 0)
            .with_context(|| format!("invalid daily run time {:02}:{:02}", hour, minute))?;
        Ok(Self { at })
    }

    /// First trigger strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive().and_time(self.at).and_utc();
        if today > now {
            today
        } else {
            today + Duration::days(1)
        }
    }

    /// How long to wait from `now` until the next trigger.
    pub fn wait_from(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.next_after(now) - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 10, h, m, s).unwrap()
    }

    #[test]
    fn test_next_run_later_today() {
        let schedule = DailySchedule::new(3, 0).unwrap();
        assert_eq!(schedule.next_after(at(1, 30, 0)), at(3, 0, 0));
    }

    #[test]
    fn test_next_run_tomorrow_when_passed_or_exact() {
        let schedule = DailySchedule::new(3, 0).unwrap();
        let tomorrow = Utc.with_ymd_and_hms(2026, 5, 11, 3, 0, 0).unwrap();
        assert_eq!(schedule.next_after(at(3, 0, 0)), tomorrow);
        assert_eq!(schedule.next_after(at(23, 59, 59)), tomorrow);
        assert_eq!(schedule.wait_from(at(2, 59, 0)), std::time::Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_time_rejected() {
        assert!(DailySchedule::new(24, 0).is_err());
        assert!(DailySchedule::new(3, 60).is_err());
    }
}
