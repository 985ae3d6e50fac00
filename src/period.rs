//! Reward period clock
//!
//! Periods are UTC calendar dates whose boundary sits at a configurable
//! hour. Before the reset hour the clock still reports the previous date.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Timelike, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewardPeriodClock {
    reset_hour_utc: u32,
}

/// Snapshot of the clock at one instant
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodInfo {
    pub current_period: NaiveDate,
    pub claimable_period: NaiveDate,
    pub is_within_claim_window: bool,
    pub expires_at: DateTime<Utc>,
    pub reset_hour_utc: u32,
}

impl RewardPeriodClock {
    /// `reset_hour_utc` is clamped into 0..=23
    pub fn new(reset_hour_utc: u32) -> Self {
        Self {
            reset_hour_utc: reset_hour_utc.min(23),
        }
    }

    pub fn reset_hour_utc(&self) -> u32 {
        self.reset_hour_utc
    }

    pub fn current_period(&self, now: DateTime<Utc>) -> NaiveDate {
        if now.hour() < self.reset_hour_utc {
            (now - Duration::days(1)).date_naive()
        } else {
            now.date_naive()
        }
    }

    /// Most recently closed period
    pub fn claimable_period(&self, now: DateTime<Utc>) -> NaiveDate {
        self.current_period(now) - Duration::days(1)
    }

    pub fn is_within_claim_window(&self, now: DateTime<Utc>) -> bool {
        now.hour() >= self.reset_hour_utc
    }

    /// One second before the next reset, strictly after `now`
    pub fn expiry_instant(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive();
        let reset = Utc.from_utc_datetime(
            &today
                .and_hms_opt(self.reset_hour_utc, 0, 0)
                .unwrap_or_else(|| today.and_time(chrono::NaiveTime::MIN)),
        );
        let mut expiry = reset - Duration::seconds(1);
        while expiry <= now {
            expiry += Duration::days(1);
        }
        expiry
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> PeriodInfo {
        PeriodInfo {
            current_period: self.current_period(now),
            claimable_period: self.claimable_period(now),
            is_within_claim_window: self.is_within_claim_window(now),
            expires_at: self.expiry_instant(now),
            reset_hour_utc: self.reset_hour_utc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_midnight_boundary() {
        let clock = RewardPeriodClock::new(0);
        assert_eq!(clock.current_period(at("2024-03-01T23:59:59Z")), date("2024-03-01"));
        assert_eq!(clock.current_period(at("2024-03-02T00:00:01Z")), date("2024-03-02"));
    }

    #[test]
    fn test_before_reset_hour_is_previous_day() {
        let clock = RewardPeriodClock::new(5);
        assert_eq!(clock.current_period(at("2024-03-02T04:59:59Z")), date("2024-03-01"));
        assert_eq!(clock.current_period(at("2024-03-02T05:00:00Z")), date("2024-03-02"));
    }

    #[test]
    fn test_claimable_is_previous_period() {
        let clock = RewardPeriodClock::new(5);
        assert_eq!(clock.claimable_period(at("2024-03-02T12:00:00Z")), date("2024-03-01"));
        assert_eq!(clock.claimable_period(at("2024-03-02T03:00:00Z")), date("2024-02-29"));
    }

    #[test]
    fn test_claim_window() {
        let clock = RewardPeriodClock::new(5);
        assert!(!clock.is_within_claim_window(at("2024-03-02T04:00:00Z")));
        assert!(clock.is_within_claim_window(at("2024-03-02T05:00:00Z")));
        assert!(RewardPeriodClock::new(0).is_within_claim_window(at("2024-03-02T00:00:00Z")));
    }

    #[test]
    fn test_expiry_instant() {
        let clock = RewardPeriodClock::new(5);
        assert_eq!(clock.expiry_instant(at("2024-03-02T03:00:00Z")), at("2024-03-02T04:59:59Z"));
        assert_eq!(clock.expiry_instant(at("2024-03-02T06:00:00Z")), at("2024-03-03T04:59:59Z"));
        // exactly on the expiry second rolls to the next day
        assert_eq!(clock.expiry_instant(at("2024-03-02T04:59:59Z")), at("2024-03-03T04:59:59Z"));
    }

    #[test]
    fn test_expiry_with_midnight_reset() {
        let clock = RewardPeriodClock::new(0);
        assert_eq!(clock.expiry_instant(at("2024-03-01T10:00:00Z")), at("2024-03-01T23:59:59Z"));
    }
}
