//! Volume accountant
//!
//! Turns a closed trade's hold time and notional into counted volume:
//! too-fast and too-small trades count nothing, the rest are weighted by
//! hold-time tier and then pushed through the per-period cap.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::config::VolumeConfig;
use crate::db::Database;
use crate::error::TradeError;
use crate::types::CountedVolumeReason;

/// Pre-cap verdict for one trade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeAssessment {
    Rejected(CountedVolumeReason),
    Eligible(Decimal),
}

/// What the store actually applied against the cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapResult {
    pub applied: Decimal,
    pub truncated: bool,
    /// Period total after the increment
    pub total: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CountedVolume {
    pub amount: Decimal,
    pub reason: Option<CountedVolumeReason>,
}

impl CountedVolume {
    pub fn rejected(reason: CountedVolumeReason) -> Self {
        Self { amount: Decimal::ZERO, reason: Some(reason) }
    }
}

/// Hold-time weight, zero below the first tier
pub fn hold_weight(open_time_seconds: i64, config: &VolumeConfig) -> Decimal {
    config
        .tiers
        .iter()
        .rev()
        .find(|tier| open_time_seconds >= tier.min_hold_secs)
        .map(|tier| tier.weight)
        .unwrap_or(Decimal::ZERO)
}

/// Anti-spam filters and tier weighting, before the cap
pub fn assess(open_time_seconds: i64, position_size_usdt: Decimal, config: &VolumeConfig) -> VolumeAssessment {
    if open_time_seconds < config.min_hold_secs {
        return VolumeAssessment::Rejected(CountedVolumeReason::TooFast);
    }
    if position_size_usdt < config.min_notional {
        return VolumeAssessment::Rejected(CountedVolumeReason::TooSmall);
    }
    VolumeAssessment::Eligible(position_size_usdt * hold_weight(open_time_seconds, config))
}

/// `min(amount, cap - current)` with truncation flag; never decreases the total
pub fn cap_increment(current: Decimal, amount: Decimal, cap: Decimal) -> CapResult {
    let amount = amount.max(Decimal::ZERO);
    let room = (cap - current).max(Decimal::ZERO);
    let applied = amount.min(room);

    CapResult {
        applied,
        truncated: applied < amount,
        total: current + applied,
    }
}

/// Counted amount and reason once the cap has been applied.
/// A partial fill under the cap still counts without a reason.
pub fn finalize(cap: &CapResult) -> CountedVolume {
    if cap.truncated && cap.applied.is_zero() {
        CountedVolume::rejected(CountedVolumeReason::DailyCapReached)
    } else {
        CountedVolume { amount: cap.applied, reason: None }
    }
}

/// Counted volume before the store applies the cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingVolume {
    /// Provisional value; the store overwrites it when `eligible` is set
    pub counted: CountedVolume,
    /// Weighted amount still to be pushed through the cap
    pub eligible: Option<Decimal>,
}

/// Accountant over the store's capped increment.
///
/// Closes use [`VolumeAccountant::pending`] and let `settle_close` apply the
/// cap inside the close transaction. [`VolumeAccountant::counted_volume`]
/// applies it on its own and is meant for backfills and admin corrections.
pub struct VolumeAccountant<'a> {
    db: &'a Database,
    config: &'a VolumeConfig,
}

impl<'a> VolumeAccountant<'a> {
    pub fn new(db: &'a Database, config: &'a VolumeConfig) -> Self {
        Self { db, config }
    }

    pub fn daily_cap(&self) -> Decimal {
        self.config.daily_cap
    }

    pub fn pending(&self, open_time_seconds: i64, position_size_usdt: Decimal) -> PendingVolume {
        match assess(open_time_seconds, position_size_usdt, self.config) {
            VolumeAssessment::Rejected(reason) => PendingVolume {
                counted: CountedVolume::rejected(reason),
                eligible: None,
            },
            VolumeAssessment::Eligible(raw) => PendingVolume {
                counted: CountedVolume { amount: raw, reason: None },
                eligible: Some(raw),
            },
        }
    }

    pub fn counted_volume(
        &self,
        open_time_seconds: i64,
        position_size_usdt: Decimal,
        user_id: &str,
        period: NaiveDate,
    ) -> Result<CountedVolume, TradeError> {
        let pending = self.pending(open_time_seconds, position_size_usdt);
        match pending.eligible {
            None => Ok(pending.counted),
            Some(raw) => {
                let cap = self.db.add_counted_volume(user_id, period, raw, self.config.daily_cap)?;
                Ok(finalize(&cap))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn period() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    #[test]
    fn test_tiering() {
        let db = Database::in_memory().unwrap();
        let config = VolumeConfig::default();
        let accountant = VolumeAccountant::new(&db, &config);

        let too_fast = accountant.counted_volume(29, dec!(1000), "alice", period()).unwrap();
        assert_eq!(too_fast, CountedVolume::rejected(CountedVolumeReason::TooFast));

        let half = accountant.counted_volume(45, dec!(1000), "alice", period()).unwrap();
        assert_eq!(half.amount, dec!(500));
        assert_eq!(half.reason, None);

        let three_quarters = accountant.counted_volume(90, dec!(1000), "alice", period()).unwrap();
        assert_eq!(three_quarters.amount, dec!(750));

        let full = accountant.counted_volume(200, dec!(1000), "alice", period()).unwrap();
        assert_eq!(full.amount, dec!(1000));

        let too_small = accountant.counted_volume(200, dec!(4), "alice", period()).unwrap();
        assert_eq!(too_small, CountedVolume::rejected(CountedVolumeReason::TooSmall));

        assert_eq!(db.counted_volume("alice", period()).unwrap(), dec!(2250));
    }

    #[test]
    fn test_tier_edges() {
        let config = VolumeConfig::default();
        assert_eq!(hold_weight(30, &config), dec!(0.5));
        assert_eq!(hold_weight(59, &config), dec!(0.5));
        assert_eq!(hold_weight(60, &config), dec!(0.75));
        assert_eq!(hold_weight(179, &config), dec!(0.75));
        assert_eq!(hold_weight(180, &config), dec!(1.0));
        assert_eq!(hold_weight(10, &config), Decimal::ZERO);
    }

    #[test]
    fn test_daily_cap_partial_then_reached() {
        let db = Database::in_memory().unwrap();
        let config = VolumeConfig::default();
        let accountant = VolumeAccountant::new(&db, &config);
        db.add_counted_volume("alice", period(), dec!(49900), config.daily_cap).unwrap();

        let partial = accountant.counted_volume(200, dec!(1000), "alice", period()).unwrap();
        assert_eq!(partial, CountedVolume { amount: dec!(100), reason: None });

        let capped = accountant.counted_volume(200, dec!(1000), "alice", period()).unwrap();
        assert_eq!(capped, CountedVolume::rejected(CountedVolumeReason::DailyCapReached));
        assert_eq!(db.counted_volume("alice", period()).unwrap(), dec!(50000));
    }

    #[test]
    fn test_pending_leaves_store_untouched() {
        let db = Database::in_memory().unwrap();
        let config = VolumeConfig::default();
        let accountant = VolumeAccountant::new(&db, &config);

        let eligible = accountant.pending(90, dec!(1000));
        assert_eq!(eligible.eligible, Some(dec!(750)));
        assert_eq!(eligible.counted, CountedVolume { amount: dec!(750), reason: None });

        let rejected = accountant.pending(200, dec!(4));
        assert_eq!(rejected.eligible, None);
        assert_eq!(rejected.counted, CountedVolume::rejected(CountedVolumeReason::TooSmall));

        assert_eq!(db.counted_volume("alice", period()).unwrap(), Decimal::ZERO);
        assert_eq!(accountant.daily_cap(), dec!(50000));
    }

    #[test]
    fn test_cap_increment_pure() {
        let r = cap_increment(dec!(49900), dec!(1000), dec!(50000));
        assert_eq!(r, CapResult { applied: dec!(100), truncated: true, total: dec!(50000) });

        let over = cap_increment(dec!(60000), dec!(10), dec!(50000));
        assert_eq!(over.applied, Decimal::ZERO);
        assert_eq!(over.total, dec!(60000));
    }
}
