//! Claim engine - one share of the daily pool per user per closed period

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::RewardConfig;
use crate::db::{ClaimOutcome, Database};
use crate::error::TradeError;
use crate::period::{PeriodInfo, RewardPeriodClock};
use crate::types::{ClaimReceipt, RewardClaim};

/// `userVolume / poolVolume * dailyPool`, zero for an empty pool
pub fn reward_amount(user_volume: Decimal, pool_volume: Decimal, daily_pool: Decimal) -> Decimal {
    if pool_volume <= Decimal::ZERO || user_volume <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (user_volume / pool_volume * daily_pool).round_dp(8)
}

/// What a user can see about their pending reward
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardStatus {
    #[serde(flatten)]
    pub period: PeriodInfo,
    pub user_volume: Decimal,
    pub pool_volume: Decimal,
    pub estimated_amount: Decimal,
    pub already_claimed: bool,
    pub claim: Option<RewardClaim>,
}

pub struct ClaimEngine<'a> {
    db: &'a Database,
    config: &'a RewardConfig,
    clock: RewardPeriodClock,
}

impl<'a> ClaimEngine<'a> {
    pub fn new(db: &'a Database, config: &'a RewardConfig) -> Self {
        Self {
            db,
            config,
            clock: RewardPeriodClock::new(config.claim_reset_hour_utc),
        }
    }

    pub fn clock(&self) -> RewardPeriodClock {
        self.clock
    }

    /// Grant the user's share for `period` (defaults to the claimable period)
    pub fn claim(
        &self,
        user_id: &str,
        period: Option<NaiveDate>,
        wallet_address: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(ClaimReceipt, RewardClaim), TradeError> {
        if !self.clock.is_within_claim_window(now) {
            return Err(TradeError::NotWithinClaimWindow {
                reset_hour: self.clock.reset_hour_utc(),
            });
        }

        let claimable = self.clock.claimable_period(now);
        let period = period.unwrap_or(claimable);
        if period != claimable {
            return Err(TradeError::PeriodNotClaimable {
                requested: period.to_string(),
                claimable: claimable.to_string(),
            });
        }

        if self.db.get_claim(user_id, period)?.is_some() {
            return Err(TradeError::AlreadyClaimed(period.to_string()));
        }

        match self
            .db
            .claim_reward(user_id, period, self.config.daily_pool, wallet_address, now)?
        {
            ClaimOutcome::Claimed { receipt, claim } => {
                info!(
                    "🎁 Reward claimed: user={} period={} amount={} score={}",
                    user_id, period, receipt.amount, claim.volume_score
                );
                Ok((receipt, claim))
            }
            ClaimOutcome::AlreadyClaimed => Err(TradeError::AlreadyClaimed(period.to_string())),
            ClaimOutcome::NothingToClaim => {
                debug!("No rewards for user={} period={}", user_id, period);
                Err(TradeError::NoRewardsAvailable(period.to_string()))
            }
        }
    }

    pub fn status(&self, user_id: &str, now: DateTime<Utc>) -> Result<RewardStatus, TradeError> {
        let info = self.clock.snapshot(now);
        let period = info.claimable_period;
        let user_volume = self.db.counted_volume(user_id, period)?;
        let pool_volume = self.db.pool_volume(period)?;
        let claim = self.db.get_claim(user_id, period)?;

        Ok(RewardStatus {
            period: info,
            user_volume,
            pool_volume,
            estimated_amount: reward_amount(user_volume, pool_volume, self.config.daily_pool),
            already_claimed: claim.is_some(),
            claim,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn seeded() -> (Database, NaiveDate) {
        let db = Database::in_memory().unwrap();
        let period = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        db.add_counted_volume("alice", period, dec!(1000), dec!(50000)).unwrap();
        db.add_counted_volume("bob", period, dec!(3000), dec!(50000)).unwrap();
        (db, period)
    }

    #[test]
    fn test_reward_amount() {
        assert_eq!(reward_amount(dec!(1), dec!(4), dec!(10000)), dec!(2500));
        assert_eq!(reward_amount(dec!(0), dec!(4), dec!(10000)), Decimal::ZERO);
        assert_eq!(reward_amount(dec!(5), dec!(0), dec!(10000)), Decimal::ZERO);
    }

    #[test]
    fn test_claim_share_of_pool() {
        let (db, period) = seeded();
        let config = RewardConfig::default();
        let engine = ClaimEngine::new(&db, &config);

        let (receipt, claim) = engine
            .claim("alice", Some(period), Some("0xabc"), at("2024-03-02T06:00:00Z"))
            .unwrap();
        assert_eq!(receipt.amount, dec!(2500));
        assert_eq!(receipt.new_kdx_balance, dec!(2500));
        assert_eq!(claim.wallet_address.as_deref(), Some("0xabc"));
    }

    #[test]
    fn test_second_claim_rejected() {
        let (db, period) = seeded();
        let config = RewardConfig::default();
        let engine = ClaimEngine::new(&db, &config);
        let now = at("2024-03-02T06:00:00Z");

        engine.claim("bob", None, None, now).unwrap();
        let err = engine.claim("bob", Some(period), None, now).unwrap_err();
        assert!(matches!(err, TradeError::AlreadyClaimed(_)));
        assert_eq!(db.get_balance("bob").unwrap().unwrap().kdx_balance, dec!(7500));
    }

    #[test]
    fn test_claim_outside_window() {
        let (db, period) = seeded();
        let config = RewardConfig::default();
        let engine = ClaimEngine::new(&db, &config);

        let err = engine
            .claim("alice", Some(period), None, at("2024-03-02T04:30:00Z"))
            .unwrap_err();
        assert!(matches!(err, TradeError::NotWithinClaimWindow { reset_hour: 5 }));
    }

    #[test]
    fn test_wrong_period_rejected() {
        let (db, _) = seeded();
        let config = RewardConfig::default();
        let engine = ClaimEngine::new(&db, &config);

        let stale = NaiveDate::from_ymd_opt(2024, 2, 28).unwrap();
        let err = engine.claim("alice", Some(stale), None, at("2024-03-02T06:00:00Z")).unwrap_err();
        assert!(matches!(err, TradeError::PeriodNotClaimable { .. }));
    }

    #[test]
    fn test_no_volume_no_reward() {
        let (db, _) = seeded();
        let config = RewardConfig::default();
        let engine = ClaimEngine::new(&db, &config);

        let err = engine.claim("carol", None, None, at("2024-03-02T06:00:00Z")).unwrap_err();
        assert!(matches!(err, TradeError::NoRewardsAvailable(_)));
    }

    #[test]
    fn test_status_estimates_share() {
        let (db, _) = seeded();
        let config = RewardConfig::default();
        let engine = ClaimEngine::new(&db, &config);

        let status = engine.status("bob", at("2024-03-02T06:00:00Z")).unwrap();
        assert_eq!(status.estimated_amount, dec!(7500));
        assert_eq!(status.pool_volume, dec!(4000));
        assert!(!status.already_claimed);
        assert!(status.period.is_within_claim_window);
    }
}
