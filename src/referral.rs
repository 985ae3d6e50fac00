//! Referral bonus cascade
//!
//! Runs after a claim has committed. Never fails the claim it follows.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RewardConfig;
use crate::db::{BonusOutcome, Database};
use crate::error::TradeError;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BonusResult {
    pub processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bonus_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer_id: Option<String>,
}

impl BonusResult {
    pub fn skipped() -> Self {
        Self { processed: false, bonus_amount: None, referrer_id: None }
    }
}

pub struct ReferralBonusCascade<'a> {
    db: &'a Database,
    config: &'a RewardConfig,
}

impl<'a> ReferralBonusCascade<'a> {
    pub fn new(db: &'a Database, config: &'a RewardConfig) -> Self {
        Self { db, config }
    }

    pub fn process(
        &self,
        claim_id: &Uuid,
        claimed_amount: Decimal,
        claimant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<BonusResult, TradeError> {
        let outcome = self.db.process_referral_bonus(
            claim_id,
            claimed_amount,
            claimant_id,
            self.config.referral_bonus_rate,
            now,
        )?;

        Ok(match outcome {
            BonusOutcome::Paid { referrer_id, bonus_amount } => {
                info!(
                    "🤝 Referral bonus: {} earns {} KDX from claim {} by {}",
                    referrer_id, bonus_amount, claim_id, claimant_id
                );
                BonusResult {
                    processed: true,
                    bonus_amount: Some(bonus_amount),
                    referrer_id: Some(referrer_id),
                }
            }
            BonusOutcome::NoReferrer => BonusResult::skipped(),
            BonusOutcome::AlreadyProcessed => {
                info!("Referral bonus for claim {} already processed", claim_id);
                BonusResult::skipped()
            }
        })
    }

    /// Fire-and-forget variant used right after a claim commits
    pub fn process_best_effort(&self, claim_id: &Uuid, claimed_amount: Decimal, claimant_id: &str, now: DateTime<Utc>) {
        if let Err(e) = self.process(claim_id, claimed_amount, claimant_id, now) {
            warn!("Referral bonus for claim {} failed: {}", claim_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_bonus_paid_once() {
        let db = Database::in_memory().unwrap();
        db.add_referral("ref", "alice", "active").unwrap();
        let config = RewardConfig::default();
        let cascade = ReferralBonusCascade::new(&db, &config);
        let claim_id = Uuid::new_v4();

        let first = cascade.process(&claim_id, dec!(2500), "alice", Utc::now()).unwrap();
        assert_eq!(first.bonus_amount, Some(dec!(200)));
        assert_eq!(first.referrer_id.as_deref(), Some("ref"));
        assert!(first.processed);

        let second = cascade.process(&claim_id, dec!(2500), "alice", Utc::now()).unwrap();
        assert_eq!(second, BonusResult::skipped());
        assert_eq!(db.get_balance("ref").unwrap().unwrap().kdx_balance, dec!(200));
    }

    #[test]
    fn test_no_referrer_is_noop() {
        let db = Database::in_memory().unwrap();
        let config = RewardConfig::default();
        let cascade = ReferralBonusCascade::new(&db, &config);

        let result = cascade.process(&Uuid::new_v4(), dec!(100), "loner", Utc::now()).unwrap();
        assert!(!result.processed);
    }

    #[test]
    fn test_skipped_serializes_without_optionals() {
        let json = serde_json::to_value(BonusResult::skipped()).unwrap();
        assert_eq!(json, serde_json::json!({ "processed": false }));
    }
}
