//! Runtime configuration
//!
//! Tunables are grouped by the component that consumes them. Every group has
//! a `Default` matching production values; `Config::from_env` overrides the
//! handful that differ between deployments.

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::types::RewardKind;

/// Open/close parameters
#[derive(Debug, Clone)]
pub struct TradingConfig {
    /// Slippage applied against the trader on both legs (0.0003 = 3 bps)
    pub slippage_rate: Decimal,
    pub min_margin: Decimal,
    pub max_margin: Decimal,
    pub min_leverage: u32,
    pub max_leverage: u32,
    /// Maintenance margin ratio (0.5 = 50% of margin)
    pub maintenance_ratio: Decimal,
    /// Oil charged per 1 unit of notional
    pub fee_oil_per_notional: Decimal,
    pub max_opens_per_window: u32,
    pub open_rate_window: Duration,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            slippage_rate: dec!(0.0003),
            min_margin: dec!(5),
            max_margin: dec!(1000000),
            min_leverage: 1,
            max_leverage: 50,
            maintenance_ratio: dec!(0.5),
            fee_oil_per_notional: dec!(1),
            max_opens_per_window: 3,
            open_rate_window: Duration::from_secs(5),
        }
    }
}

/// One hold-time weighting band: trades held at least `min_hold_secs` count at `weight`
#[derive(Debug, Clone, Copy)]
pub struct HoldTier {
    pub min_hold_secs: i64,
    pub weight: Decimal,
}

/// Anti-spam volume weighting
#[derive(Debug, Clone)]
pub struct VolumeConfig {
    pub min_hold_secs: i64,
    pub min_notional: Decimal,
    /// Sorted ascending by `min_hold_secs`
    pub tiers: Vec<HoldTier>,
    pub daily_cap: Decimal,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            min_hold_secs: 30,
            min_notional: dec!(5),
            tiers: vec![
                HoldTier { min_hold_secs: 30, weight: dec!(0.5) },
                HoldTier { min_hold_secs: 60, weight: dec!(0.75) },
                HoldTier { min_hold_secs: 180, weight: dec!(1.0) },
            ],
            daily_cap: dec!(50000),
        }
    }
}

/// Reward pool and claim window
#[derive(Debug, Clone)]
pub struct RewardConfig {
    pub daily_pool: Decimal,
    pub referral_bonus_rate: Decimal,
    pub claim_reset_hour_utc: u32,
    /// Reset hour used to attribute closed trades to a volume period
    pub trade_period_reset_hour_utc: u32,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            daily_pool: dec!(10000),
            referral_bonus_rate: dec!(0.08),
            claim_reset_hour_utc: 5,
            trade_period_reset_hour_utc: 0,
        }
    }
}

/// Price oracle call policy: fixed delay, no backoff
#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_retries: 2,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Daily task targets and their payouts
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub trade_count_target: Decimal,
    pub trade_count_reward: (RewardKind, Decimal),
    pub trade_volume_target: Decimal,
    pub trade_volume_reward: (RewardKind, Decimal),
    pub win_count_target: Decimal,
    pub win_count_reward: (RewardKind, Decimal),
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            trade_count_target: dec!(5),
            trade_count_reward: (RewardKind::Oil, dec!(100)),
            trade_volume_target: dec!(10000),
            trade_volume_reward: (RewardKind::Usdt, dec!(50)),
            win_count_target: dec!(3),
            win_count_reward: (RewardKind::Kdx, dec!(5)),
        }
    }
}

/// Top-level service configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_path: String,
    pub price_api_url: String,
    pub starting_demo_usdt: Decimal,
    pub starting_oil: Decimal,
    pub trading: TradingConfig,
    pub volume: VolumeConfig,
    pub reward: RewardConfig,
    pub oracle: OracleConfig,
    pub tasks: TaskConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            database_path: "data/trade-settlement.db".to_string(),
            price_api_url: "https://api.binance.com".to_string(),
            starting_demo_usdt: dec!(10000),
            starting_oil: dec!(1000),
            trading: TradingConfig::default(),
            volume: VolumeConfig::default(),
            reward: RewardConfig::default(),
            oracle: OracleConfig::default(),
            tasks: TaskConfig::default(),
        }
    }
}

impl Config {
    /// Build from environment variables, falling back to defaults
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(path) = std::env::var("DATABASE_PATH") {
            config.database_path = path;
        }
        if let Ok(url) = std::env::var("PRICE_API_URL") {
            config.price_api_url = url.trim_end_matches('/').to_string();
        }

        config.reward.claim_reset_hour_utc =
            env_parse("CLAIM_RESET_HOUR_UTC", config.reward.claim_reset_hour_utc)?;
        config.reward.trade_period_reset_hour_utc = env_parse(
            "TRADE_PERIOD_RESET_HOUR_UTC",
            config.reward.trade_period_reset_hour_utc,
        )?;
        config.reward.daily_pool = env_parse("DAILY_REWARD_POOL", config.reward.daily_pool)?;
        config.starting_demo_usdt = env_parse("STARTING_DEMO_USDT", config.starting_demo_usdt)?;
        config.starting_oil = env_parse("STARTING_OIL", config.starting_oil)?;

        for (name, hour) in [
            ("CLAIM_RESET_HOUR_UTC", config.reward.claim_reset_hour_utc),
            ("TRADE_PERIOD_RESET_HOUR_UTC", config.reward.trade_period_reset_hour_utc),
        ] {
            if hour > 23 {
                anyhow::bail!("{} must be in 0..=23, got {}", name, hour);
            }
        }

        Ok(config)
    }
}

fn env_parse<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {}={:?}: {}", name, raw, e)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_published_constants() {
        let config = Config::default();
        assert_eq!(config.trading.slippage_rate, dec!(0.0003));
        assert_eq!(config.trading.max_leverage, 50);
        assert_eq!(config.trading.max_margin, dec!(1000000));
        assert_eq!(config.volume.daily_cap, dec!(50000));
        assert_eq!(config.reward.daily_pool, dec!(10000));
        assert_eq!(config.reward.claim_reset_hour_utc, 5);
        assert_eq!(config.reward.trade_period_reset_hour_utc, 0);
        assert_eq!(config.oracle.max_retries, 2);
    }

    #[test]
    fn test_env_parse_falls_back() {
        let value: u32 = env_parse("TRADE_SETTLEMENT_TEST_UNSET_VAR", 7).unwrap();
        assert_eq!(value, 7);
    }
}
