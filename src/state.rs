use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{error, info};
use uuid::Uuid;

use crate::claim::ClaimEngine;
use crate::config::Config;
use crate::db::Database;
use crate::error::TradeError;
use crate::period::RewardPeriodClock;
use crate::position::PositionEngine;
use crate::price_feed::PriceOracle;
use crate::referral::ReferralBonusCascade;
use crate::types::{RegisteredUser, UserAccount};

/// 应用状态 - 线程安全
#[derive(Clone)]
pub struct AppState {
    /// SQLite 数据库
    pub db: Arc<Database>,
    /// 价格预言机
    pub oracle: Arc<dyn PriceOracle>,
    pub config: Arc<Config>,
    /// API Key -> 用户 (内存缓存)
    api_keys: Arc<DashMap<String, UserAccount>>,
}

impl AppState {
    pub fn new(config: Config, oracle: Arc<dyn PriceOracle>) -> anyhow::Result<Self> {
        // Ensure data directory exists
        if let Some(parent) = std::path::Path::new(&config.database_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::new(&config.database_path)?;
        Ok(Self::with_db(db, config, oracle))
    }

    pub fn with_db(db: Database, config: Config, oracle: Arc<dyn PriceOracle>) -> Self {
        Self {
            db: Arc::new(db),
            oracle,
            config: Arc::new(config),
            api_keys: Arc::new(DashMap::new()),
        }
    }

    pub fn positions(&self) -> PositionEngine<'_> {
        PositionEngine::new(
            &self.db,
            self.oracle.as_ref(),
            &self.config.trading,
            &self.config.volume,
            &self.config.oracle,
            self.config.reward.trade_period_reset_hour_utc,
        )
    }

    pub fn claims(&self) -> ClaimEngine<'_> {
        ClaimEngine::new(&self.db, &self.config.reward)
    }

    pub fn referrals(&self) -> ReferralBonusCascade<'_> {
        ReferralBonusCascade::new(&self.db, &self.config.reward)
    }

    /// Clock that buckets trades and volume into periods
    pub fn trade_clock(&self) -> RewardPeriodClock {
        RewardPeriodClock::new(self.config.reward.trade_period_reset_hour_utc)
    }

    /// 注册用户 (持久化 + 缓存)
    pub fn register_user(
        &self,
        wallet_address: Option<String>,
        referrer_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RegisteredUser, TradeError> {
        let wallet_address = normalize_wallet(wallet_address)?;
        let user = UserAccount {
            id: format!("user_{}", Uuid::new_v4().simple()),
            api_key: format!("ak_{}", Uuid::new_v4().simple()),
            wallet_address,
            created_at: now,
        };

        let balance = self
            .db
            .create_user(
                &user,
                self.config.starting_demo_usdt,
                self.config.starting_oil,
                referrer_id,
            )
            .map_err(|e| {
                error!("Failed to save user {}: {}", user.id, e);
                TradeError::from(e)
            })?;

        info!(
            "👤 Registered {} (wallet={}, referrer={})",
            user.id,
            user.wallet_address.as_deref().unwrap_or("-"),
            referrer_id.unwrap_or("-")
        );

        self.api_keys.insert(user.api_key.clone(), user.clone());

        Ok(RegisteredUser {
            user_id: user.id,
            api_key: user.api_key,
            wallet_address: user.wallet_address,
            balance,
        })
    }

    /// 根据 API Key 验证用户
    pub fn validate_api_key(&self, api_key: &str) -> Option<UserAccount> {
        // Check memory cache first
        if let Some(user) = self.api_keys.get(api_key) {
            return Some(user.value().clone());
        }

        // Fall back to database
        match self.db.get_user_by_api_key(api_key) {
            Ok(Some(user)) => {
                self.api_keys.insert(user.api_key.clone(), user.clone());
                Some(user)
            }
            Ok(None) => None,
            Err(e) => {
                error!("API key lookup failed: {}", e);
                None
            }
        }
    }

    /// Link or replace the user's wallet, refreshing the cached account
    pub fn link_wallet(&self, user: &UserAccount, wallet_address: String) -> Result<UserAccount, TradeError> {
        let wallet = normalize_wallet(Some(wallet_address))?
            .ok_or_else(|| TradeError::Validation("walletAddress is required".to_string()))?;

        if !self.db.link_wallet(&user.id, &wallet)? {
            return Err(TradeError::NotFound(format!("User {}", user.id)));
        }

        let updated = UserAccount {
            wallet_address: Some(wallet),
            ..user.clone()
        };
        self.api_keys.insert(updated.api_key.clone(), updated.clone());
        info!("🔗 Wallet linked for {}", user.id);
        Ok(updated)
    }
}

fn normalize_wallet(wallet: Option<String>) -> Result<Option<String>, TradeError> {
    match wallet.map(|w| w.trim().to_string()) {
        None => Ok(None),
        Some(w) if w.is_empty() => Ok(None),
        Some(w) if w.len() > 128 || w.chars().any(char::is_whitespace) => {
            Err(TradeError::Validation("Invalid wallet address".to_string()))
        }
        Some(w) => Ok(Some(w)),
    }
}
