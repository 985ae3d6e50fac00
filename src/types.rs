use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Supported trading symbols
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Symbol {
    #[serde(rename = "BTCUSDT")]
    BtcUsdt,
    #[serde(rename = "ETHUSDT")]
    EthUsdt,
    #[serde(rename = "SOLUSDT")]
    SolUsdt,
    #[serde(rename = "BNBUSDT")]
    BnbUsdt,
    #[serde(rename = "XRPUSDT")]
    XrpUsdt,
    #[serde(rename = "DOGEUSDT")]
    DogeUsdt,
}

impl Symbol {
    pub const ALL: [Symbol; 6] = [
        Symbol::BtcUsdt,
        Symbol::EthUsdt,
        Symbol::SolUsdt,
        Symbol::BnbUsdt,
        Symbol::XrpUsdt,
        Symbol::DogeUsdt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Symbol::BtcUsdt => "BTCUSDT",
            Symbol::EthUsdt => "ETHUSDT",
            Symbol::SolUsdt => "SOLUSDT",
            Symbol::BnbUsdt => "BNBUSDT",
            Symbol::XrpUsdt => "XRPUSDT",
            Symbol::DogeUsdt => "DOGEUSDT",
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Symbol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace(['-', '/'], "");
        Symbol::ALL
            .into_iter()
            .find(|sym| sym.as_str() == normalized)
            .ok_or_else(|| format!("Unsupported symbol: {}", s))
    }
}

/// 交易方向
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "long" => Ok(Side::Long),
            "short" => Ok(Side::Short),
            _ => Err(format!("Invalid side: {} (expected long or short)", s)),
        }
    }
}

/// Which balance a payout lands in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RewardKind {
    Usdt,
    Oil,
    Kdx,
}

/// Why a closed trade counted less than its weighted size
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CountedVolumeReason {
    TooFast,
    TooSmall,
    DailyCapReached,
}

impl CountedVolumeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CountedVolumeReason::TooFast => "too_fast",
            CountedVolumeReason::TooSmall => "too_small",
            CountedVolumeReason::DailyCapReached => "daily_cap_reached",
        }
    }
}

impl FromStr for CountedVolumeReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "too_fast" => Ok(CountedVolumeReason::TooFast),
            "too_small" => Ok(CountedVolumeReason::TooSmall),
            "daily_cap_reached" => Ok(CountedVolumeReason::DailyCapReached),
            _ => Err(format!("Unknown counted volume reason: {}", s)),
        }
    }
}

/// Authenticated caller
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    pub id: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub wallet_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-user balances
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub user_id: String,
    pub demo_usdt_balance: Decimal,
    pub oil_balance: Decimal,
    pub kdx_balance: Decimal,
}

/// 仓位
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPosition {
    pub id: Uuid,
    pub user_id: String,
    pub symbol: Symbol,
    pub side: Side,
    /// Oracle mark at open
    pub entry_price: Decimal,
    /// Slippage-adjusted fill; absent on legacy rows
    pub entry_price_executed: Option<Decimal>,
    pub leverage: u32,
    pub margin: Decimal,
    /// Notional in base asset
    pub position_size: Decimal,
    pub liquidation_price: Decimal,
    pub fee_oil_paid: Decimal,
    pub slippage_rate: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl OpenPosition {
    pub fn effective_entry_price(&self) -> Decimal {
        self.entry_price_executed.unwrap_or(self.entry_price)
    }
}

/// Closed trade, append-only
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeHistory {
    pub id: Uuid,
    pub position_id: Uuid,
    pub user_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub entry_price: Decimal,
    pub entry_price_executed: Decimal,
    pub leverage: u32,
    pub margin: Decimal,
    pub position_size: Decimal,
    pub liquidation_price: Decimal,
    pub fee_oil_paid: Decimal,
    pub slippage_rate: Decimal,
    pub opened_at: DateTime<Utc>,
    pub exit_price: Decimal,
    pub exit_price_executed: Decimal,
    pub realized_pnl: Decimal,
    pub open_time_seconds: i64,
    pub counted_volume: Decimal,
    pub counted_volume_reason: Option<CountedVolumeReason>,
    pub period: NaiveDate,
    pub closed_at: DateTime<Utc>,
}

/// Immutable record of a pool payout
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardClaim {
    pub id: Uuid,
    pub user_id: String,
    pub period: NaiveDate,
    pub amount: Decimal,
    pub volume_score: Decimal,
    pub wallet_address: Option<String>,
    pub claimed_at: DateTime<Utc>,
}

// ==================== Requests ====================

#[derive(Debug, Deserialize)]
pub struct OpenTradeRequest {
    pub symbol: String,
    pub side: String,
    pub leverage: u32,
    pub margin: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseTradeRequest {
    pub position_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRewardRequest {
    pub period: Option<NaiveDate>,
    pub wallet_address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessReferralRequest {
    pub claim_id: Uuid,
    pub claimed_amount: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterUserRequest {
    pub wallet_address: Option<String>,
    pub referrer_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkWalletRequest {
    pub wallet_address: String,
}

#[derive(Debug, Deserialize)]
pub struct ClaimTaskRequest {
    pub task: String,
}

/// 分页参数
#[derive(Debug, Deserialize)]
pub struct PaginationParams {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    50
}

// ==================== Responses ====================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenTradeResult {
    pub position_id: Uuid,
    pub symbol: Symbol,
    pub side: Side,
    pub mark_price: Decimal,
    pub entry_price_executed: Decimal,
    pub slippage_rate: Decimal,
    pub margin: Decimal,
    pub leverage: u32,
    pub position_size: Decimal,
    pub liquidation_price: Decimal,
    pub fee_oil: Decimal,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseTradeResult {
    pub symbol: Symbol,
    pub side: Side,
    pub mark_price: Decimal,
    pub entry_price_executed: Decimal,
    pub exit_price_executed: Decimal,
    pub realized_pnl: Decimal,
    pub open_time_seconds: i64,
    pub counted_volume: Decimal,
    pub counted_volume_reason: Option<CountedVolumeReason>,
    pub slippage_rate: Decimal,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimReceipt {
    pub claim_id: Uuid,
    pub amount: Decimal,
    pub new_kdx_balance: Decimal,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredUser {
    pub user_id: String,
    pub api_key: String,
    pub wallet_address: Option<String>,
    pub balance: Balance,
}

/// 分页响应
#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: u32,
    pub limit: u32,
    pub offset: u32,
}

/// API 响应
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}
