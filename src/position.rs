//! Position engine - opens and closes leveraged positions
//!
//! Settlement math is recomputed from the stored position and a fresh
//! oracle price; the request only identifies what to act on.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{OracleConfig, TradingConfig, VolumeConfig};
use crate::db::{CloseSettlement, Database, OpenOutcome};
use crate::error::TradeError;
use crate::margin;
use crate::period::RewardPeriodClock;
use crate::price_feed::{fetch_mark_price, PriceOracle};
use crate::slippage;
use crate::tasks;
use crate::types::{
    CloseTradeResult, OpenPosition, OpenTradeRequest, OpenTradeResult, Side, Symbol, TradeHistory,
};
use crate::volume::VolumeAccountant;

/// Validated open parameters
#[derive(Debug, Clone, Copy)]
pub struct OpenOrder {
    pub symbol: Symbol,
    pub side: Side,
    pub leverage: u32,
    pub margin: Decimal,
}

impl OpenOrder {
    pub fn validate(req: &OpenTradeRequest, config: &TradingConfig) -> Result<Self, TradeError> {
        let symbol = req.symbol.parse::<Symbol>().map_err(TradeError::Validation)?;
        let side = req.side.parse::<Side>().map_err(TradeError::Validation)?;

        if req.leverage < config.min_leverage || req.leverage > config.max_leverage {
            return Err(TradeError::Validation(format!(
                "Leverage must be between {} and {}",
                config.min_leverage, config.max_leverage
            )));
        }
        if req.margin < config.min_margin {
            return Err(TradeError::Validation(format!(
                "Margin must be at least {}",
                config.min_margin
            )));
        }
        if req.margin > config.max_margin {
            return Err(TradeError::Validation(format!(
                "Margin must be at most {}",
                config.max_margin
            )));
        }

        Ok(Self {
            symbol,
            side,
            leverage: req.leverage,
            margin: req.margin,
        })
    }
}

fn out_of_range(what: &str) -> TradeError {
    TradeError::Validation(format!("{} is out of range", what))
}

pub struct PositionEngine<'a> {
    db: &'a Database,
    oracle: &'a dyn PriceOracle,
    trading: &'a TradingConfig,
    accountant: VolumeAccountant<'a>,
    oracle_config: &'a OracleConfig,
    trade_clock: RewardPeriodClock,
}

impl<'a> PositionEngine<'a> {
    pub fn new(
        db: &'a Database,
        oracle: &'a dyn PriceOracle,
        trading: &'a TradingConfig,
        volume: &'a VolumeConfig,
        oracle_config: &'a OracleConfig,
        trade_period_reset_hour_utc: u32,
    ) -> Self {
        Self {
            db,
            oracle,
            trading,
            accountant: VolumeAccountant::new(db, volume),
            oracle_config,
            trade_clock: RewardPeriodClock::new(trade_period_reset_hour_utc),
        }
    }

    fn rate_window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let window = Duration::from_std(self.trading.open_rate_window).unwrap_or_else(|_| Duration::seconds(5));
        now - window
    }

    fn rate_limited(&self) -> TradeError {
        TradeError::RateLimited {
            max: self.trading.max_opens_per_window,
            window_secs: self.trading.open_rate_window.as_secs(),
        }
    }

    pub async fn open(&self, user_id: &str, req: &OpenTradeRequest) -> Result<OpenTradeResult, TradeError> {
        self.open_at(user_id, req, Utc::now()).await
    }

    pub async fn open_at(
        &self,
        user_id: &str,
        req: &OpenTradeRequest,
        now: DateTime<Utc>,
    ) -> Result<OpenTradeResult, TradeError> {
        let order = OpenOrder::validate(req, self.trading)?;
        let window_start = self.rate_window_start(now);

        if self.db.count_recent_opens(user_id, window_start)? >= self.trading.max_opens_per_window {
            debug!("Open rate limited for {}", user_id);
            return Err(self.rate_limited());
        }

        let notional = margin::notional(order.margin, order.leverage).ok_or_else(|| out_of_range("Notional"))?;
        let fee_oil = margin::fee_oil(notional, self.trading).ok_or_else(|| out_of_range("Oil fee"))?;

        let balance = self
            .db
            .get_balance(user_id)?
            .ok_or_else(|| TradeError::NotFound(format!("Balance for {}", user_id)))?;
        if balance.demo_usdt_balance < order.margin || balance.oil_balance < fee_oil {
            return Err(TradeError::InsufficientFunds {
                required_usdt: order.margin,
                available_usdt: balance.demo_usdt_balance,
                required_oil: fee_oil,
                available_oil: balance.oil_balance,
            });
        }

        let mark = fetch_mark_price(self.oracle, order.symbol, self.oracle_config).await?;
        let slippage_rate = self.trading.slippage_rate;
        let entry_executed = slippage::open_price(mark, order.side, slippage_rate);
        let position_size =
            margin::position_size(notional, entry_executed).ok_or_else(|| out_of_range("Position size"))?;
        let liquidation_price =
            margin::liquidation_price(order.side, entry_executed, position_size, order.margin, self.trading)
                .ok_or_else(|| out_of_range("Liquidation price"))?;

        let position = OpenPosition {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            symbol: order.symbol,
            side: order.side,
            entry_price: mark,
            entry_price_executed: Some(entry_executed),
            leverage: order.leverage,
            margin: order.margin,
            position_size,
            liquidation_price,
            fee_oil_paid: fee_oil,
            slippage_rate,
            opened_at: now,
        };

        match self
            .db
            .open_position(&position, window_start, self.trading.max_opens_per_window)
        {
            Ok(OpenOutcome::Opened(_)) => {}
            Ok(OpenOutcome::RateLimited) => return Err(self.rate_limited()),
            Ok(OpenOutcome::InsufficientFunds { available_usdt, available_oil }) => {
                return Err(TradeError::InsufficientFunds {
                    required_usdt: order.margin,
                    available_usdt,
                    required_oil: fee_oil,
                    available_oil,
                });
            }
            Err(e) => {
                error!("Open failed to persist (user={}, symbol={}): {}", user_id, order.symbol, e);
                return Err(e.into());
            }
        }

        info!(
            "📈 Opened {} {} {}x margin={} mark={} fill={} size={}",
            user_id, order.symbol, order.leverage, order.margin, mark, entry_executed, position_size
        );

        Ok(OpenTradeResult {
            position_id: position.id,
            symbol: order.symbol,
            side: order.side,
            mark_price: mark,
            entry_price_executed: entry_executed,
            slippage_rate,
            margin: order.margin,
            leverage: order.leverage,
            position_size,
            liquidation_price,
            fee_oil,
        })
    }

    pub async fn close(&self, user_id: &str, position_id: &Uuid) -> Result<CloseTradeResult, TradeError> {
        self.close_at(user_id, position_id, Utc::now()).await
    }

    pub async fn close_at(
        &self,
        user_id: &str,
        position_id: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<CloseTradeResult, TradeError> {
        let position = self
            .db
            .get_open_position(user_id, position_id)?
            .ok_or_else(|| TradeError::NotFound(format!("Position {}", position_id)))?;

        let mark = fetch_mark_price(self.oracle, position.symbol, self.oracle_config).await?;
        let exit_executed = slippage::close_price(mark, position.side, position.slippage_rate);
        let entry_executed = position.effective_entry_price();
        let realized_pnl = margin::realized_pnl(position.side, entry_executed, exit_executed, position.position_size)
            .ok_or_else(|| out_of_range("Realized PnL"))?;
        let open_time_seconds = (now - position.opened_at).num_seconds().max(0);
        let notional = position
            .position_size
            .checked_mul(entry_executed)
            .ok_or_else(|| out_of_range("Notional"))?;
        let period = self.trade_clock.current_period(now);

        let pending = self.accountant.pending(open_time_seconds, notional);

        let settlement = CloseSettlement {
            history: TradeHistory {
                id: Uuid::new_v4(),
                position_id: position.id,
                user_id: position.user_id.clone(),
                symbol: position.symbol,
                side: position.side,
                entry_price: position.entry_price,
                entry_price_executed: entry_executed,
                leverage: position.leverage,
                margin: position.margin,
                position_size: position.position_size,
                liquidation_price: position.liquidation_price,
                fee_oil_paid: position.fee_oil_paid,
                slippage_rate: position.slippage_rate,
                opened_at: position.opened_at,
                exit_price: mark,
                exit_price_executed: exit_executed,
                realized_pnl,
                open_time_seconds,
                counted_volume: pending.counted.amount,
                counted_volume_reason: pending.counted.reason,
                period,
                closed_at: now,
            },
            eligible_volume: pending.eligible,
        };

        let (history, _balance) = match self.db.settle_close(&settlement, self.accountant.daily_cap()) {
            Ok(Some(done)) => done,
            Ok(None) => return Err(TradeError::NotFound(format!("Position {}", position_id))),
            Err(e) => {
                error!("Close failed to persist (user={}, position={}): {}", user_id, position_id, e);
                return Err(e.into());
            }
        };

        info!(
            "📉 Closed {} {} pnl={} held={}s counted={} reason={:?}",
            user_id,
            history.symbol,
            history.realized_pnl,
            history.open_time_seconds,
            history.counted_volume,
            history.counted_volume_reason
        );

        if history.realized_pnl < -history.margin {
            warn!(
                "Loss on {} exceeded margin ({} < -{}), credit clamped at zero",
                position_id, history.realized_pnl, history.margin
            );
        }

        tasks::record_close(self.db, user_id, period, notional, realized_pnl);

        Ok(CloseTradeResult {
            symbol: history.symbol,
            side: history.side,
            mark_price: mark,
            entry_price_executed: entry_executed,
            exit_price_executed: exit_executed,
            realized_pnl: history.realized_pnl,
            open_time_seconds: history.open_time_seconds,
            counted_volume: history.counted_volume,
            counted_volume_reason: history.counted_volume_reason,
            slippage_rate: history.slippage_rate,
        })
    }
}
