//! Margin, liquidation and PnL math
//!
//! Key concepts:
//! - Notional: margin * leverage, in quote units
//! - Maintenance Margin: minimum equity to keep the position (50% of margin)
//! - Liquidation price: the executed entry moved by maintenance / size against the trader
//!
//! Anything fed by request amounts uses checked arithmetic and returns `None`
//! when the result leaves `Decimal` range.

use rust_decimal::Decimal;

use crate::config::TradingConfig;
use crate::types::Side;

/// Notional size in quote units
pub fn notional(margin: Decimal, leverage: u32) -> Option<Decimal> {
    margin.checked_mul(Decimal::from(leverage))
}

/// Oil fee for a given notional, rounded up to whole units
pub fn fee_oil(notional_usdt: Decimal, config: &TradingConfig) -> Option<Decimal> {
    notional_usdt
        .checked_mul(config.fee_oil_per_notional)
        .map(|fee| fee.ceil())
}

/// Base units bought with `notional_usdt` at the executed entry
pub fn position_size(notional_usdt: Decimal, entry_executed: Decimal) -> Option<Decimal> {
    notional_usdt.checked_div(entry_executed)
}

pub fn maintenance_margin(margin: Decimal, config: &TradingConfig) -> Option<Decimal> {
    margin.checked_mul(config.maintenance_ratio)
}

/// Liquidation price, never negative
pub fn liquidation_price(
    side: Side,
    entry_executed: Decimal,
    position_size: Decimal,
    margin: Decimal,
    config: &TradingConfig,
) -> Option<Decimal> {
    if position_size <= Decimal::ZERO {
        return Some(Decimal::ZERO);
    }

    let distance = maintenance_margin(margin, config)?.checked_div(position_size)?;
    let price = match side {
        Side::Long => entry_executed.checked_sub(distance)?,
        Side::Short => entry_executed.checked_add(distance)?,
    };

    Some(price.max(Decimal::ZERO))
}

/// Realized PnL between two executed prices
pub fn realized_pnl(
    side: Side,
    entry_executed: Decimal,
    exit_executed: Decimal,
    position_size: Decimal,
) -> Option<Decimal> {
    let pnl = exit_executed.checked_sub(entry_executed)?.checked_mul(position_size)?;
    Some(match side {
        Side::Long => pnl,
        Side::Short => -pnl,
    })
}

/// Amount returned to the trader on close. Losses beyond the margin are absorbed.
pub fn settlement_credit(margin: Decimal, pnl: Decimal) -> Decimal {
    (margin + pnl).max(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_pnl_long() {
        // 1 unit, 100 -> 110
        assert_eq!(realized_pnl(Side::Long, dec!(100), dec!(110), dec!(1)), Some(dec!(10)));
        assert_eq!(realized_pnl(Side::Long, dec!(100), dec!(95), dec!(2)), Some(dec!(-10)));
    }

    #[test]
    fn test_pnl_short() {
        // price down is good for short
        assert_eq!(realized_pnl(Side::Short, dec!(100), dec!(90), dec!(1)), Some(dec!(10)));
        assert_eq!(realized_pnl(Side::Short, dec!(100), dec!(105), dec!(1)), Some(dec!(-5)));
    }

    #[test]
    fn test_liquidation() {
        let config = TradingConfig::default();
        // margin 100, 10x, entry 100 -> size 10, maint 50, distance 5
        let liq_long = liquidation_price(Side::Long, dec!(100), dec!(10), dec!(100), &config);
        assert_eq!(liq_long, Some(dec!(95)));

        let liq_short = liquidation_price(Side::Short, dec!(100), dec!(10), dec!(100), &config);
        assert_eq!(liq_short, Some(dec!(105)));
    }

    #[test]
    fn test_liquidation_clamped_at_zero() {
        let config = TradingConfig::default();
        // 1x long on a tiny price: distance exceeds entry
        let liq = liquidation_price(Side::Long, dec!(0.001), dec!(0.01), dec!(100), &config);
        assert_eq!(liq, Some(Decimal::ZERO));
    }

    #[test]
    fn test_fee_rounds_up() {
        let config = TradingConfig::default();
        assert_eq!(fee_oil(dec!(50), &config), Some(dec!(50)));
        assert_eq!(fee_oil(dec!(50.2), &config), Some(dec!(51)));
    }

    #[test]
    fn test_overflow_is_none() {
        let config = TradingConfig::default();
        let huge = Decimal::MAX / dec!(10);

        assert_eq!(notional(huge, 50), None);
        assert_eq!(fee_oil(Decimal::MAX, &TradingConfig { fee_oil_per_notional: dec!(2), ..config.clone() }), None);
        assert_eq!(position_size(dec!(100), Decimal::ZERO), None);
        assert_eq!(realized_pnl(Side::Long, dec!(1), Decimal::MAX, dec!(2)), None);
        assert_eq!(notional(dec!(100), 50), Some(dec!(5000)));
    }

    #[test]
    fn test_settlement_credit_caps_loss_at_margin() {
        assert_eq!(settlement_credit(dec!(100), dec!(-30)), dec!(70));
        assert_eq!(settlement_credit(dec!(100), dec!(-250)), Decimal::ZERO);
        assert_eq!(settlement_credit(dec!(100), dec!(25)), dec!(125));
    }

    proptest! {
        #[test]
        fn prop_liquidation_on_losing_side(
            price_cents in 100i64..10_000_000i64,
            margin in 5i64..10_000i64,
            leverage in 1u32..=50u32,
        ) {
            let config = TradingConfig::default();
            let entry = Decimal::new(price_cents, 2);
            let margin = Decimal::from(margin);
            let size = position_size(notional(margin, leverage).unwrap(), entry).unwrap();

            let long = liquidation_price(Side::Long, entry, size, margin, &config).unwrap();
            let short = liquidation_price(Side::Short, entry, size, margin, &config).unwrap();
            prop_assert!(long < entry);
            prop_assert!(long >= Decimal::ZERO);
            prop_assert!(short > entry);
        }
    }
}
