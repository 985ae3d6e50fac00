//! Slippage model
//!
//! Fills are always worse than the mark for the trader: longs buy above and
//! sell below, shorts sell below and buy back above.

use rust_decimal::Decimal;

use crate::types::Side;

/// Which leg of the trade is being filled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillDirection {
    Open,
    Close,
}

/// Slippage-adjusted fill price
pub fn executed_price(mark: Decimal, side: Side, rate: Decimal, direction: FillDirection) -> Decimal {
    let pays_up = matches!(
        (side, direction),
        (Side::Long, FillDirection::Open) | (Side::Short, FillDirection::Close)
    );

    if pays_up {
        mark * (Decimal::ONE + rate)
    } else {
        mark * (Decimal::ONE - rate)
    }
}

pub fn open_price(mark: Decimal, side: Side, rate: Decimal) -> Decimal {
    executed_price(mark, side, rate, FillDirection::Open)
}

pub fn close_price(mark: Decimal, side: Side, rate: Decimal) -> Decimal {
    executed_price(mark, side, rate, FillDirection::Close)
}
