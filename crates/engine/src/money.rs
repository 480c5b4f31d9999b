//! Money management: position sizing and protective price levels

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::types::{Direction, PositionSizing};

const ATR_STOP_MULTIPLIER: Decimal = dec!(1.5);

/// Calculate position size in base units for a new trade.
///
/// Fixed sizing spends a flat quote amount, percentage sizing spends a
/// fraction of current capital, and risk-based sizing solves for the size
/// that loses `risk_per_trade` percent of capital if the stop is hit.
/// Risk-based sizing without a usable stop falls back to spending
/// `risk_per_trade` percent of capital directly. The result is scaled by
/// the leverage multiplier. Degenerate inputs (non-positive entry price)
/// size to zero.
#[allow(clippy::too_many_arguments)]
pub fn position_size(
    capital: Decimal,
    sizing: PositionSizing,
    size_param: Decimal,
    risk_per_trade: Decimal,
    entry_price: Decimal,
    stop_loss: Option<Decimal>,
    leverage: Decimal,
) -> Decimal {
    if entry_price <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let hundred = dec!(100);
    let size = match sizing {
        PositionSizing::Fixed => size_param / entry_price,
        PositionSizing::Percentage => capital * size_param / hundred / entry_price,
        PositionSizing::RiskBased => {
            let risk_amount = capital * risk_per_trade / hundred;
            let risk_per_unit = stop_loss
                .map(|stop| (entry_price - stop).abs() / entry_price)
                .unwrap_or(Decimal::ZERO);
            if risk_per_unit > Decimal::ZERO {
                risk_amount / (entry_price * risk_per_unit)
            } else {
                risk_amount / entry_price
            }
        }
    };

    size * leverage
}

/// Stop-loss level for an entry.
///
/// With an ATR value the stop distance is `ATR * 1.5`; otherwise it is
/// `entry * risk_pct / 100`. Longs stop below entry, shorts above.
pub fn stop_loss(
    entry_price: Decimal,
    direction: Direction,
    risk_pct: Decimal,
    atr: Option<Decimal>,
) -> Decimal {
    let distance = match atr {
        Some(atr) if atr > Decimal::ZERO => atr * ATR_STOP_MULTIPLIER,
        _ => entry_price * risk_pct / dec!(100),
    };

    match direction {
        Direction::Long => entry_price - distance,
        Direction::Short => entry_price + distance,
    }
}

/// Take-profit level at `risk_reward_ratio` times the stop distance
pub fn take_profit(
    entry_price: Decimal,
    stop_loss: Decimal,
    direction: Direction,
    risk_reward_ratio: Decimal,
) -> Decimal {
    let risk = (entry_price - stop_loss).abs();
    match direction {
        Direction::Long => entry_price + risk * risk_reward_ratio,
        Direction::Short => entry_price - risk * risk_reward_ratio,
    }
}

/// Trailing stop level, or `None` while the trade has not moved
/// `activation_pct` percent in its favor.
///
/// Once active the stop trails the current price by `distance_pct` percent.
/// Callers are expected to keep the tightest stop seen so far.
pub fn trailing_stop(
    activation_pct: Decimal,
    distance_pct: Decimal,
    entry_price: Decimal,
    direction: Direction,
    current_price: Decimal,
) -> Option<Decimal> {
    if entry_price <= Decimal::ZERO {
        return None;
    }

    let hundred = dec!(100);
    let profit_pct = match direction {
        Direction::Long => (current_price - entry_price) / entry_price * hundred,
        Direction::Short => (entry_price - current_price) / entry_price * hundred,
    };

    if profit_pct < activation_pct {
        return None;
    }

    let distance = current_price * distance_pct / hundred;
    Some(match direction {
        Direction::Long => current_price - distance,
        Direction::Short => current_price + distance,
    })
}
