//! Core data types for backtesting and portfolio analysis

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single candlestick (OHLCV)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: i64,
}

/// Kind of signal a strategy can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Buy,
    Sell,
    StrongBuy,
    StrongSell,
    Hold,
}

impl SignalType {
    /// Signals that open or flip into a long position
    pub fn is_bullish(&self) -> bool {
        matches!(self, SignalType::Buy | SignalType::StrongBuy)
    }

    /// Signals that open or flip into a short position
    pub fn is_bearish(&self) -> bool {
        matches!(self, SignalType::Sell | SignalType::StrongSell)
    }
}

/// A trading signal emitted by a strategy for one candle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_type: SignalType,
    /// Close time of the candle the signal fires on
    pub time: i64,
    pub price: Decimal,
    /// Confidence in [0, 1]
    pub strength: f64,
    pub reason: String,
    /// Indicator snapshot at signal time, keyed by indicator name
    pub indicators: BTreeMap<String, f64>,
}

/// Direction of an open position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

/// Lifecycle state of a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// How position size is derived from capital
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSizing {
    /// A fixed quote-currency amount per trade
    Fixed,
    /// A percentage of current capital per trade
    Percentage,
    /// Size derived from risk per trade and stop distance
    RiskBased,
}

/// Strategy-independent simulation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyParams {
    pub symbol: String,
    pub timeframe: String,
    pub capital: Decimal,
    pub leverage: Decimal,
    pub sizing: PositionSizing,
    /// Fixed amount or percentage, depending on `sizing`
    pub position_size: Decimal,
    /// Percentage of capital risked per trade (risk-based sizing)
    pub risk_per_trade: Decimal,
    /// Stop-loss distance as a percentage of entry price
    pub stop_loss_pct: Decimal,
    /// Take-profit distance as a multiple of the stop distance
    pub risk_reward_ratio: Decimal,
    pub trailing_stop_enabled: bool,
    /// Favorable move (%) before the trailing stop activates
    pub trailing_activation_pct: Decimal,
    /// Trailing distance as a percentage of current price
    pub trailing_distance_pct: Decimal,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            timeframe: "1h".to_string(),
            capital: dec!(10000),
            leverage: Decimal::ONE,
            sizing: PositionSizing::Percentage,
            position_size: dec!(10),
            risk_per_trade: dec!(1),
            stop_loss_pct: dec!(2),
            risk_reward_ratio: dec!(2.5),
            trailing_stop_enabled: true,
            trailing_activation_pct: dec!(2),
            trailing_distance_pct: dec!(1),
        }
    }
}

/// A simulated position, open or closed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: u64,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub entry_time: i64,
    pub exit_price: Option<Decimal>,
    pub exit_time: Option<i64>,
    pub exit_reason: Option<String>,
    pub size: Decimal,
    /// Entry value (entry price x size)
    pub value: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub trailing_stop: Option<Decimal>,
    pub status: PositionStatus,
    pub pnl: Decimal,
    pub pnl_pct: Decimal,
    pub fee: Decimal,
}

/// A point on the equity curve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: i64,
    pub equity: Decimal,
}

/// Result of a backtest run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub strategy_name: String,
    pub symbol: String,
    pub timeframe: String,
    pub start_time: i64,
    pub end_time: i64,
    pub initial_capital: Decimal,
    pub final_capital: Decimal,
    pub total_return_pct: Decimal,
    pub annualized_return_pct: Decimal,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub win_rate: Decimal,
    pub average_trade: Decimal,
    pub average_win: Decimal,
    pub average_loss: Decimal,
    pub profit_factor: Decimal,
    pub max_drawdown_pct: Decimal,
    pub max_drawdown_amount: Decimal,
    pub max_consecutive_wins: u32,
    pub max_consecutive_losses: u32,
    pub sharpe_ratio: Decimal,
    pub sortino_ratio: Decimal,
    pub best_trade: Decimal,
    pub worst_trade: Decimal,
    pub average_holding_time_ms: i64,
    pub max_holding_time_ms: i64,
    pub min_holding_time_ms: i64,
    /// Net return (%) per calendar month, keyed "YYYY-MM"
    pub monthly_returns: BTreeMap<String, Decimal>,
    pub trades: Vec<Position>,
    pub equity_curve: Vec<EquityPoint>,
}

/// Lossy Decimal -> f64 conversion for statistics
pub fn to_f64(d: Decimal) -> f64 {
    d.to_string().parse::<f64>().unwrap_or(0.0)
}

/// f64 -> Decimal rounded to 4 decimal places, for reporting ratios
pub fn to_decimal(x: f64) -> Decimal {
    if x.is_finite() {
        Decimal::from_str_exact(&format!("{:.4}", x)).unwrap_or(Decimal::ZERO)
    } else {
        Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params() {
        let params = StrategyParams::default();
        assert_eq!(params.capital, dec!(10000));
        assert_eq!(params.sizing, PositionSizing::Percentage);
        assert_eq!(params.leverage, Decimal::ONE);
    }

    #[test]
    fn test_signal_type_direction() {
        assert!(SignalType::Buy.is_bullish());
        assert!(SignalType::StrongBuy.is_bullish());
        assert!(SignalType::Sell.is_bearish());
        assert!(SignalType::StrongSell.is_bearish());
        assert!(!SignalType::Hold.is_bullish());
        assert!(!SignalType::Hold.is_bearish());
    }

    #[test]
    fn test_decimal_conversions() {
        assert_eq!(to_f64(dec!(1.5)), 1.5);
        assert_eq!(to_decimal(1.23456), dec!(1.2346));
        assert_eq!(to_decimal(f64::NAN), Decimal::ZERO);
    }
}
