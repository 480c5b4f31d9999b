//! Backtest Lab engine
//!
//! Deterministic strategy backtesting and portfolio analytics: batch
//! indicators, money management, signal-generating strategies, a
//! candle-by-candle simulator, portfolio risk metrics, Monte Carlo weight
//! optimization, and parameter grid search.

pub mod backtest;
pub mod error;
pub mod indicators;
pub mod money;
pub mod portfolio;
pub mod risk;
pub mod search;
pub mod strategy;
pub mod types;

pub use backtest::BacktestEngine;
pub use error::{EngineError, EngineResult};
pub use strategy::{build_strategy, Strategy, StrategyKind};
