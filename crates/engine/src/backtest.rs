//! Candle-by-candle backtest simulation
//!
//! The engine replays a strategy's signals against the candle series with a
//! single-position state machine. Exit conditions are checked in a fixed
//! order on every candle: stop-loss, take-profit, opposing signal, trailing
//! stop. Both legs of a round trip pay a 0.1% fee on traded value.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::money;
use crate::strategy::Strategy;
use crate::types::{
    to_decimal, to_f64, BacktestResult, Candle, Direction, EquityPoint, Position, PositionStatus,
    Signal, StrategyParams,
};

/// Fee rate per leg (0.1% of traded value)
const FEE_RATE: Decimal = dec!(0.001);

const TRADING_DAYS_PER_YEAR: f64 = 252.0;
const MS_PER_DAY: f64 = 86_400_000.0;

struct MonthBucket {
    start_equity: Decimal,
    pnl: Decimal,
}

/// Running totals accumulated while closing trades
struct SimState {
    equity: Decimal,
    peak_equity: Decimal,
    max_drawdown_pct: Decimal,
    max_drawdown_amount: Decimal,
    winning: u32,
    losing: u32,
    total_win_amount: Decimal,
    total_loss_amount: Decimal,
    consecutive_wins: u32,
    consecutive_losses: u32,
    max_consecutive_wins: u32,
    max_consecutive_losses: u32,
    best_trade: Decimal,
    worst_trade: Decimal,
    total_holding_ms: i64,
    max_holding_ms: i64,
    min_holding_ms: i64,
    next_id: u64,
    monthly: BTreeMap<String, MonthBucket>,
    trades: Vec<Position>,
    equity_curve: Vec<EquityPoint>,
}

impl SimState {
    fn new(capital: Decimal, start_time: i64) -> Self {
        Self {
            equity: capital,
            peak_equity: capital,
            max_drawdown_pct: Decimal::ZERO,
            max_drawdown_amount: Decimal::ZERO,
            winning: 0,
            losing: 0,
            total_win_amount: Decimal::ZERO,
            total_loss_amount: Decimal::ZERO,
            consecutive_wins: 0,
            consecutive_losses: 0,
            max_consecutive_wins: 0,
            max_consecutive_losses: 0,
            best_trade: Decimal::ZERO,
            worst_trade: Decimal::ZERO,
            total_holding_ms: 0,
            max_holding_ms: 0,
            min_holding_ms: i64::MAX,
            next_id: 0,
            monthly: BTreeMap::new(),
            trades: Vec::new(),
            equity_curve: vec![EquityPoint {
                time: start_time,
                equity: capital,
            }],
        }
    }

    /// Fold a closed position into the running totals
    fn record_close(&mut self, pos: Position) {
        let equity_before = self.equity;
        self.equity += pos.pnl;

        let exit_time = pos.exit_time.unwrap_or(pos.entry_time);
        self.equity_curve.push(EquityPoint {
            time: exit_time,
            equity: self.equity,
        });

        if self.equity > self.peak_equity {
            self.peak_equity = self.equity;
        }
        let drawdown = self.peak_equity - self.equity;
        if self.peak_equity > Decimal::ZERO {
            let drawdown_pct = drawdown / self.peak_equity * dec!(100);
            if drawdown_pct > self.max_drawdown_pct {
                self.max_drawdown_pct = drawdown_pct;
                self.max_drawdown_amount = drawdown;
            }
        }

        if pos.pnl > Decimal::ZERO {
            self.winning += 1;
            self.total_win_amount += pos.pnl;
            self.consecutive_wins += 1;
            self.consecutive_losses = 0;
            self.max_consecutive_wins = self.max_consecutive_wins.max(self.consecutive_wins);
        } else {
            self.losing += 1;
            self.total_loss_amount += pos.pnl.abs();
            self.consecutive_losses += 1;
            self.consecutive_wins = 0;
            self.max_consecutive_losses = self.max_consecutive_losses.max(self.consecutive_losses);
        }

        if self.trades.is_empty() {
            self.best_trade = pos.pnl;
            self.worst_trade = pos.pnl;
        } else {
            self.best_trade = self.best_trade.max(pos.pnl);
            self.worst_trade = self.worst_trade.min(pos.pnl);
        }

        let holding = exit_time - pos.entry_time;
        self.total_holding_ms += holding;
        self.max_holding_ms = self.max_holding_ms.max(holding);
        self.min_holding_ms = self.min_holding_ms.min(holding);

        let bucket = self
            .monthly
            .entry(month_key(exit_time))
            .or_insert(MonthBucket {
                start_equity: equity_before,
                pnl: Decimal::ZERO,
            });
        bucket.pnl += pos.pnl;

        self.trades.push(pos);
    }
}

fn month_key(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.format("%Y-%m").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Candle-by-candle backtesting engine
pub struct BacktestEngine;

impl BacktestEngine {
    /// Run a backtest of `strategy` over `candles` with the given parameters.
    ///
    /// Fails fast with `InsufficientData` when the series is shorter than
    /// the strategy's warm-up window. A position still open after the last
    /// candle is closed at the final close price.
    pub fn run(
        params: &StrategyParams,
        strategy: &dyn Strategy,
        candles: &[Candle],
    ) -> EngineResult<BacktestResult> {
        let required = strategy.warmup().max(1);
        if candles.len() < required {
            return Err(EngineError::InsufficientData {
                required,
                actual: candles.len(),
            });
        }
        if params.capital <= Decimal::ZERO {
            return Err(EngineError::InvalidConfig(
                "initial capital must be positive".to_string(),
            ));
        }

        let signals = strategy.analyze(candles);
        let by_time: HashMap<i64, &Signal> = signals.iter().map(|s| (s.time, s)).collect();

        info!(
            strategy = strategy.name(),
            symbol = %params.symbol,
            candles = candles.len(),
            signals = signals.len(),
            capital = %params.capital,
            "starting backtest"
        );

        let mut state = SimState::new(params.capital, candles[0].open_time);
        let mut position: Option<Position> = None;

        for candle in candles {
            let signal = by_time.get(&candle.close_time).copied();
            let had_open = position.is_some();

            // Exit checks, in priority order
            let mut exit: Option<(Decimal, &'static str)> = None;
            if let Some(pos) = position.as_mut() {
                let is_long = pos.direction == Direction::Long;

                if let Some(stop) = pos.stop_loss {
                    if (is_long && candle.low <= stop) || (!is_long && candle.high >= stop) {
                        exit = Some((stop, "stop-loss"));
                    }
                }

                if exit.is_none() {
                    if let Some(target) = pos.take_profit {
                        if (is_long && candle.high >= target)
                            || (!is_long && candle.low <= target)
                        {
                            exit = Some((target, "take-profit"));
                        }
                    }
                }

                if exit.is_none() {
                    if let Some(sig) = signal {
                        let opposing = (is_long && sig.signal_type.is_bearish())
                            || (!is_long && sig.signal_type.is_bullish());
                        if opposing {
                            exit = Some((candle.close, "reversal"));
                        }
                    }
                }

                if exit.is_none() && params.trailing_stop_enabled {
                    if let Some(candidate) = money::trailing_stop(
                        params.trailing_activation_pct,
                        params.trailing_distance_pct,
                        pos.entry_price,
                        pos.direction,
                        candle.close,
                    ) {
                        // The stop only ever tightens
                        pos.trailing_stop = Some(match pos.trailing_stop {
                            Some(prev) if is_long => prev.max(candidate),
                            Some(prev) => prev.min(candidate),
                            None => candidate,
                        });
                    }

                    if let Some(trail) = pos.trailing_stop {
                        if (is_long && candle.low <= trail) || (!is_long && candle.high >= trail) {
                            exit = Some((trail, "trailing-stop"));
                        }
                    }
                }
            }

            if let Some((price, reason)) = exit {
                if let Some(pos) = position.take() {
                    Self::close_position(&mut state, pos, price, candle.close_time, reason);
                }
            }

            // Entry on a fresh signal. A signal that just closed a position
            // is consumed by the exit and does not also open one.
            if !had_open {
                if let Some(sig) = signal {
                    let direction = if sig.signal_type.is_bullish() {
                        Some(Direction::Long)
                    } else if sig.signal_type.is_bearish() {
                        Some(Direction::Short)
                    } else {
                        None
                    };

                    if let Some(direction) = direction {
                        let entry_price = candle.close;
                        let stop = money::stop_loss(
                            entry_price,
                            direction,
                            params.stop_loss_pct,
                            None,
                        );
                        let target = money::take_profit(
                            entry_price,
                            stop,
                            direction,
                            params.risk_reward_ratio,
                        );
                        let size = money::position_size(
                            state.equity,
                            params.sizing,
                            params.position_size,
                            params.risk_per_trade,
                            entry_price,
                            Some(stop),
                            params.leverage,
                        );

                        if size > Decimal::ZERO {
                            state.next_id += 1;
                            position = Some(Position {
                                id: state.next_id,
                                symbol: params.symbol.clone(),
                                direction,
                                entry_price,
                                entry_time: candle.close_time,
                                exit_price: None,
                                exit_time: None,
                                exit_reason: None,
                                size,
                                value: entry_price * size,
                                stop_loss: Some(stop),
                                take_profit: Some(target),
                                trailing_stop: None,
                                status: PositionStatus::Open,
                                pnl: Decimal::ZERO,
                                pnl_pct: Decimal::ZERO,
                                fee: Decimal::ZERO,
                            });

                            debug!(
                                direction = ?direction,
                                price = %entry_price,
                                size = %size,
                                stop = %stop,
                                target = %target,
                                "opened position"
                            );
                        }
                    }
                }
            }
        }

        // Force-close anything still open at the last candle
        if let Some(pos) = position.take() {
            if let Some(last) = candles.last() {
                Self::close_position(&mut state, pos, last.close, last.close_time, "end of data");
            }
        }

        let result = Self::build_result(params, strategy.name(), candles, state);

        info!(
            total_trades = result.total_trades,
            win_rate = %result.win_rate,
            final_capital = %result.final_capital,
            max_drawdown_pct = %result.max_drawdown_pct,
            "backtest complete"
        );

        Ok(result)
    }

    fn close_position(
        state: &mut SimState,
        mut pos: Position,
        exit_price: Decimal,
        exit_time: i64,
        reason: &str,
    ) {
        let entry_value = pos.value;
        let exit_value = exit_price * pos.size;
        let gross = match pos.direction {
            Direction::Long => exit_value - entry_value,
            Direction::Short => entry_value - exit_value,
        };
        let fee = (entry_value + exit_value) * FEE_RATE;
        let pnl = gross - fee;

        pos.exit_price = Some(exit_price);
        pos.exit_time = Some(exit_time);
        pos.exit_reason = Some(reason.to_string());
        pos.status = PositionStatus::Closed;
        pos.pnl = pnl;
        pos.pnl_pct = if entry_value > Decimal::ZERO {
            pnl / entry_value * dec!(100)
        } else {
            Decimal::ZERO
        };
        pos.fee = fee;

        debug!(
            id = pos.id,
            entry = %pos.entry_price,
            exit = %exit_price,
            pnl = %pnl,
            reason,
            "closed position"
        );

        state.record_close(pos);
    }

    fn build_result(
        params: &StrategyParams,
        strategy_name: &str,
        candles: &[Candle],
        state: SimState,
    ) -> BacktestResult {
        let hundred = dec!(100);
        let total_trades = state.trades.len() as u32;

        let win_rate = if total_trades > 0 {
            Decimal::from(state.winning) / Decimal::from(total_trades) * hundred
        } else {
            Decimal::ZERO
        };

        let total_pnl = state.equity - params.capital;
        let total_return_pct = if params.capital > Decimal::ZERO {
            total_pnl / params.capital * hundred
        } else {
            Decimal::ZERO
        };

        let average_trade = if total_trades > 0 {
            total_pnl / Decimal::from(total_trades)
        } else {
            Decimal::ZERO
        };
        let average_win = if state.winning > 0 {
            state.total_win_amount / Decimal::from(state.winning)
        } else {
            Decimal::ZERO
        };
        let average_loss = if state.losing > 0 {
            state.total_loss_amount / Decimal::from(state.losing)
        } else {
            Decimal::ZERO
        };

        let profit_factor = if state.total_loss_amount > Decimal::ZERO {
            state.total_win_amount / state.total_loss_amount
        } else if state.total_win_amount > Decimal::ZERO {
            dec!(999.99) // Infinite profit factor capped
        } else {
            Decimal::ZERO
        };

        let start_time = candles.first().map(|c| c.open_time).unwrap_or(0);
        let end_time = candles.last().map(|c| c.close_time).unwrap_or(0);

        let annualized_return_pct =
            Self::annualized_return(to_f64(total_return_pct) / 100.0, start_time, end_time);

        let returns = Self::equity_returns(&state.equity_curve);
        let sharpe_ratio = Self::sharpe(&returns);
        let sortino_ratio = Self::sortino(&returns);

        let monthly_returns: BTreeMap<String, Decimal> = state
            .monthly
            .iter()
            .map(|(month, bucket)| {
                let pct = if bucket.start_equity > Decimal::ZERO {
                    bucket.pnl / bucket.start_equity * hundred
                } else {
                    Decimal::ZERO
                };
                (month.clone(), pct)
            })
            .collect();

        let average_holding_time_ms = if total_trades > 0 {
            state.total_holding_ms / total_trades as i64
        } else {
            0
        };
        let min_holding_time_ms = if total_trades > 0 {
            state.min_holding_ms
        } else {
            0
        };

        BacktestResult {
            strategy_name: strategy_name.to_string(),
            symbol: params.symbol.clone(),
            timeframe: params.timeframe.clone(),
            start_time,
            end_time,
            initial_capital: params.capital,
            final_capital: state.equity,
            total_return_pct,
            annualized_return_pct,
            total_trades,
            winning_trades: state.winning,
            losing_trades: state.losing,
            win_rate,
            average_trade,
            average_win,
            average_loss,
            profit_factor,
            max_drawdown_pct: state.max_drawdown_pct,
            max_drawdown_amount: state.max_drawdown_amount,
            max_consecutive_wins: state.max_consecutive_wins,
            max_consecutive_losses: state.max_consecutive_losses,
            sharpe_ratio,
            sortino_ratio,
            best_trade: state.best_trade,
            worst_trade: state.worst_trade,
            average_holding_time_ms,
            max_holding_time_ms: state.max_holding_ms,
            min_holding_time_ms,
            monthly_returns,
            trades: state.trades,
            equity_curve: state.equity_curve,
        }
    }

    /// Compound growth extrapolated to a 365-day year, as a percentage
    fn annualized_return(total_return: f64, start_time: i64, end_time: i64) -> Decimal {
        let days = (end_time - start_time) as f64 / MS_PER_DAY;
        if days <= 0.0 {
            return Decimal::ZERO;
        }
        let base = 1.0 + total_return;
        if base <= 0.0 {
            return dec!(-100);
        }
        to_decimal((base.powf(365.0 / days) - 1.0) * 100.0)
    }

    /// Percentage changes between consecutive equity points
    fn equity_returns(curve: &[EquityPoint]) -> Vec<f64> {
        curve
            .windows(2)
            .filter_map(|w| {
                let prev = to_f64(w[0].equity);
                if prev == 0.0 {
                    None
                } else {
                    Some(to_f64(w[1].equity) / prev - 1.0)
                }
            })
            .collect()
    }

    fn sharpe(returns: &[f64]) -> Decimal {
        if returns.len() < 2 {
            return Decimal::ZERO;
        }
        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let std_dev = variance.sqrt();
        if std_dev < 1e-10 {
            return Decimal::ZERO;
        }
        to_decimal(mean / std_dev * TRADING_DAYS_PER_YEAR.sqrt())
    }

    fn sortino(returns: &[f64]) -> Decimal {
        if returns.len() < 2 {
            return Decimal::ZERO;
        }
        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
        if downside.is_empty() {
            return Decimal::ZERO;
        }
        let downside_dev =
            (downside.iter().map(|r| r.powi(2)).sum::<f64>() / downside.len() as f64).sqrt();
        if downside_dev < 1e-10 {
            return Decimal::ZERO;
        }
        to_decimal(mean / downside_dev * TRADING_DAYS_PER_YEAR.sqrt())
    }
}
