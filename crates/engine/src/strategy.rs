//! Trading strategies
//!
//! A strategy consumes a candle series and emits at most one signal per
//! candle. Signals carry the close time of the candle they fired on; the
//! backtester replays them against the same series by matching close times.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::indicators::{ema, rsi, sma};
use crate::types::{to_f64, Candle, Signal, SignalType};

/// Volume lookback for the trend-following volume filter
const VOLUME_SMA_PERIOD: usize = 20;

/// Trend strength above which a signal upgrades to strong buy/sell
const STRONG_SIGNAL_STRENGTH: f64 = 0.8;

/// A signal-producing trading strategy
pub trait Strategy: Send {
    fn name(&self) -> &str;

    /// Number of leading candles consumed before the first signal can fire
    fn warmup(&self) -> usize;

    /// Scan the full series and return signals in chronological order,
    /// at most one per candle
    fn analyze(&self, candles: &[Candle]) -> Vec<Signal>;
}

/// Strategy selector with per-variant tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyKind {
    TrendFollowing {
        fast_ema: usize,
        slow_ema: usize,
        long_sma: usize,
        rsi_period: usize,
        rsi_overbought: f64,
        rsi_oversold: f64,
        /// Volume filter: candle volume must exceed this percent of the
        /// 20-candle average (150 = 1.5x average)
        volume_threshold: f64,
        /// Minimum composite trend strength in [0, 1]
        min_trend_strength: f64,
    },
    Momentum {
        /// Single-candle return that triggers an entry (0.02 = +2%)
        entry_change: f64,
        /// Single-candle return that triggers an exit (negative)
        exit_change: f64,
        /// Candle-over-candle volume multiple required at entry
        volume_ratio: f64,
    },
    MeanReversion {
        sma_period: usize,
        /// Deviation below the SMA that triggers an entry (0.03 = 3% below)
        entry_deviation: f64,
    },
}

impl StrategyKind {
    pub fn trend_following_default() -> Self {
        StrategyKind::TrendFollowing {
            fast_ema: 9,
            slow_ema: 21,
            long_sma: 50,
            rsi_period: 14,
            rsi_overbought: 70.0,
            rsi_oversold: 30.0,
            volume_threshold: 150.0,
            min_trend_strength: 0.6,
        }
    }

    pub fn momentum_default() -> Self {
        StrategyKind::Momentum {
            entry_change: 0.02,
            exit_change: -0.01,
            volume_ratio: 1.5,
        }
    }

    pub fn mean_reversion_default() -> Self {
        StrategyKind::MeanReversion {
            sma_period: 20,
            entry_deviation: 0.03,
        }
    }
}

/// Build a boxed strategy from its kind tag
pub fn build_strategy(kind: &StrategyKind) -> Box<dyn Strategy> {
    match kind.clone() {
        StrategyKind::TrendFollowing {
            fast_ema,
            slow_ema,
            long_sma,
            rsi_period,
            rsi_overbought,
            rsi_oversold,
            volume_threshold,
            min_trend_strength,
        } => Box::new(TrendFollowingStrategy {
            fast_ema,
            slow_ema,
            long_sma,
            rsi_period,
            rsi_overbought,
            rsi_oversold,
            volume_threshold,
            min_trend_strength,
        }),
        StrategyKind::Momentum {
            entry_change,
            exit_change,
            volume_ratio,
        } => Box::new(MomentumStrategy {
            entry_change,
            exit_change,
            volume_ratio,
        }),
        StrategyKind::MeanReversion {
            sma_period,
            entry_deviation,
        } => Box::new(MeanReversionStrategy {
            sma_period,
            entry_deviation,
        }),
    }
}

// ============================================================================
// Trend Following
// ============================================================================

/// EMA alignment + RSI regime filter + volume confirmation
pub struct TrendFollowingStrategy {
    pub fast_ema: usize,
    pub slow_ema: usize,
    pub long_sma: usize,
    pub rsi_period: usize,
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
    pub volume_threshold: f64,
    pub min_trend_strength: f64,
}

impl TrendFollowingStrategy {
    /// Composite trend strength in [0, 1]: 40% fast/slow separation,
    /// 40% slow/long separation, 20% RSI distance from the midline.
    fn trend_strength(&self, fast: f64, slow: f64, long: f64, rsi_value: f64) -> f64 {
        if slow == 0.0 || long == 0.0 {
            return 0.0;
        }
        let fast_slow = ((fast / slow - 1.0).abs() * 5.0).min(1.0);
        let slow_long = ((slow / long - 1.0).abs() * 5.0).min(1.0);
        let rsi_bias = (rsi_value - 50.0).abs() / 50.0;
        (0.4 * fast_slow + 0.4 * slow_long + 0.2 * rsi_bias).min(1.0)
    }
}

impl Strategy for TrendFollowingStrategy {
    fn name(&self) -> &str {
        "trend_following"
    }

    fn warmup(&self) -> usize {
        self.fast_ema
            .max(self.slow_ema)
            .max(self.long_sma)
            .max(self.rsi_period + 1)
            .max(VOLUME_SMA_PERIOD)
            + 10
    }

    fn analyze(&self, candles: &[Candle]) -> Vec<Signal> {
        let n = candles.len();
        let start = self.warmup();
        if n <= start
            || self.fast_ema == 0
            || self.slow_ema == 0
            || self.long_sma == 0
            || self.rsi_period == 0
        {
            return Vec::new();
        }

        let closes: Vec<f64> = candles.iter().map(|c| to_f64(c.close)).collect();
        let volumes: Vec<f64> = candles.iter().map(|c| to_f64(c.volume)).collect();

        let fast_vals = ema(&closes, self.fast_ema);
        let slow_vals = ema(&closes, self.slow_ema);
        let long_vals = sma(&closes, self.long_sma);
        let rsi_vals = rsi(&closes, self.rsi_period);
        let vol_avg = sma(&volumes, VOLUME_SMA_PERIOD);

        let mut signals = Vec::new();

        for i in start..n {
            let fast = fast_vals[i - (self.fast_ema - 1)];
            let slow = slow_vals[i - (self.slow_ema - 1)];
            let long = long_vals[i - (self.long_sma - 1)];
            let rsi_value = rsi_vals[i - self.rsi_period];
            let avg_volume = vol_avg[i - (VOLUME_SMA_PERIOD - 1)];

            let volume_ok = volumes[i] > avg_volume * self.volume_threshold / 100.0;
            if !volume_ok {
                continue;
            }

            let strength = self.trend_strength(fast, slow, long, rsi_value);
            if strength < self.min_trend_strength {
                continue;
            }

            let uptrend = fast > slow && slow > long;
            let downtrend = fast < slow && slow < long;

            let signal_type = if uptrend && rsi_value > 50.0 && rsi_value < self.rsi_overbought {
                if strength >= STRONG_SIGNAL_STRENGTH {
                    SignalType::StrongBuy
                } else {
                    SignalType::Buy
                }
            } else if downtrend && rsi_value < 50.0 && rsi_value > self.rsi_oversold {
                if strength >= STRONG_SIGNAL_STRENGTH {
                    SignalType::StrongSell
                } else {
                    SignalType::Sell
                }
            } else {
                continue;
            };

            let mut indicators = BTreeMap::new();
            indicators.insert("fast_ema".to_string(), fast);
            indicators.insert("slow_ema".to_string(), slow);
            indicators.insert("long_sma".to_string(), long);
            indicators.insert("rsi".to_string(), rsi_value);
            indicators.insert("avg_volume".to_string(), avg_volume);

            let reason = if signal_type.is_bullish() {
                format!("uptrend confirmed, rsi {:.1}, strength {:.2}", rsi_value, strength)
            } else {
                format!("downtrend confirmed, rsi {:.1}, strength {:.2}", rsi_value, strength)
            };

            signals.push(Signal {
                signal_type,
                time: candles[i].close_time,
                price: candles[i].close,
                strength,
                reason,
                indicators,
            });
        }

        signals
    }
}

// ============================================================================
// Momentum
// ============================================================================

/// Enters on a sharp single-candle move with a volume spike,
/// exits on an adverse move.
pub struct MomentumStrategy {
    pub entry_change: f64,
    pub exit_change: f64,
    pub volume_ratio: f64,
}

impl Strategy for MomentumStrategy {
    fn name(&self) -> &str {
        "momentum"
    }

    fn warmup(&self) -> usize {
        2
    }

    fn analyze(&self, candles: &[Candle]) -> Vec<Signal> {
        let closes: Vec<f64> = candles.iter().map(|c| to_f64(c.close)).collect();
        let volumes: Vec<f64> = candles.iter().map(|c| to_f64(c.volume)).collect();

        let mut signals = Vec::new();

        for i in 1..candles.len() {
            if closes[i - 1] == 0.0 {
                continue;
            }
            let change = closes[i] / closes[i - 1] - 1.0;
            let vol_ratio = if volumes[i - 1] > 0.0 {
                volumes[i] / volumes[i - 1]
            } else {
                0.0
            };

            let signal_type = if change > self.entry_change && vol_ratio > self.volume_ratio {
                SignalType::Buy
            } else if change < self.exit_change {
                SignalType::Sell
            } else {
                continue;
            };

            let strength = match signal_type {
                SignalType::Buy => (change / (self.entry_change * 2.0)).min(1.0),
                _ => (change.abs() / (self.exit_change.abs() * 2.0)).min(1.0),
            };

            let mut indicators = BTreeMap::new();
            indicators.insert("change".to_string(), change);
            indicators.insert("volume_ratio".to_string(), vol_ratio);

            signals.push(Signal {
                signal_type,
                time: candles[i].close_time,
                price: candles[i].close,
                strength,
                reason: format!("move {:.2}% on {:.1}x volume", change * 100.0, vol_ratio),
                indicators,
            });
        }

        signals
    }
}

// ============================================================================
// Mean Reversion
// ============================================================================

/// Buys a dip below the SMA band, exits once price reverts above it
pub struct MeanReversionStrategy {
    pub sma_period: usize,
    pub entry_deviation: f64,
}

impl Strategy for MeanReversionStrategy {
    fn name(&self) -> &str {
        "mean_reversion"
    }

    fn warmup(&self) -> usize {
        self.sma_period
    }

    fn analyze(&self, candles: &[Candle]) -> Vec<Signal> {
        if self.sma_period == 0 || candles.len() < self.sma_period {
            return Vec::new();
        }

        let closes: Vec<f64> = candles.iter().map(|c| to_f64(c.close)).collect();
        let sma_vals = sma(&closes, self.sma_period);

        let mut signals = Vec::new();

        for i in (self.sma_period - 1)..candles.len() {
            let sma_value = sma_vals[i - (self.sma_period - 1)];
            if sma_value == 0.0 {
                continue;
            }
            let deviation = closes[i] / sma_value - 1.0;

            let (signal_type, strength) = if deviation < -self.entry_deviation {
                (
                    SignalType::Buy,
                    (deviation.abs() / (self.entry_deviation * 2.0)).min(1.0),
                )
            } else if deviation > 0.0 {
                (SignalType::Sell, 0.5)
            } else {
                continue;
            };

            let mut indicators = BTreeMap::new();
            indicators.insert("sma".to_string(), sma_value);
            indicators.insert("deviation".to_string(), deviation);

            signals.push(Signal {
                signal_type,
                time: candles[i].close_time,
                price: candles[i].close,
                strength,
                reason: format!("deviation {:.2}% from {}-sma", deviation * 100.0, self.sma_period),
                indicators,
            });
        }

        signals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn make_candles(prices: &[f64], volumes: &[f64]) -> Vec<Candle> {
        prices
            .iter()
            .zip(volumes)
            .enumerate()
            .map(|(i, (&p, &v))| {
                let price = Decimal::from_str_exact(&format!("{:.2}", p)).unwrap();
                Candle {
                    open_time: (i as i64) * 60_000,
                    open: price,
                    high: price + dec!(1),
                    low: price - dec!(1),
                    close: price,
                    volume: Decimal::from_str_exact(&format!("{:.2}", v)).unwrap(),
                    close_time: ((i + 1) as i64) * 60_000 - 1,
                }
            })
            .collect()
    }

    fn flat_volumes(n: usize) -> Vec<f64> {
        vec![100.0; n]
    }

    #[test]
    fn test_build_strategy_names() {
        assert_eq!(
            build_strategy(&StrategyKind::trend_following_default()).name(),
            "trend_following"
        );
        assert_eq!(build_strategy(&StrategyKind::momentum_default()).name(), "momentum");
        assert_eq!(
            build_strategy(&StrategyKind::mean_reversion_default()).name(),
            "mean_reversion"
        );
    }

    #[test]
    fn test_trend_following_no_signal_before_warmup() {
        let strategy = build_strategy(&StrategyKind::trend_following_default());
        let prices: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let candles = make_candles(&prices, &flat_volumes(30));
        // 30 candles is below the default warm-up of 60
        assert!(strategy.analyze(&candles).is_empty());
    }

    #[test]
    fn test_trend_following_overbought_blocks_buy() {
        // Strictly rising series drives RSI to 100, above any real
        // overbought threshold, so no entries fire
        let strategy = build_strategy(&StrategyKind::trend_following_default());
        let prices: Vec<f64> = (0..120).map(|i| 100.0 + i as f64).collect();
        let candles = make_candles(&prices, &flat_volumes(120));
        let signals = strategy.analyze(&candles);
        assert!(signals.iter().all(|s| !s.signal_type.is_bullish()));
    }

    #[test]
    fn test_trend_following_buys_with_filters_relaxed() {
        // Disable the RSI ceiling, strength floor, and volume filter: a
        // clean uptrend must then produce bullish signals only
        let kind = StrategyKind::TrendFollowing {
            fast_ema: 3,
            slow_ema: 5,
            long_sma: 8,
            rsi_period: 5,
            rsi_overbought: 101.0,
            rsi_oversold: -1.0,
            volume_threshold: 0.0,
            min_trend_strength: 0.0,
        };
        let strategy = build_strategy(&kind);
        let prices: Vec<f64> = (0..60).map(|i| 100.0 + i as f64 * 2.0).collect();
        let candles = make_candles(&prices, &flat_volumes(60));
        let signals = strategy.analyze(&candles);
        assert!(!signals.is_empty());
        assert!(signals.iter().all(|s| s.signal_type.is_bullish()));
        for s in &signals {
            assert!(s.strength >= 0.0 && s.strength <= 1.0);
            assert!(s.indicators.contains_key("rsi"));
        }
    }

    #[test]
    fn test_trend_following_signal_times_match_candles() {
        let kind = StrategyKind::TrendFollowing {
            fast_ema: 3,
            slow_ema: 5,
            long_sma: 8,
            rsi_period: 5,
            rsi_overbought: 101.0,
            rsi_oversold: -1.0,
            volume_threshold: 0.0,
            min_trend_strength: 0.0,
        };
        let strategy = build_strategy(&kind);
        let prices: Vec<f64> = (0..60).map(|i| 100.0 + i as f64 * 2.0).collect();
        let candles = make_candles(&prices, &flat_volumes(60));
        let close_times: Vec<i64> = candles.iter().map(|c| c.close_time).collect();
        for s in strategy.analyze(&candles) {
            assert!(close_times.contains(&s.time));
        }
    }

    #[test]
    fn test_momentum_entry_and_exit() {
        let strategy = build_strategy(&StrategyKind::momentum_default());
        // +5% jump on 2x volume, then a -2% drop
        let prices = [100.0, 100.0, 100.0, 105.0, 102.9];
        let volumes = [100.0, 100.0, 100.0, 200.0, 100.0];
        let candles = make_candles(&prices, &volumes);
        let signals = strategy.analyze(&candles);
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].signal_type, SignalType::Buy);
        assert_eq!(signals[1].signal_type, SignalType::Sell);
        assert_eq!(signals[0].time, candles[3].close_time);
    }

    #[test]
    fn test_momentum_requires_volume_spike() {
        let strategy = build_strategy(&StrategyKind::momentum_default());
        // Same +5% jump without the volume spike
        let prices = [100.0, 100.0, 100.0, 105.0];
        let volumes = [100.0, 100.0, 100.0, 110.0];
        let candles = make_candles(&prices, &volumes);
        assert!(strategy.analyze(&candles).is_empty());
    }

    #[test]
    fn test_mean_reversion_dip_and_revert() {
        let kind = StrategyKind::MeanReversion {
            sma_period: 5,
            entry_deviation: 0.03,
        };
        let strategy = build_strategy(&kind);
        // Dip 4% below the 5-SMA, then revert above it
        let prices = [100.0, 100.0, 100.0, 100.0, 95.0, 101.0];
        let candles = make_candles(&prices, &flat_volumes(6));
        let signals = strategy.analyze(&candles);
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].signal_type, SignalType::Buy);
        assert_eq!(signals[1].signal_type, SignalType::Sell);
    }

    #[test]
    fn test_mean_reversion_flat_series_no_entry() {
        let strategy = build_strategy(&StrategyKind::mean_reversion_default());
        let candles = make_candles(&[100.0; 40], &flat_volumes(40));
        let signals = strategy.analyze(&candles);
        assert!(signals.iter().all(|s| s.signal_type != SignalType::Buy));
    }
}
