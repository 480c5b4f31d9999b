//! Parameter search over strategy configurations
//!
//! Expands named `[min, max, step]` ranges into a Cartesian grid, backtests
//! every combination, and ranks candidates by pairwise winner-take-all
//! comparison: 40% total return, 30% Sharpe, 15% lower drawdown, 15% win
//! rate, with ties on a criterion scoring for the incumbent. The runner is
//! async and reports through a shared progress handle.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, RwLock,
};
use tracing::{info, warn};

use crate::backtest::BacktestEngine;
use crate::error::{EngineError, EngineResult};
use crate::strategy::{build_strategy, StrategyKind};
use crate::types::{to_decimal, BacktestResult, Candle, StrategyParams};

/// Hard cap on the expanded grid size
pub const MAX_COMBINATIONS: usize = 20_000;

/// Inclusive numeric range with a step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

/// A ranked search result with its parameter overrides
#[derive(Debug, Clone, Serialize)]
pub struct SearchCandidate {
    pub rank: usize,
    pub params: serde_json::Value,
    pub total_return_pct: Decimal,
    pub annualized_return_pct: Decimal,
    pub sharpe_ratio: Decimal,
    pub max_drawdown_pct: Decimal,
    pub win_rate: Decimal,
    pub profit_factor: Decimal,
    pub total_trades: u32,
    pub final_capital: Decimal,
}

/// Search run status
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    Idle,
    Running,
    Complete,
    Error,
}

/// Shared progress tracker between caller and background task
pub struct SearchProgress {
    pub status: RwLock<SearchStatus>,
    pub total_combinations: AtomicU32,
    pub completed: AtomicU32,
    pub cancelled: AtomicBool,
    pub results: RwLock<Vec<SearchCandidate>>,
    pub error_message: RwLock<Option<String>>,
}

impl SearchProgress {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(SearchStatus::Idle),
            total_combinations: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            results: RwLock::new(Vec::new()),
            error_message: RwLock::new(None),
        }
    }

    /// Reset for a new run
    pub fn reset(&self) {
        *self.status.write().unwrap() = SearchStatus::Running;
        self.total_combinations.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Relaxed);
        *self.results.write().unwrap() = Vec::new();
        *self.error_message.write().unwrap() = None;
    }

    /// Get progress as percentage
    pub fn progress_pct(&self) -> f32 {
        let total = self.total_combinations.load(Ordering::Relaxed);
        let done = self.completed.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            (done as f32 / total as f32) * 100.0
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.status.read().unwrap(), SearchStatus::Running)
    }

    fn fail(&self, error: EngineError) {
        *self.error_message.write().unwrap() = Some(error.to_string());
        *self.status.write().unwrap() = SearchStatus::Error;
    }
}

impl Default for SearchProgress {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Grid Generation
// ============================================================================

/// Expand named ranges into the full Cartesian product of assignments.
///
/// An empty range map yields a single empty assignment (one run with the
/// base configuration). Grids larger than `MAX_COMBINATIONS` are rejected.
pub fn generate_grid(
    ranges: &BTreeMap<String, ParamRange>,
) -> EngineResult<Vec<BTreeMap<String, f64>>> {
    let mut combos: Vec<BTreeMap<String, f64>> = vec![BTreeMap::new()];

    for (name, range) in ranges {
        let values = expand_range(name, range)?;

        let mut next = Vec::with_capacity(combos.len() * values.len());
        for combo in &combos {
            for &value in &values {
                let mut assignment = combo.clone();
                assignment.insert(name.clone(), value);
                next.push(assignment);
            }
        }
        combos = next;

        if combos.len() > MAX_COMBINATIONS {
            return Err(EngineError::InvalidConfig(format!(
                "parameter grid exceeds {MAX_COMBINATIONS} combinations"
            )));
        }
    }

    Ok(combos)
}

fn expand_range(name: &str, range: &ParamRange) -> EngineResult<Vec<f64>> {
    if range.step <= 0.0 {
        return Err(EngineError::InvalidConfig(format!(
            "range '{name}' has non-positive step {}",
            range.step
        )));
    }
    if range.min > range.max {
        return Err(EngineError::InvalidConfig(format!(
            "range '{name}' has min {} above max {}",
            range.min, range.max
        )));
    }

    let mut values = Vec::new();
    let mut v = range.min;
    while v <= range.max + 1e-9 {
        values.push(v);
        v += range.step;
    }
    Ok(values)
}

/// Apply named overrides to a strategy kind and its shared parameters
pub fn apply_assignment(
    kind: &StrategyKind,
    params: &StrategyParams,
    assignment: &BTreeMap<String, f64>,
) -> EngineResult<(StrategyKind, StrategyParams)> {
    let mut kind = kind.clone();
    let mut params = params.clone();

    for (name, &value) in assignment {
        if apply_shared(&mut params, name, value) {
            continue;
        }
        if !apply_strategy(&mut kind, name, value) {
            return Err(EngineError::InvalidConfig(format!(
                "unknown parameter '{name}' for this strategy"
            )));
        }
    }

    Ok((kind, params))
}

fn apply_shared(params: &mut StrategyParams, name: &str, value: f64) -> bool {
    match name {
        "position_size" => params.position_size = to_decimal(value),
        "risk_per_trade" => params.risk_per_trade = to_decimal(value),
        "stop_loss_pct" => params.stop_loss_pct = to_decimal(value),
        "risk_reward_ratio" => params.risk_reward_ratio = to_decimal(value),
        "trailing_activation_pct" => params.trailing_activation_pct = to_decimal(value),
        "trailing_distance_pct" => params.trailing_distance_pct = to_decimal(value),
        "leverage" => params.leverage = to_decimal(value),
        _ => return false,
    }
    true
}

fn apply_strategy(kind: &mut StrategyKind, name: &str, value: f64) -> bool {
    let period = || (value.round() as usize).max(1);

    match kind {
        StrategyKind::TrendFollowing {
            fast_ema,
            slow_ema,
            long_sma,
            rsi_period,
            rsi_overbought,
            rsi_oversold,
            volume_threshold,
            min_trend_strength,
        } => match name {
            "fast_ema" => *fast_ema = period(),
            "slow_ema" => *slow_ema = period(),
            "long_sma" => *long_sma = period(),
            "rsi_period" => *rsi_period = period(),
            "rsi_overbought" => *rsi_overbought = value,
            "rsi_oversold" => *rsi_oversold = value,
            "volume_threshold" => *volume_threshold = value,
            "min_trend_strength" => *min_trend_strength = value,
            _ => return false,
        },
        StrategyKind::Momentum {
            entry_change,
            exit_change,
            volume_ratio,
        } => match name {
            "entry_change" => *entry_change = value,
            "exit_change" => *exit_change = value,
            "volume_ratio" => *volume_ratio = value,
            _ => return false,
        },
        StrategyKind::MeanReversion {
            sma_period,
            entry_deviation,
        } => match name {
            "sma_period" => *sma_period = period(),
            "entry_deviation" => *entry_deviation = value,
            _ => return false,
        },
    }
    true
}

// ============================================================================
// Scoring
// ============================================================================

/// Pairwise winner-take-all scores for two result summaries.
/// A tied criterion scores for `b`, the incumbent.
fn pairwise_scores(
    a: (Decimal, Decimal, Decimal, Decimal),
    b: (Decimal, Decimal, Decimal, Decimal),
) -> (f64, f64) {
    let (a_ret, a_sharpe, a_dd, a_win) = a;
    let (b_ret, b_sharpe, b_dd, b_win) = b;
    let mut score_a = 0.0;
    let mut score_b = 0.0;

    if a_ret > b_ret {
        score_a += 0.40;
    } else {
        score_b += 0.40;
    }
    if a_sharpe > b_sharpe {
        score_a += 0.30;
    } else {
        score_b += 0.30;
    }
    if a_dd < b_dd {
        score_a += 0.15;
    } else {
        score_b += 0.15;
    }
    if a_win > b_win {
        score_a += 0.15;
    } else {
        score_b += 0.15;
    }

    (score_a, score_b)
}

/// Whether result `a` beats result `b` under the composite comparison
pub fn is_better(a: &BacktestResult, b: &BacktestResult) -> bool {
    let (score_a, score_b) = pairwise_scores(
        (a.total_return_pct, a.sharpe_ratio, a.max_drawdown_pct, a.win_rate),
        (b.total_return_pct, b.sharpe_ratio, b.max_drawdown_pct, b.win_rate),
    );
    score_a > score_b
}

fn candidate_wins(a: &SearchCandidate, b: &SearchCandidate) -> bool {
    let (score_a, score_b) = pairwise_scores(
        (a.total_return_pct, a.sharpe_ratio, a.max_drawdown_pct, a.win_rate),
        (b.total_return_pct, b.sharpe_ratio, b.max_drawdown_pct, b.win_rate),
    );
    score_a > score_b
}

// ============================================================================
// Search Runner
// ============================================================================

/// Run the full parameter search over the expanded grid.
///
/// Results, progress, and failures are reported through `progress`.
pub async fn run_search(
    kind: StrategyKind,
    params: StrategyParams,
    candles: Vec<Candle>,
    ranges: BTreeMap<String, ParamRange>,
    top_n: usize,
    progress: Arc<SearchProgress>,
) {
    let grid = match generate_grid(&ranges) {
        Ok(grid) => grid,
        Err(e) => {
            progress.fail(e);
            return;
        }
    };

    progress
        .total_combinations
        .store(grid.len() as u32, Ordering::Relaxed);

    info!(
        combinations = grid.len(),
        candles = candles.len(),
        "starting parameter search"
    );

    let mut evaluated: Vec<SearchCandidate> = Vec::with_capacity(grid.len());

    for (i, assignment) in grid.iter().enumerate() {
        if progress.cancelled.load(Ordering::Relaxed) {
            warn!("parameter search cancelled");
            break;
        }

        let (combo_kind, combo_params) = match apply_assignment(&kind, &params, assignment) {
            Ok(applied) => applied,
            Err(e) => {
                progress.fail(e);
                return;
            }
        };

        let strategy = build_strategy(&combo_kind);
        let result = match BacktestEngine::run(&combo_params, strategy.as_ref(), &candles) {
            Ok(result) => result,
            Err(e) => {
                progress.fail(e);
                return;
            }
        };

        evaluated.push(SearchCandidate {
            rank: 0,
            params: serde_json::to_value(assignment).unwrap_or_default(),
            total_return_pct: result.total_return_pct,
            annualized_return_pct: result.annualized_return_pct,
            sharpe_ratio: result.sharpe_ratio,
            max_drawdown_pct: result.max_drawdown_pct,
            win_rate: result.win_rate,
            profit_factor: result.profit_factor,
            total_trades: result.total_trades,
            final_capital: result.final_capital,
        });

        progress.completed.store((i + 1) as u32, Ordering::Relaxed);

        // Yield to runtime every 10 iterations
        if i % 10 == 0 {
            tokio::task::yield_now().await;
        }
    }

    finalize_results(evaluated, top_n, &progress);
}

/// Repeatedly extract the pairwise winner until `top_n` are ranked
fn finalize_results(
    mut evaluated: Vec<SearchCandidate>,
    top_n: usize,
    progress: &Arc<SearchProgress>,
) {
    let mut ranked: Vec<SearchCandidate> = Vec::with_capacity(top_n.min(evaluated.len()));

    while !evaluated.is_empty() && ranked.len() < top_n {
        let mut best = 0;
        for i in 1..evaluated.len() {
            if candidate_wins(&evaluated[i], &evaluated[best]) {
                best = i;
            }
        }
        let mut candidate = evaluated.swap_remove(best);
        candidate.rank = ranked.len() + 1;
        ranked.push(candidate);
    }

    if let Some(best) = ranked.first() {
        info!(
            rank = 1,
            total_return_pct = %best.total_return_pct,
            sharpe = %best.sharpe_ratio,
            trades = best.total_trades,
            "best configuration found"
        );
    }

    *progress.results.write().unwrap() = ranked;
    *progress.status.write().unwrap() = SearchStatus::Complete;

    info!("parameter search complete");
}
