//! Portfolio construction: Monte Carlo weight search and risk parity
//!
//! The Monte Carlo search draws bounded random weight vectors and keeps the
//! best by the chosen objective. Callers inject the RNG, so a seeded
//! `StdRng` makes runs reproducible.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::indicators::{covariance_matrix, mean, std_dev};
use crate::risk::{asset_returns, portfolio_volatility};

/// Iteration cap for the weight redistribution loop
const MAX_REDISTRIBUTE_PASSES: usize = 100;

const EPS: f64 = 1e-9;

const DAYS_PER_YEAR: f64 = 365.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerParams {
    /// Number of random weight vectors to evaluate
    pub simulations: usize,
    pub min_weight: f64,
    pub max_weight: f64,
    /// Annual risk-free rate used in the Sharpe objective
    pub risk_free_rate: f64,
}

impl Default for OptimizerParams {
    fn default() -> Self {
        Self {
            simulations: 10_000,
            min_weight: 0.05,
            max_weight: 0.40,
            risk_free_rate: 0.02,
        }
    }
}

/// An allocation with its in-sample statistics (daily terms)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub symbols: Vec<String>,
    pub weights: Vec<f64>,
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
}

/// Market regime used to pick an optimization objective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketTrend {
    Uptrend,
    Downtrend,
    Sideways,
}

#[derive(Clone, Copy)]
enum Objective {
    MaxSharpe,
    MinVariance,
}

/// Maximize the Sharpe ratio over random bounded allocations
pub fn optimize_max_sharpe(
    prices: &BTreeMap<String, Vec<f64>>,
    params: &OptimizerParams,
    rng: &mut impl Rng,
) -> EngineResult<OptimizationResult> {
    monte_carlo(prices, params, Objective::MaxSharpe, rng)
}

/// Minimize portfolio volatility over random bounded allocations
pub fn optimize_min_variance(
    prices: &BTreeMap<String, Vec<f64>>,
    params: &OptimizerParams,
    rng: &mut impl Rng,
) -> EngineResult<OptimizationResult> {
    monte_carlo(prices, params, Objective::MinVariance, rng)
}

/// Pick an objective for the prevailing market regime: chase Sharpe in an
/// uptrend with looser caps, hide in minimum variance with tight caps in a
/// downtrend, and fall back to risk parity when the market is drifting.
pub fn optimize_for_trend(
    prices: &BTreeMap<String, Vec<f64>>,
    params: &OptimizerParams,
    trend: MarketTrend,
    rng: &mut impl Rng,
) -> EngineResult<OptimizationResult> {
    match trend {
        MarketTrend::Uptrend => {
            let params = OptimizerParams {
                max_weight: 0.40,
                ..params.clone()
            };
            monte_carlo(prices, &params, Objective::MaxSharpe, rng)
        }
        MarketTrend::Downtrend => {
            let params = OptimizerParams {
                max_weight: 0.20,
                ..params.clone()
            };
            monte_carlo(prices, &params, Objective::MinVariance, rng)
        }
        MarketTrend::Sideways => risk_parity(prices, params.risk_free_rate),
    }
}

fn monte_carlo(
    prices: &BTreeMap<String, Vec<f64>>,
    params: &OptimizerParams,
    objective: Objective,
    rng: &mut impl Rng,
) -> EngineResult<OptimizationResult> {
    let n = prices.len();
    validate_bounds(n, params.min_weight, params.max_weight)?;
    if params.simulations == 0 {
        return Err(EngineError::InvalidConfig(
            "simulations must be positive".to_string(),
        ));
    }

    let symbols: Vec<String> = prices.keys().cloned().collect();
    let returns = asset_returns(prices)?;
    let matrix = covariance_matrix(&returns);
    let means: Vec<f64> = returns.iter().map(|r| mean(r)).collect();
    let daily_rf = params.risk_free_rate / DAYS_PER_YEAR;

    info!(
        assets = n,
        simulations = params.simulations,
        "starting portfolio optimization"
    );

    let mut best: Option<(f64, Vec<f64>, f64, f64)> = None;

    for _ in 0..params.simulations {
        let weights = random_weights(n, params.min_weight, params.max_weight, rng);
        let expected: f64 = weights.iter().zip(&means).map(|(w, m)| w * m).sum();
        let volatility = portfolio_volatility(&weights, &matrix);
        if volatility <= 0.0 {
            continue;
        }
        let sharpe = (expected - daily_rf) / volatility;

        let score = match objective {
            Objective::MaxSharpe => sharpe,
            Objective::MinVariance => -volatility,
        };

        if best.as_ref().map_or(true, |(s, ..)| score > *s) {
            best = Some((score, weights, expected, volatility));
        }
    }

    let (_, weights, expected_return, volatility) = best.ok_or_else(|| {
        EngineError::InvalidConfig("no portfolio with positive volatility found".to_string())
    })?;

    let sharpe_ratio = (expected_return - daily_rf) / volatility;
    debug!(sharpe = sharpe_ratio, volatility, "optimization complete");

    Ok(OptimizationResult {
        symbols,
        weights,
        expected_return,
        volatility,
        sharpe_ratio,
    })
}

/// Allocate inversely proportional to each asset's volatility
pub fn risk_parity(
    prices: &BTreeMap<String, Vec<f64>>,
    risk_free_rate: f64,
) -> EngineResult<OptimizationResult> {
    let symbols: Vec<String> = prices.keys().cloned().collect();
    let returns = asset_returns(prices)?;
    let vols: Vec<f64> = returns.iter().map(|r| std_dev(r)).collect();
    if vols.iter().any(|v| *v <= 0.0) {
        return Err(EngineError::InvalidConfig(
            "risk parity requires every asset to have positive volatility".to_string(),
        ));
    }

    let weights = inverse_volatility_weights(&vols);

    let matrix = covariance_matrix(&returns);
    let expected_return: f64 = weights
        .iter()
        .zip(&returns)
        .map(|(w, r)| w * mean(r))
        .sum();
    let volatility = portfolio_volatility(&weights, &matrix);
    let daily_rf = risk_free_rate / DAYS_PER_YEAR;
    let sharpe_ratio = if volatility > 0.0 {
        (expected_return - daily_rf) / volatility
    } else {
        0.0
    };

    Ok(OptimizationResult {
        symbols,
        weights,
        expected_return,
        volatility,
        sharpe_ratio,
    })
}

/// Normalized 1/vol weights. Callers must ensure every vol is positive.
pub fn inverse_volatility_weights(vols: &[f64]) -> Vec<f64> {
    let inverse: Vec<f64> = vols.iter().map(|v| 1.0 / v).collect();
    let total: f64 = inverse.iter().sum();
    inverse.into_iter().map(|v| v / total).collect()
}

/// Draw a random weight vector summing to 1 with each weight in
/// `[min, max]`.
///
/// Uniform draws are normalized, then excess above the cap is pushed onto
/// assets with headroom and shortfall below the floor is pulled from assets
/// with surplus. The redistribution loop is capped; if bounds are still
/// violated after the cap the uniform allocation is returned.
pub fn random_weights(n: usize, min: f64, max: f64, rng: &mut impl Rng) -> Vec<f64> {
    let uniform = 1.0 / n as f64;

    let mut weights: Vec<f64> = (0..n).map(|_| rng.gen::<f64>()).collect();
    let sum: f64 = weights.iter().sum();
    if sum <= EPS {
        return vec![uniform; n];
    }
    for w in weights.iter_mut() {
        *w /= sum;
    }

    for _ in 0..MAX_REDISTRIBUTE_PASSES {
        if !redistribute_pass(&mut weights, min, max) {
            break;
        }
    }

    let in_bounds = weights.iter().all(|w| *w >= min - EPS && *w <= max + EPS);
    if in_bounds {
        weights
    } else {
        vec![uniform; n]
    }
}

/// One redistribution pass; returns whether anything moved
fn redistribute_pass(weights: &mut [f64], min: f64, max: f64) -> bool {
    let mut adjusted = false;

    let excess: f64 = weights.iter().map(|w| (w - max).max(0.0)).sum();
    if excess > EPS {
        for w in weights.iter_mut() {
            if *w > max {
                *w = max;
            }
        }
        let headroom: f64 = weights.iter().map(|w| (max - *w).max(0.0)).sum();
        if headroom > EPS {
            for w in weights.iter_mut() {
                *w += excess * (max - *w).max(0.0) / headroom;
            }
        }
        adjusted = true;
    }

    let shortfall: f64 = weights.iter().map(|w| (min - *w).max(0.0)).sum();
    if shortfall > EPS {
        for w in weights.iter_mut() {
            if *w < min {
                *w = min;
            }
        }
        let surplus: f64 = weights.iter().map(|w| (*w - min).max(0.0)).sum();
        if surplus > EPS {
            for w in weights.iter_mut() {
                *w -= shortfall * (*w - min).max(0.0) / surplus;
            }
        }
        adjusted = true;
    }

    adjusted
}

fn validate_bounds(n: usize, min: f64, max: f64) -> EngineResult<()> {
    if n == 0 {
        return Err(EngineError::InsufficientData {
            required: 1,
            actual: 0,
        });
    }
    if min < 0.0 || max <= 0.0 || min > max {
        return Err(EngineError::InvalidConfig(format!(
            "weight bounds [{min}, {max}] are not a valid range"
        )));
    }
    // The bounds must admit some vector summing to 1
    if min * n as f64 > 1.0 + EPS || max * (n as f64) < 1.0 - EPS {
        return Err(EngineError::InvalidConfig(format!(
            "weight bounds [{min}, {max}] are infeasible for {n} assets"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    fn sample_prices() -> BTreeMap<String, Vec<f64>> {
        let mut prices = BTreeMap::new();
        prices.insert(
            "AAA".to_string(),
            vec![100.0, 102.0, 101.0, 104.0, 103.0, 106.0, 105.0, 108.0],
        );
        prices.insert(
            "BBB".to_string(),
            vec![50.0, 49.0, 50.5, 50.0, 51.5, 51.0, 52.0, 51.5],
        );
        prices.insert(
            "CCC".to_string(),
            vec![10.0, 10.2, 10.1, 10.4, 10.2, 10.5, 10.4, 10.6],
        );
        prices
    }

    #[test]
    fn test_random_weights_sum_and_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..500 {
            let weights = random_weights(5, 0.05, 0.40, &mut rng);
            let sum: f64 = weights.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6, "sum {sum}");
            for w in &weights {
                assert!(*w >= 0.05 - 1e-6 && *w <= 0.40 + 1e-6, "weight {w}");
            }
        }
    }

    #[test]
    fn test_random_weights_single_asset() {
        let mut rng = StdRng::seed_from_u64(1);
        let weights = random_weights(1, 0.0, 1.0, &mut rng);
        assert_eq!(weights.len(), 1);
        assert_close(weights[0], 1.0);
    }

    #[test]
    fn test_infeasible_bounds_rejected() {
        let prices = sample_prices();
        let mut rng = StdRng::seed_from_u64(7);

        // min 0.6 over 3 assets needs a sum of at least 1.8
        let params = OptimizerParams {
            min_weight: 0.6,
            ..Default::default()
        };
        let err = optimize_max_sharpe(&prices, &params, &mut rng).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));

        // max 0.2 over 3 assets cannot reach a sum of 1
        let params = OptimizerParams {
            min_weight: 0.0,
            max_weight: 0.2,
            ..Default::default()
        };
        let err = optimize_max_sharpe(&prices, &params, &mut rng).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn test_optimizer_is_seed_deterministic() {
        let prices = sample_prices();
        let params = OptimizerParams {
            simulations: 200,
            ..Default::default()
        };

        let a = optimize_max_sharpe(&prices, &params, &mut StdRng::seed_from_u64(42)).unwrap();
        let b = optimize_max_sharpe(&prices, &params, &mut StdRng::seed_from_u64(42)).unwrap();
        assert_eq!(a.weights, b.weights);
        assert_eq!(a.sharpe_ratio, b.sharpe_ratio);
    }

    #[test]
    fn test_optimizer_result_respects_bounds() {
        let prices = sample_prices();
        let params = OptimizerParams {
            simulations: 500,
            ..Default::default()
        };
        let result =
            optimize_max_sharpe(&prices, &params, &mut StdRng::seed_from_u64(3)).unwrap();

        assert_eq!(result.symbols, vec!["AAA", "BBB", "CCC"]);
        let sum: f64 = result.weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        for w in &result.weights {
            assert!(*w >= params.min_weight - 1e-6 && *w <= params.max_weight + 1e-6);
        }
        assert!(result.volatility > 0.0);
        assert!(result.sharpe_ratio.is_finite());
    }

    #[test]
    fn test_min_variance_is_not_more_volatile_than_max_sharpe() {
        let prices = sample_prices();
        let params = OptimizerParams {
            simulations: 2_000,
            ..Default::default()
        };

        let sharpe =
            optimize_max_sharpe(&prices, &params, &mut StdRng::seed_from_u64(9)).unwrap();
        let min_var =
            optimize_min_variance(&prices, &params, &mut StdRng::seed_from_u64(9)).unwrap();
        assert!(min_var.volatility <= sharpe.volatility + 1e-12);
    }

    #[test]
    fn test_inverse_volatility_weights() {
        // vol 0.1 vs 0.2 splits two thirds / one third
        let weights = inverse_volatility_weights(&[0.1, 0.2]);
        assert_close(weights[0], 2.0 / 3.0);
        assert_close(weights[1], 1.0 / 3.0);
    }

    #[test]
    fn test_risk_parity_weights_inverse_to_volatility() {
        let prices = sample_prices();
        let result = risk_parity(&prices, 0.02).unwrap();

        let sum: f64 = result.weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);

        // Higher-volatility assets get smaller weights
        let returns = asset_returns(&prices).unwrap();
        let vols: Vec<f64> = returns.iter().map(|r| std_dev(r)).collect();
        for i in 0..vols.len() {
            for j in 0..vols.len() {
                if vols[i] > vols[j] {
                    assert!(result.weights[i] < result.weights[j]);
                }
            }
        }
    }

    #[test]
    fn test_risk_parity_rejects_flat_asset() {
        let mut prices = sample_prices();
        prices.insert("FLAT".to_string(), vec![10.0; 8]);
        let err = risk_parity(&prices, 0.02).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn test_trend_dispatch_caps_downtrend_exposure() {
        // Five assets, so a 0.20 cap per asset is still feasible
        let mut prices = sample_prices();
        prices.insert(
            "DDD".to_string(),
            vec![20.0, 20.4, 20.1, 20.8, 20.5, 21.0, 20.9, 21.2],
        );
        prices.insert(
            "EEE".to_string(),
            vec![5.0, 5.1, 5.05, 5.2, 5.1, 5.25, 5.2, 5.3],
        );
        let params = OptimizerParams {
            simulations: 500,
            min_weight: 0.0,
            ..Default::default()
        };
        let result = optimize_for_trend(
            &prices,
            &params,
            MarketTrend::Downtrend,
            &mut StdRng::seed_from_u64(11),
        )
        .unwrap();

        for w in &result.weights {
            assert!(*w <= 0.20 + 1e-6);
        }
    }

    #[test]
    fn test_trend_dispatch_sideways_is_risk_parity() {
        let prices = sample_prices();
        let params = OptimizerParams::default();
        let dispatched = optimize_for_trend(
            &prices,
            &params,
            MarketTrend::Sideways,
            &mut StdRng::seed_from_u64(5),
        )
        .unwrap();
        let direct = risk_parity(&prices, params.risk_free_rate).unwrap();
        assert_eq!(dispatched.weights, direct.weights);
    }
}
