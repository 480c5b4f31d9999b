//! Portfolio risk analysis
//!
//! Metrics are computed from daily price series per asset. Asset series are
//! truncated to the shortest common history so the covariance matrix and
//! the weighted portfolio return series stay aligned.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::indicators::{covariance, covariance_matrix, mean, simple_returns, std_dev};

/// Days used to de-annualize the risk-free rate
const DAYS_PER_YEAR: f64 = 365.0;

/// Tolerance when checking that weights sum to 1
const WEIGHT_SUM_TOLERANCE: f64 = 1e-4;

#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// VaR confidence level, e.g. 0.95
    pub confidence: f64,
    /// Annual risk-free rate, e.g. 0.02
    pub risk_free_rate: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            confidence: 0.95,
            risk_free_rate: 0.02,
        }
    }
}

/// Portfolio-level risk metrics, all in daily terms
#[derive(Debug, Clone, Serialize)]
pub struct RiskMetrics {
    pub expected_return: f64,
    pub volatility: f64,
    /// Historical-simulation VaR at the configured confidence,
    /// expressed as a positive loss fraction
    pub value_at_risk: f64,
    /// Worst peak-to-trough loss fraction of the weighted return series
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub downside_deviation: f64,
    pub beta_to_market: f64,
}

/// One asset's share of portfolio volatility
#[derive(Debug, Clone, Serialize)]
pub struct AssetRiskContribution {
    pub symbol: String,
    pub weight: f64,
    /// Absolute contribution to portfolio volatility
    pub risk_contribution: f64,
    /// Contribution as a percentage of total volatility
    pub percent_of_risk: f64,
}

/// Analyze a weighted portfolio against its price history.
///
/// `prices` maps symbol to daily closes; `weights` follows the map's
/// iteration order and must sum to 1. `market_prices` is the benchmark
/// series for beta.
pub fn analyze_portfolio_risk(
    prices: &BTreeMap<String, Vec<f64>>,
    weights: &[f64],
    market_prices: &[f64],
    config: &RiskConfig,
) -> EngineResult<RiskMetrics> {
    if weights.len() != prices.len() {
        return Err(EngineError::InvalidConfig(format!(
            "got {} weights for {} assets",
            weights.len(),
            prices.len()
        )));
    }
    let weight_sum: f64 = weights.iter().sum();
    if (weight_sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(EngineError::InvalidConfig(format!(
            "weights sum to {weight_sum}, expected 1"
        )));
    }

    let returns = asset_returns(prices)?;
    let matrix = covariance_matrix(&returns);
    let volatility = portfolio_volatility(weights, &matrix);
    let port_returns = weighted_returns(&returns, weights);

    let expected_return: f64 = weights
        .iter()
        .zip(&returns)
        .map(|(w, r)| w * mean(r))
        .sum();

    let daily_rf = config.risk_free_rate / DAYS_PER_YEAR;
    let sharpe_ratio = if volatility > 0.0 {
        (expected_return - daily_rf) / volatility
    } else {
        0.0
    };

    let downside = downside_deviation(&port_returns, daily_rf);
    let sortino_ratio = if downside > 0.0 {
        (expected_return - daily_rf) / downside
    } else {
        0.0
    };

    let market_returns = simple_returns(market_prices);

    let metrics = RiskMetrics {
        expected_return,
        volatility,
        value_at_risk: value_at_risk(&port_returns, config.confidence),
        max_drawdown: max_drawdown(&port_returns),
        sharpe_ratio,
        sortino_ratio,
        downside_deviation: downside,
        beta_to_market: beta(&port_returns, &market_returns),
    };

    debug!(
        assets = prices.len(),
        volatility = metrics.volatility,
        value_at_risk = metrics.value_at_risk,
        "portfolio risk computed"
    );

    Ok(metrics)
}

/// Per-asset return series in map order, truncated to the shortest history
pub fn asset_returns(prices: &BTreeMap<String, Vec<f64>>) -> EngineResult<Vec<Vec<f64>>> {
    let shortest = prices.values().map(Vec::len).min().unwrap_or(0);
    if shortest < 2 {
        return Err(EngineError::InsufficientData {
            required: 2,
            actual: shortest,
        });
    }

    Ok(prices
        .values()
        .map(|series| simple_returns(&series[..shortest]))
        .collect())
}

/// Portfolio volatility sqrt(w' * Cov * w)
pub fn portfolio_volatility(weights: &[f64], matrix: &[Vec<f64>]) -> f64 {
    let mut variance = 0.0;
    for (i, wi) in weights.iter().enumerate() {
        for (j, wj) in weights.iter().enumerate() {
            variance += wi * wj * matrix[i][j];
        }
    }
    variance.max(0.0).sqrt()
}

/// Weight-blended return series, truncated to the shortest asset history
pub fn weighted_returns(returns: &[Vec<f64>], weights: &[f64]) -> Vec<f64> {
    let shortest = returns.iter().map(Vec::len).min().unwrap_or(0);
    (0..shortest)
        .map(|t| {
            returns
                .iter()
                .zip(weights)
                .map(|(series, w)| series[t] * w)
                .sum()
        })
        .collect()
}

/// Historical-simulation VaR: the negated (1 - confidence) quantile of the
/// return distribution, so a 5% left-tail loss of -3% reports as 0.03.
pub fn value_at_risk(returns: &[f64], confidence: f64) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let mut sorted = returns.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let index = ((sorted.len() as f64) * (1.0 - confidence)).floor() as usize;
    -sorted[index.min(sorted.len() - 1)]
}

/// Worst peak-to-trough decline of the compounded return series, in [0, 1]
pub fn max_drawdown(returns: &[f64]) -> f64 {
    let mut value = 1.0;
    let mut peak = 1.0;
    let mut worst = 0.0;

    for r in returns {
        value *= 1.0 + r;
        if value > peak {
            peak = value;
        }
        let drawdown = (peak - value) / peak;
        if drawdown > worst {
            worst = drawdown;
        }
    }
    worst
}

/// Root mean square of shortfall below `threshold`, 0 when never below
pub fn downside_deviation(returns: &[f64], threshold: f64) -> f64 {
    let below: Vec<f64> = returns
        .iter()
        .filter(|r| **r < threshold)
        .map(|r| (r - threshold).powi(2))
        .collect();
    if below.is_empty() {
        return 0.0;
    }
    (below.iter().sum::<f64>() / below.len() as f64).sqrt()
}

/// Covariance with the market over market variance, 0 for a flat market
pub fn beta(portfolio_returns: &[f64], market_returns: &[f64]) -> f64 {
    let market_sd = std_dev(market_returns);
    let market_var = market_sd * market_sd;
    if market_var == 0.0 {
        return 0.0;
    }
    covariance(portfolio_returns, market_returns) / market_var
}

/// Decompose portfolio volatility into per-asset contributions,
/// sorted from largest to smallest.
pub fn risk_contributions(
    symbols: &[String],
    weights: &[f64],
    matrix: &[Vec<f64>],
) -> Vec<AssetRiskContribution> {
    let volatility = portfolio_volatility(weights, matrix);
    if volatility == 0.0 {
        return Vec::new();
    }

    let mut contributions: Vec<AssetRiskContribution> = symbols
        .iter()
        .zip(weights)
        .enumerate()
        .map(|(i, (symbol, weight))| {
            // Marginal contribution: (Cov * w)_i
            let marginal: f64 = weights
                .iter()
                .enumerate()
                .map(|(j, wj)| matrix[i][j] * wj)
                .sum();
            let contribution = weight * marginal / volatility;
            AssetRiskContribution {
                symbol: symbol.clone(),
                weight: *weight,
                risk_contribution: contribution,
                percent_of_risk: contribution / volatility * 100.0,
            }
        })
        .collect();

    contributions.sort_by(|a, b| {
        b.risk_contribution
            .partial_cmp(&a.risk_contribution)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    contributions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    fn sample_prices() -> BTreeMap<String, Vec<f64>> {
        let mut prices = BTreeMap::new();
        prices.insert(
            "AAA".to_string(),
            vec![100.0, 102.0, 101.0, 104.0, 103.0, 106.0],
        );
        prices.insert(
            "BBB".to_string(),
            vec![50.0, 49.0, 50.5, 50.0, 51.5, 51.0],
        );
        prices
    }

    #[test]
    fn test_single_asset_round_trip() {
        // A single fully-weighted asset must reproduce its own volatility
        // and Sharpe ratio
        let mut prices = BTreeMap::new();
        prices.insert(
            "AAA".to_string(),
            vec![100.0, 102.0, 101.0, 104.0, 103.0, 106.0],
        );
        let market = prices["AAA"].clone();
        let config = RiskConfig::default();

        let metrics = analyze_portfolio_risk(&prices, &[1.0], &market, &config).unwrap();

        let returns = simple_returns(&prices["AAA"]);
        let expected_vol = std_dev(&returns);
        assert_close(metrics.volatility, expected_vol);
        assert_close(
            metrics.sharpe_ratio,
            (mean(&returns) - config.risk_free_rate / 365.0) / expected_vol,
        );
        // A portfolio that is the market has beta 1
        assert_close(metrics.beta_to_market, 1.0);
    }

    #[test]
    fn test_weight_count_mismatch() {
        let prices = sample_prices();
        let market = prices["AAA"].clone();
        let err =
            analyze_portfolio_risk(&prices, &[1.0], &market, &RiskConfig::default()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let prices = sample_prices();
        let market = prices["AAA"].clone();
        let err = analyze_portfolio_risk(&prices, &[0.5, 0.3], &market, &RiskConfig::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn test_short_history_rejected() {
        let mut prices = BTreeMap::new();
        prices.insert("AAA".to_string(), vec![100.0]);
        let err = analyze_portfolio_risk(&prices, &[1.0], &[100.0], &RiskConfig::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientData { .. }));
    }

    #[test]
    fn test_value_at_risk_quantile() {
        let returns = vec![
            -0.05, -0.03, -0.01, 0.0, 0.005, 0.01, 0.015, 0.02, 0.03, 0.04,
        ];
        // 85% confidence over 10 observations picks index 1 of the sorted
        // series (-0.03) and negates it
        assert_close(value_at_risk(&returns, 0.85), 0.03);
        // 95% picks the single worst observation
        assert_close(value_at_risk(&returns, 0.95), 0.05);
        assert_eq!(value_at_risk(&[], 0.95), 0.0);
    }

    #[test]
    fn test_max_drawdown() {
        assert_close(max_drawdown(&[0.01, 0.02, 0.03]), 0.0);
        assert_close(max_drawdown(&[-0.5]), 0.5);
        // Up 10%, down 20%, partial recovery: trough is 0.88 from peak 1.1
        assert_close(max_drawdown(&[0.10, -0.20, 0.05]), 0.2);
    }

    #[test]
    fn test_downside_deviation_zero_when_never_below() {
        assert_eq!(downside_deviation(&[0.01, 0.02, 0.03], 0.0), 0.0);
        assert!(downside_deviation(&[-0.02, 0.01, -0.01], 0.0) > 0.0);
    }

    #[test]
    fn test_beta_of_market_is_one() {
        let market = vec![0.01, -0.02, 0.03, -0.01, 0.02];
        assert_close(beta(&market, &market), 1.0);
        assert_eq!(beta(&market, &[0.0; 5]), 0.0);
    }

    #[test]
    fn test_diversification_does_not_raise_volatility() {
        let prices = sample_prices();
        let returns = asset_returns(&prices).unwrap();
        let matrix = covariance_matrix(&returns);

        let blended = portfolio_volatility(&[0.5, 0.5], &matrix);
        let vol_a = std_dev(&returns[0]);
        let vol_b = std_dev(&returns[1]);
        assert!(blended <= 0.5 * vol_a + 0.5 * vol_b + 1e-12);
    }

    #[test]
    fn test_risk_contributions_sum_to_volatility() {
        let prices = sample_prices();
        let symbols: Vec<String> = prices.keys().cloned().collect();
        let returns = asset_returns(&prices).unwrap();
        let matrix = covariance_matrix(&returns);
        let weights = [0.6, 0.4];

        let contributions = risk_contributions(&symbols, &weights, &matrix);
        assert_eq!(contributions.len(), 2);

        let total: f64 = contributions.iter().map(|c| c.risk_contribution).sum();
        assert_close(total, portfolio_volatility(&weights, &matrix));

        let pct: f64 = contributions.iter().map(|c| c.percent_of_risk).sum();
        assert_close(pct, 100.0);

        // Sorted descending
        assert!(contributions[0].risk_contribution >= contributions[1].risk_contribution);
    }
}
