//! Batch technical indicators and series statistics
//!
//! All indicator functions take a full price series and return a shorter
//! output vector aligned to the right edge of the input: the first output
//! element corresponds to the first input index with a full lookback window.
//! Inputs shorter than the window produce an empty vector.

/// Simple moving average. Output length is `n - period + 1`.
pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(values.len() - period + 1);
    let mut sum: f64 = values[..period].iter().sum();
    out.push(sum / period as f64);

    for i in period..values.len() {
        sum += values[i] - values[i - period];
        out.push(sum / period as f64);
    }
    out
}

/// Exponential moving average seeded from the SMA of the first `period`
/// values, with multiplier 2 / (period + 1). Output length is `n - period + 1`.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len() - period + 1);
    let mut current: f64 = values[..period].iter().sum::<f64>() / period as f64;
    out.push(current);

    for &v in &values[period..] {
        current = (v - current) * multiplier + current;
        out.push(current);
    }
    out
}

/// Relative Strength Index with Wilder smoothing.
///
/// The first value is computed from plain averages of the first `period`
/// price changes; subsequent values use the Wilder recurrence
/// `avg = (avg * (period - 1) + change) / period`. When the average loss is
/// zero the RSI is 100. Output length is `n - period`.
pub fn rsi(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() <= period {
        return Vec::new();
    }

    let changes: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();

    let mut avg_gain: f64 = changes[..period].iter().filter(|&&c| c > 0.0).sum::<f64>()
        / period as f64;
    let mut avg_loss: f64 = changes[..period]
        .iter()
        .filter(|&&c| c < 0.0)
        .map(|c| c.abs())
        .sum::<f64>()
        / period as f64;

    let mut out = Vec::with_capacity(changes.len() - period + 1);
    out.push(rsi_value(avg_gain, avg_loss));

    for &change in &changes[period..] {
        let gain = if change > 0.0 { change } else { 0.0 };
        let loss = if change < 0.0 { -change } else { 0.0 };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        out.push(rsi_value(avg_gain, avg_loss));
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

/// Rolling sample standard deviation. Output length is `n - period + 1`.
pub fn rolling_std_dev(values: &[f64], period: usize) -> Vec<f64> {
    if period < 2 || values.len() < period {
        return Vec::new();
    }

    values
        .windows(period)
        .map(|w| {
            let m = w.iter().sum::<f64>() / period as f64;
            let var = w.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (period as f64 - 1.0);
            var.sqrt()
        })
        .collect()
}

/// Arithmetic mean, 0 for an empty slice
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1), 0 for fewer than two values
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() as f64 - 1.0);
    var.sqrt()
}

/// Period-over-period simple returns: `p[i] / p[i-1] - 1`
pub fn simple_returns(prices: &[f64]) -> Vec<f64> {
    prices
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect()
}

/// Sample covariance over the common prefix of the two series
pub fn covariance(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let ma = mean(&a[..n]);
    let mb = mean(&b[..n]);
    a[..n]
        .iter()
        .zip(&b[..n])
        .map(|(x, y)| (x - ma) * (y - mb))
        .sum::<f64>()
        / (n as f64 - 1.0)
}

/// Pearson correlation, 0 when either series has no variance
pub fn correlation(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let sa = std_dev(&a[..n]);
    let sb = std_dev(&b[..n]);
    if sa == 0.0 || sb == 0.0 {
        return 0.0;
    }
    covariance(a, b) / (sa * sb)
}

/// Pairwise sample covariance matrix over return series.
///
/// Series are truncated to the shortest length so the matrix stays
/// symmetric and positive semi-definite.
pub fn covariance_matrix(returns: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = returns.len();
    let mut matrix = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in i..n {
            let cov = covariance(&returns[i], &returns[j]);
            matrix[i][j] = cov;
            matrix[j][i] = cov;
        }
    }
    matrix
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    #[test]
    fn test_sma_basic() {
        let out = sma(&[1.0, 2.0, 3.0, 4.0, 5.0], 3);
        assert_eq!(out.len(), 3);
        assert_close(out[0], 2.0);
        assert_close(out[1], 3.0);
        assert_close(out[2], 4.0);
    }

    #[test]
    fn test_sma_short_input() {
        assert!(sma(&[1.0, 2.0], 3).is_empty());
        assert!(sma(&[], 3).is_empty());
    }

    #[test]
    fn test_ema_constant_series() {
        let out = ema(&[10.0, 10.0, 10.0, 10.0, 10.0], 3);
        assert_eq!(out, vec![10.0, 10.0, 10.0]);
    }

    #[test]
    fn test_ema_tracks_trend() {
        let out = ema(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 3);
        assert_eq!(out.len(), 4);
        assert_close(out[0], 2.0);
        // Rising series keeps EMA strictly increasing and below the price
        for w in out.windows(2) {
            assert!(w[1] > w[0]);
        }
        assert!(*out.last().unwrap() < 6.0);
    }

    #[test]
    fn test_rsi_monotonic_up_is_100() {
        let values: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let out = rsi(&values, 14);
        assert_eq!(out.len(), values.len() - 14);
        for v in out {
            assert_close(v, 100.0);
        }
    }

    #[test]
    fn test_rsi_monotonic_down_is_0() {
        let values: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        let out = rsi(&values, 14);
        for v in out {
            assert_close(v, 0.0);
        }
    }

    #[test]
    fn test_rsi_range_and_length() {
        let values = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            45.61, 46.28, 46.28, 46.00, 46.03, 46.41, 46.22, 45.64,
        ];
        let out = rsi(&values, 14);
        assert_eq!(out.len(), 6);
        for v in &out {
            assert!(*v >= 0.0 && *v <= 100.0);
        }
        // Classic Wilder worked example starts near 70
        assert!((out[0] - 70.46).abs() < 0.1);
    }

    #[test]
    fn test_rsi_insufficient_data() {
        assert!(rsi(&[1.0, 2.0, 3.0], 14).is_empty());
        assert!(rsi(&[1.0; 14], 14).is_empty());
    }

    #[test]
    fn test_rolling_std_dev_constant_is_zero() {
        let out = rolling_std_dev(&[5.0; 10], 4);
        assert_eq!(out.len(), 7);
        for v in out {
            assert_close(v, 0.0);
        }
    }

    #[test]
    fn test_std_dev_sample() {
        assert_close(std_dev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]), 2.138089935299395);
        assert_eq!(std_dev(&[1.0]), 0.0);
    }

    #[test]
    fn test_simple_returns() {
        let out = simple_returns(&[100.0, 110.0, 99.0]);
        assert_eq!(out.len(), 2);
        assert_close(out[0], 0.10);
        assert_close(out[1], -0.10);
    }

    #[test]
    fn test_covariance_of_self_is_variance() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0];
        let sd = std_dev(&a);
        assert_close(covariance(&a, &a), sd * sd);
    }

    #[test]
    fn test_correlation_bounds() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [2.0, 4.0, 6.0, 8.0];
        let c = [8.0, 6.0, 4.0, 2.0];
        assert_close(correlation(&a, &b), 1.0);
        assert_close(correlation(&a, &c), -1.0);
        assert_eq!(correlation(&a, &[5.0; 4]), 0.0);
    }

    #[test]
    fn test_covariance_matrix_symmetry() {
        let returns = vec![
            vec![0.01, -0.02, 0.03, 0.01],
            vec![0.02, 0.01, -0.01, 0.00],
            vec![-0.01, 0.02, 0.02, -0.03],
        ];
        let m = covariance_matrix(&returns);
        assert_eq!(m.len(), 3);
        for i in 0..3 {
            for j in 0..3 {
                assert_close(m[i][j], m[j][i]);
            }
            assert!(m[i][i] >= 0.0);
        }
    }
}
