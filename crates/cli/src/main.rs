//! Backtest Lab — strategy backtesting and portfolio analysis from the CLI
//!
//! Usage:
//!   backtest-lab backtest --data candles.json --config strategy.json
//!   backtest-lab search --data candles.json --config strategy.json --ranges ranges.json
//!   backtest-lab risk --prices prices.json --weights 0.5,0.3,0.2 --market BTCUSDT
//!   backtest-lab optimize --prices prices.json --seed 42

use clap::{Parser, Subcommand};
use engine::portfolio::{self, MarketTrend, OptimizerParams};
use engine::risk::{self, RiskConfig};
use engine::search::{run_search, ParamRange, SearchCandidate, SearchProgress, SearchStatus};
use engine::strategy::StrategyKind;
use engine::types::{BacktestResult, Candle, StrategyParams};
use engine::BacktestEngine;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "backtest-lab")]
#[command(about = "Strategy backtesting and portfolio analysis toolkit", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single backtest over a candle file
    Backtest {
        /// Candle series (JSON array of OHLCV candles)
        #[arg(long)]
        data: PathBuf,
        /// Strategy configuration (JSON: strategy kind + parameters)
        #[arg(long)]
        config: PathBuf,
        /// Optional JSON export path for the full result
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Grid-search strategy parameters over a candle file
    Search {
        /// Candle series (JSON array of OHLCV candles)
        #[arg(long)]
        data: PathBuf,
        /// Base strategy configuration (JSON)
        #[arg(long)]
        config: PathBuf,
        /// Parameter ranges (JSON map of name -> {min, max, step})
        #[arg(long)]
        ranges: PathBuf,
        /// Number of top results to keep
        #[arg(long, default_value_t = 10)]
        top_n: usize,
        /// Optional JSON export path
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Analyze the risk of a weighted portfolio
    Risk {
        /// Price history (JSON map of symbol -> daily closes)
        #[arg(long)]
        prices: PathBuf,
        /// Weights in symbol order (comma-separated, must sum to 1)
        #[arg(long, value_delimiter = ',')]
        weights: Vec<f64>,
        /// Symbol to use as the market benchmark for beta
        #[arg(long)]
        market: String,
        /// VaR confidence level
        #[arg(long, default_value_t = 0.95)]
        confidence: f64,
        /// Annual risk-free rate
        #[arg(long, default_value_t = 0.02)]
        risk_free_rate: f64,
    },
    /// Monte Carlo portfolio optimization
    Optimize {
        /// Price history (JSON map of symbol -> daily closes)
        #[arg(long)]
        prices: PathBuf,
        /// Number of random allocations to evaluate
        #[arg(long, default_value_t = 10_000)]
        simulations: usize,
        #[arg(long, default_value_t = 0.05)]
        min_weight: f64,
        #[arg(long, default_value_t = 0.40)]
        max_weight: f64,
        /// Annual risk-free rate
        #[arg(long, default_value_t = 0.02)]
        risk_free_rate: f64,
        /// Market regime: uptrend, downtrend, sideways
        #[arg(long)]
        trend: Option<String>,
        /// RNG seed for reproducible runs
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Inverse-volatility (risk parity) allocation
    RiskParity {
        /// Price history (JSON map of symbol -> daily closes)
        #[arg(long)]
        prices: PathBuf,
        /// Annual risk-free rate
        #[arg(long, default_value_t = 0.02)]
        risk_free_rate: f64,
    },
}

/// Strategy kind plus shared simulation parameters, as stored in a config file
#[derive(Deserialize)]
struct BacktestConfig {
    strategy: StrategyKind,
    #[serde(default)]
    params: StrategyParams,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,backtest_lab=debug")
    } else {
        EnvFilter::new("info,engine=info,backtest_lab=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

fn load_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
    serde_json::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse {}: {}", path.display(), e))
}

fn parse_trend(s: &str) -> anyhow::Result<MarketTrend> {
    match s.to_lowercase().as_str() {
        "uptrend" => Ok(MarketTrend::Uptrend),
        "downtrend" => Ok(MarketTrend::Downtrend),
        "sideways" => Ok(MarketTrend::Sideways),
        other => anyhow::bail!("unknown trend '{other}' (expected uptrend, downtrend, sideways)"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    match cli.command {
        Commands::Backtest {
            data,
            config,
            export,
        } => cmd_backtest(&data, &config, export.as_deref())?,
        Commands::Search {
            data,
            config,
            ranges,
            top_n,
            export,
        } => cmd_search(&data, &config, &ranges, top_n, export.as_deref()).await?,
        Commands::Risk {
            prices,
            weights,
            market,
            confidence,
            risk_free_rate,
        } => cmd_risk(&prices, &weights, &market, confidence, risk_free_rate)?,
        Commands::Optimize {
            prices,
            simulations,
            min_weight,
            max_weight,
            risk_free_rate,
            trend,
            seed,
        } => cmd_optimize(
            &prices,
            OptimizerParams {
                simulations,
                min_weight,
                max_weight,
                risk_free_rate,
            },
            trend.as_deref(),
            seed,
        )?,
        Commands::RiskParity {
            prices,
            risk_free_rate,
        } => cmd_risk_parity(&prices, risk_free_rate)?,
    }

    Ok(())
}

// ============================================================================
// Backtest command
// ============================================================================

fn cmd_backtest(data: &Path, config: &Path, export: Option<&Path>) -> anyhow::Result<()> {
    let candles: Vec<Candle> = load_json(data)?;
    let config_file: BacktestConfig = load_json(config)?;

    let strategy = engine::build_strategy(&config_file.strategy);
    let result = BacktestEngine::run(&config_file.params, strategy.as_ref(), &candles)?;

    print_backtest_summary(&result);

    if let Some(path) = export {
        let json = serde_json::to_string_pretty(&result)?;
        std::fs::write(path, &json)?;
        println!("\nResult exported to {}", path.display());
    }

    Ok(())
}

fn print_backtest_summary(result: &BacktestResult) {
    println!("\n=== {} on {} ({}) ===", result.strategy_name, result.symbol, result.timeframe);
    println!("  Capital:        {} -> {}", result.initial_capital, result.final_capital);
    println!(
        "  Return:         {:.2}% ({:.2}% annualized)",
        result.total_return_pct, result.annualized_return_pct
    );
    println!(
        "  Trades:         {} ({} wins / {} losses, {:.1}% win rate)",
        result.total_trades, result.winning_trades, result.losing_trades, result.win_rate
    );
    println!(
        "  Risk:           {:.2}% max drawdown | Sharpe {:.2} | Sortino {:.2}",
        result.max_drawdown_pct, result.sharpe_ratio, result.sortino_ratio
    );
    println!(
        "  Best / worst:   {:+.2} / {:+.2} | profit factor {:.2}",
        result.best_trade, result.worst_trade, result.profit_factor
    );

    if !result.monthly_returns.is_empty() {
        println!("  Monthly returns:");
        for (month, pct) in &result.monthly_returns {
            println!("    {}  {:+.2}%", month, pct);
        }
    }
}

// ============================================================================
// Search command
// ============================================================================

async fn cmd_search(
    data: &Path,
    config: &Path,
    ranges: &Path,
    top_n: usize,
    export: Option<&Path>,
) -> anyhow::Result<()> {
    let candles: Vec<Candle> = load_json(data)?;
    let config_file: BacktestConfig = load_json(config)?;
    let ranges: BTreeMap<String, ParamRange> = load_json(ranges)?;

    let progress = Arc::new(SearchProgress::new());
    progress.reset();

    let task_progress = Arc::clone(&progress);
    let handle = tokio::spawn(async move {
        run_search(
            config_file.strategy,
            config_file.params,
            candles,
            ranges,
            top_n,
            task_progress,
        )
        .await;
    });

    // Progress display loop
    loop {
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
        let status = progress.status.read().unwrap().clone();
        let completed = progress.completed.load(Ordering::Relaxed);
        let total = progress.total_combinations.load(Ordering::Relaxed);

        match status {
            SearchStatus::Running => {
                use std::io::Write as _;
                print!(
                    "\r  Searching [{:>3.0}%] ({}/{})      ",
                    progress.progress_pct(),
                    completed,
                    total
                );
                std::io::stdout().flush().ok();
            }
            SearchStatus::Complete => {
                println!("\r  Complete ({} combinations)            ", completed);
                break;
            }
            SearchStatus::Error => {
                let err = progress.error_message.read().unwrap().clone();
                anyhow::bail!("search failed: {}", err.unwrap_or_default());
            }
            SearchStatus::Idle => {}
        }
    }

    let _ = handle.await;

    let results = progress.results.read().unwrap().clone();
    print_search_results(&results);

    if let Some(path) = export {
        let json = serde_json::to_string_pretty(&results)?;
        std::fs::write(path, &json)?;
        println!("\nResults exported to {}", path.display());
    }

    Ok(())
}

fn print_search_results(results: &[SearchCandidate]) {
    if results.is_empty() {
        println!("\nNo results.");
        return;
    }

    println!("\nTop {} configurations:", results.len());
    println!(
        "  {:>3}  {:>9} {:>8} {:>8} {:>7} {:>7}  {}",
        "#", "Return%", "Sharpe", "MaxDD%", "WR%", "Trades", "Params"
    );
    println!("  {}", "-".repeat(75));
    for r in results {
        println!(
            "  {:>3}  {:>9.2} {:>8.2} {:>8.2} {:>7.1} {:>7}  {}",
            r.rank,
            r.total_return_pct,
            r.sharpe_ratio,
            r.max_drawdown_pct,
            r.win_rate,
            r.total_trades,
            r.params,
        );
    }
}

// ============================================================================
// Portfolio commands
// ============================================================================

fn cmd_risk(
    prices_path: &Path,
    weights: &[f64],
    market: &str,
    confidence: f64,
    risk_free_rate: f64,
) -> anyhow::Result<()> {
    let mut prices: BTreeMap<String, Vec<f64>> = load_json(prices_path)?;

    let market_prices = prices
        .get(market)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("market symbol '{market}' not found in price file"))?;
    prices.remove(market);

    let config = RiskConfig {
        confidence,
        risk_free_rate,
    };

    info!(assets = prices.len(), market, "analyzing portfolio risk");

    let metrics = risk::analyze_portfolio_risk(&prices, weights, &market_prices, &config)?;

    let symbols: Vec<String> = prices.keys().cloned().collect();
    let returns = risk::asset_returns(&prices)?;
    let matrix = engine::indicators::covariance_matrix(&returns);
    let contributions = risk::risk_contributions(&symbols, weights, &matrix);

    let report = serde_json::json!({
        "symbols": symbols,
        "weights": weights,
        "metrics": metrics,
        "risk_contributions": contributions,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

fn cmd_optimize(
    prices_path: &Path,
    params: OptimizerParams,
    trend: Option<&str>,
    seed: u64,
) -> anyhow::Result<()> {
    let prices: BTreeMap<String, Vec<f64>> = load_json(prices_path)?;
    let mut rng = StdRng::seed_from_u64(seed);

    info!(
        assets = prices.len(),
        simulations = params.simulations,
        seed,
        "optimizing portfolio"
    );

    let result = match trend {
        Some(s) => portfolio::optimize_for_trend(&prices, &params, parse_trend(s)?, &mut rng)?,
        None => portfolio::optimize_max_sharpe(&prices, &params, &mut rng)?,
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn cmd_risk_parity(prices_path: &Path, risk_free_rate: f64) -> anyhow::Result<()> {
    let prices: BTreeMap<String, Vec<f64>> = load_json(prices_path)?;
    let result = portfolio::risk_parity(&prices, risk_free_rate)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
