use std::process::ExitCode;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use common::{Config, RunMode};
use strategy::{builder_from_config, Consensus, StrategyFileConfig};

#[tokio::main]
async fn main() -> ExitCode {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "klinesig failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> common::Result<ExitCode> {
    // ── Config ────────────────────────────────────────────────────────────────
    let cfg = Config::from_env()?;
    info!(mode = %cfg.mode, config = %cfg.strategy_config_path, "klinesig starting");

    // ── Strategy ──────────────────────────────────────────────────────────────
    let strategy_file = StrategyFileConfig::load(&cfg.strategy_config_path)?;
    let strategy = builder_from_config(&strategy_file)?
        .source_config(cfg.source.clone())
        .build()?;

    match cfg.mode {
        RunMode::Backtest { timestamp, expected } => {
            let (matched, state) = strategy.backtest(timestamp, expected).await?;
            let state = serde_json::to_string(&state)?;
            if matched {
                info!(symbol = %strategy.symbol(), timestamp, ?expected, %state, "Backtest matched");
                Ok(ExitCode::SUCCESS)
            } else {
                warn!(symbol = %strategy.symbol(), timestamp, ?expected, %state, "Backtest mismatch");
                Ok(ExitCode::FAILURE)
            }
        }
        RunMode::Live => {
            let symbol = strategy.symbol().to_string();
            strategy
                .run(move |Consensus { signal, state }| {
                    let agreeing = state.values().filter(|s| s.signal == signal).count();
                    info!(symbol = %symbol, ?signal, agreeing, bindings = state.len(), "Signal");
                })
                .await?;

            info!("Following live klines. Waiting for shutdown signal.");
            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received. Closing connections.");
            strategy.stop();
            Ok(ExitCode::SUCCESS)
        }
    }
}
