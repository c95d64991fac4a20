use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use common::{Error, Result};

/// Top-level strategy config file (TOML).
///
/// Example `config/strategy.toml`:
/// ```toml
/// symbol = "BNBUSD"
///
/// [[indicator]]
/// name = "SMA20_1m"
/// type = "sma"
/// interval = "1m"
/// signal = "close_above"
///
/// [indicator.params]
/// period = 20
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StrategyFileConfig {
    /// Trading pair, e.g. "BNBUSD".
    pub symbol: String,
    #[serde(rename = "indicator")]
    pub indicators: Vec<IndicatorConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndicatorConfig {
    /// Unique binding name shown in logs and consensus state.
    pub name: String,
    /// Indicator type identifier: "sma", "wma", "ema" or "rsi".
    #[serde(rename = "type")]
    pub indicator_type: String,
    /// Interval token, e.g. "1m".
    pub interval: String,
    /// Signal function: "close_above", "close_below", "value_above" or "value_below".
    #[serde(default = "default_signal")]
    pub signal: String,
    /// Bars of history to warm up on. Defaults to the indicator's own warm-up.
    #[serde(default)]
    pub minimum_values: Option<usize>,
    /// Indicator-specific parameters.
    #[serde(default)]
    pub params: HashMap<String, toml::Value>,
}

fn default_signal() -> String {
    "close_above".to_string()
}

impl StrategyFileConfig {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read strategy config at '{path}': {e}")))?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("failed to parse strategy config at '{path}': {e}")))
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
