use tracing::debug;

use crate::{Error, Result};

const DEFAULT_SPOT_URL: &str = "https://api.binance.us";
const DEFAULT_WS_URL: &str = "wss://stream.binance.us:9443";

/// Where the acquisition engine fetches history and streams live bars from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub spot_url: String,
    pub ws_url: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_secret: None,
            spot_url: DEFAULT_SPOT_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
        }
    }
}

/// What the binary does once the strategy is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Warm up, then follow live bars until Ctrl-C.
    Live,
    /// Replay history ending at `timestamp` and compare against `expected`.
    Backtest {
        timestamp: i64,
        expected: Option<bool>,
    },
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Live => write!(f, "live"),
            RunMode::Backtest { .. } => write!(f, "backtest"),
        }
    }
}

/// All configuration loaded from environment variables at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub source: SourceConfig,
    pub strategy_config_path: String,
    pub mode: RunMode,
}

impl Config {
    /// Load configuration from environment variables, reading `.env` if present.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            debug!(error = %e, "No .env file loaded");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = SourceConfig::default();
        let source = SourceConfig {
            api_key: lookup("BINANCE_API_KEY").filter(|v| !v.is_empty()),
            api_secret: lookup("BINANCE_SECRET").filter(|v| !v.is_empty()),
            spot_url: lookup("BINANCE_SPOT_URL").unwrap_or(defaults.spot_url),
            ws_url: lookup("BINANCE_WS_URL").unwrap_or(defaults.ws_url),
        };
        if source.api_key.is_none() {
            debug!("BINANCE_API_KEY not set, kline requests go out unauthenticated");
        }

        let mode = match lookup("RUN_MODE")
            .unwrap_or_else(|| "live".to_string())
            .to_lowercase()
            .as_str()
        {
            "live" => RunMode::Live,
            "backtest" => {
                let raw = lookup("BACKTEST_TIMESTAMP").ok_or_else(|| {
                    Error::Config("BACKTEST_TIMESTAMP is required when RUN_MODE=backtest".into())
                })?;
                let timestamp = raw.trim().parse::<i64>().map_err(|_| {
                    Error::Config(format!("BACKTEST_TIMESTAMP must be Unix millis, got '{raw}'"))
                })?;
                let expected = match lookup("BACKTEST_EXPECTED").as_deref().map(str::trim) {
                    Some("true") => Some(true),
                    Some("false") => Some(false),
                    Some("null") | None => None,
                    Some(other) => {
                        return Err(Error::Config(format!(
                            "BACKTEST_EXPECTED must be 'true', 'false' or 'null', got '{other}'"
                        )))
                    }
                };
                RunMode::Backtest {
                    timestamp,
                    expected,
                }
            }
            other => {
                return Err(Error::Config(format!(
                    "RUN_MODE must be 'live' or 'backtest', got '{other}'"
                )))
            }
        };

        Ok(Config {
            source,
            strategy_config_path: lookup("STRATEGY_CONFIG_PATH")
                .unwrap_or_else(|| "config/strategy.toml".to_string()),
            mode,
        })
    }
}
