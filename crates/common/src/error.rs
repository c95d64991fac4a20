use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Exchange API error: {0}")]
    Exchange(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed kline: {0}")]
    InvalidKline(String),

    /// Historical replay ended without every binding agreeing on a signal.
    #[error("No decidable signal for {symbol} at {}", display_timestamp(.timestamp))]
    Indeterminate {
        symbol: String,
        timestamp: Option<i64>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

fn display_timestamp(timestamp: &Option<i64>) -> String {
    match timestamp {
        Some(ts) => ts.to_string(),
        None => "now".to_string(),
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
