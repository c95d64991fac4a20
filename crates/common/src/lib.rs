pub mod config;
pub mod error;
pub mod exchange;
pub mod interval;
pub mod types;

pub use config::{Config, RunMode, SourceConfig};
pub use error::{Error, Result};
pub use exchange::{KlineFetcher, KlineStream};
pub use interval::{interval_millis, interval_seconds, parse_interval};
pub use types::*;
