pub mod binance;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod source;

pub use binance::{BinanceClient, BinanceStream};
pub use source::{CurrentBar, KlinePager, KlineRequest, Klines, Listener, Source, MAX_KLINE_LIMIT};
