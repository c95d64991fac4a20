pub mod moving_average;
pub mod rsi;

pub use moving_average::{Ema, Sma, Wma};
pub use rsi::Rsi;
