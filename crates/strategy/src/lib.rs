pub mod binding;
pub mod config;
pub mod consensus;
pub mod indicators;
pub mod registry;
pub mod strategy;

pub use binding::{signals, Context, IndicatorBinding};
pub use config::{IndicatorConfig, StrategyFileConfig};
pub use consensus::{BindingState, Consensus, ConsensusReducer, ConsensusState, NamedState, Unanimous};
pub use registry::builder_from_config;
pub use strategy::{Strategy, StrategyBuilder};

/// A stateful accumulator fed one sample per bar.
///
/// Returns `None` ("not enough data yet") until warmed up, then one derived
/// value per sample.
pub trait Indicator: Send {
    fn next_value(&mut self, sample: &[f64]) -> Option<f64>;

    /// Samples consumed before the first value is produced.
    fn warmup(&self) -> usize;
}

impl Indicator for Box<dyn Indicator> {
    fn next_value(&mut self, sample: &[f64]) -> Option<f64> {
        (**self).next_value(sample)
    }

    fn warmup(&self) -> usize {
        (**self).warmup()
    }
}
