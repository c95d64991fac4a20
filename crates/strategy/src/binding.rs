use common::Bar;

use crate::Indicator;

/// Free-form diagnostics a signal function attaches to its verdict.
pub type Context = serde_json::Map<String, serde_json::Value>;

type Selector = Box<dyn Fn(&Bar) -> Vec<f64> + Send + Sync>;
type SignalFn = Box<dyn Fn(f64, f64) -> (Option<bool>, Context) + Send + Sync>;

/// One named indicator tied to an interval.
///
/// Each bar of the binding's interval is turned into a sample by the selector
/// (close price by default) and fed to the indicator; once the indicator yields a
/// value, the signal function maps `(value, close)` to a verdict.
pub struct IndicatorBinding {
    name: String,
    interval: String,
    indicator: Box<dyn Indicator>,
    select: Selector,
    signal: SignalFn,
    minimum_values: usize,
}

impl IndicatorBinding {
    pub fn new(
        name: impl Into<String>,
        interval: impl Into<String>,
        indicator: impl Indicator + 'static,
        signal: impl Fn(f64, f64) -> (Option<bool>, Context) + Send + Sync + 'static,
        minimum_values: usize,
    ) -> Self {
        Self {
            name: name.into(),
            interval: interval.into(),
            indicator: Box::new(indicator),
            select: Box::new(|bar: &Bar| vec![bar.close]),
            signal: Box::new(signal),
            minimum_values,
        }
    }

    /// Replace the default close-price selector.
    pub fn with_select(mut self, select: impl Fn(&Bar) -> Vec<f64> + Send + Sync + 'static) -> Self {
        self.select = Box::new(select);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> &str {
        &self.interval
    }

    /// Bars of history needed to warm this binding up.
    pub fn minimum_values(&self) -> usize {
        self.minimum_values
    }

    /// Feed one bar; `(None, {})` while the indicator is still warming up.
    pub(crate) fn evaluate(&mut self, bar: &Bar) -> (Option<bool>, Context) {
        let sample = (self.select)(bar);
        match self.indicator.next_value(&sample) {
            Some(value) => (self.signal)(value, bar.close),
            None => (None, Context::new()),
        }
    }
}

impl std::fmt::Debug for IndicatorBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndicatorBinding")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("minimum_values", &self.minimum_values)
            .finish_non_exhaustive()
    }
}

/// Stock signal functions. Each reports `{"v": value, "close": close}`.
pub mod signals {
    use serde_json::json;

    use super::Context;

    fn context(v: f64, close: f64) -> Context {
        let mut ctx = Context::new();
        ctx.insert("v".into(), json!(v));
        ctx.insert("close".into(), json!(close));
        ctx
    }

    /// True when price closes above the indicator.
    pub fn close_above() -> impl Fn(f64, f64) -> (Option<bool>, Context) + Clone + Send + Sync {
        |v, close| (Some(close > v), context(v, close))
    }

    /// True when price closes below the indicator.
    pub fn close_below() -> impl Fn(f64, f64) -> (Option<bool>, Context) + Clone + Send + Sync {
        |v, close| (Some(close < v), context(v, close))
    }

    /// True when the indicator itself is above `threshold`.
    pub fn value_above(threshold: f64) -> impl Fn(f64, f64) -> (Option<bool>, Context) + Clone + Send + Sync {
        move |v, close| (Some(v > threshold), context(v, close))
    }

    /// True when the indicator itself is below `threshold`.
    pub fn value_below(threshold: f64) -> impl Fn(f64, f64) -> (Option<bool>, Context) + Clone + Send + Sync {
        move |v, close| (Some(v < threshold), context(v, close))
    }
}
