use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use common::{interval_seconds, Bar, Error, Result, SourceConfig};
use engine::{KlineRequest, Listener, Source};

use crate::consensus::{BindingState, Consensus, ConsensusReducer, ConsensusState, NamedState, Unanimous};
use crate::IndicatorBinding;

/// Bindings, reducer and the running per-binding state. Everything that a bar
/// arrival mutates lives here, behind one lock.
struct Aggregator {
    bindings: Vec<IndicatorBinding>,
    reducer: Box<dyn ConsensusReducer>,
    state: ConsensusState,
    last_timestamp: HashMap<String, i64>,
}

impl Aggregator {
    /// True when `bar` is not newer than the last bar seen on `interval`.
    fn is_stale(&self, interval: &str, bar: &Bar) -> bool {
        self.last_timestamp
            .get(interval)
            .is_some_and(|&last| bar.timestamp <= last)
    }

    fn next_value(&mut self, interval: &str, bar: &Bar) -> Option<ConsensusState> {
        let last = self.last_timestamp.entry(interval.to_string()).or_insert(bar.timestamp);
        *last = (*last).max(bar.timestamp);

        for binding in self.bindings.iter_mut().filter(|b| b.interval() == interval) {
            let (signal, context) = binding.evaluate(bar);
            self.state.insert(
                binding.name().to_string(),
                BindingState {
                    interval: interval.to_string(),
                    signal,
                    context,
                },
            );
        }

        // Suspended until every binding has reported and none is null.
        let complete = self.state.len() == self.bindings.len();
        if !complete || self.state.values().any(|s| s.signal.is_none()) {
            return None;
        }
        Some(self.state.clone())
    }

    fn next_signal(&mut self, interval: &str, bar: &Bar) -> Option<Consensus> {
        let state = self.next_value(interval, bar)?;
        let signal = {
            // Reducers see bindings in declaration order.
            let named: Vec<NamedState<'_>> = self
                .bindings
                .iter()
                .filter_map(|b| state.get_key_value(b.name()))
                .map(|(name, state)| NamedState { name, state })
                .collect();
            self.reducer.reduce(&named)
        };
        Some(Consensus { signal, state })
    }
}

/// The signal aggregator.
///
/// Feeds interval-scoped bars into its bindings and emits a consensus signal
/// once every binding has a verdict. Historical replay (`get_signal`,
/// `backtest`) and live following (`run`) both go through the same state, which
/// accumulates for the lifetime of the strategy.
pub struct Strategy {
    symbol: String,
    intervals: Vec<String>,
    minimum_values: HashMap<String, usize>,
    source: Arc<Source>,
    core: Arc<Mutex<Aggregator>>,
}

impl Strategy {
    pub fn builder(symbol: impl Into<String>) -> StrategyBuilder {
        StrategyBuilder::new(symbol)
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Distinct binding intervals, in the order bindings first introduce them.
    pub fn intervals(&self) -> &[String] {
        &self.intervals
    }

    /// History length fetched for `interval` during replay.
    pub fn minimum_values(&self, interval: &str) -> Option<usize> {
        self.minimum_values.get(interval).copied()
    }

    pub fn source(&self) -> &Arc<Source> {
        &self.source
    }

    /// Current state of every binding that has seen a bar.
    pub fn state(&self) -> ConsensusState {
        self.core.lock().state.clone()
    }

    /// Feed `bar` to every binding on `interval`. `None` while any binding is
    /// missing or undecided.
    pub fn next_value(&self, interval: &str, bar: &Bar) -> Option<ConsensusState> {
        self.core.lock().next_value(interval, bar)
    }

    /// [`Strategy::next_value`] reduced to a consensus signal.
    pub fn next_signal(&self, interval: &str, bar: &Bar) -> Option<Consensus> {
        self.core.lock().next_signal(interval, bar)
    }

    /// Replay history ending at `timestamp` (the latest bar when `None`).
    ///
    /// Intervals are replayed one after another in declaration order, each over
    /// its `minimum_values` window. Returns the result of the very last bar.
    pub async fn get_signal(&self, timestamp: Option<i64>) -> Result<Option<Consensus>> {
        let mut last = None;
        for interval in &self.intervals {
            let limit = self.minimum_values[interval];
            debug!(symbol = %self.symbol, interval = %interval, limit, ?timestamp, "Replaying history");

            let mut pager = self.source.klines(
                KlineRequest::new(&self.symbol, interval, limit).ending_at(timestamp),
            )?;
            while let Some(bar) = pager.next().await? {
                last = self.next_signal(interval, &bar);
            }
        }
        Ok(last)
    }

    /// Replay up to `timestamp` and compare the consensus against `expected`.
    ///
    /// Fails with [`Error::Indeterminate`] when the replay never becomes decidable.
    pub async fn backtest(&self, timestamp: i64, expected: Option<bool>) -> Result<(bool, ConsensusState)> {
        let Consensus { signal, state } =
            self.get_signal(Some(timestamp))
                .await?
                .ok_or_else(|| Error::Indeterminate {
                    symbol: self.symbol.clone(),
                    timestamp: Some(timestamp),
                })?;
        info!(symbol = %self.symbol, timestamp, ?signal, ?expected, "Backtest complete");
        Ok((signal == expected, state))
    }

    /// Warm up on history, then follow live bars on every interval.
    ///
    /// `callback` receives every decidable consensus, starting with the warm-up
    /// result. Returns once subscribed; signals keep arriving until [`Strategy::stop`].
    pub async fn run(&self, callback: impl Fn(Consensus) + Send + Sync + 'static) -> Result<()> {
        let callback = Arc::new(callback);

        if let Some(consensus) = self.get_signal(None).await? {
            callback(consensus);
        }

        for interval in &self.intervals {
            let listener: Listener = {
                let core = self.core.clone();
                let callback = callback.clone();
                let interval = interval.clone();
                Arc::new(move |bar: &Bar| {
                    let result = {
                        let mut core = core.lock();
                        // The replay may already have consumed this bar while it was still forming.
                        if core.is_stale(&interval, bar) {
                            debug!(interval = %interval, timestamp = bar.timestamp, time = %bar.time(), "Skipping replayed kline");
                            return;
                        }
                        core.next_signal(&interval, bar)
                    };
                    if let Some(consensus) = result {
                        callback(consensus);
                    }
                })
            };
            self.source.subscribe(&self.symbol, interval, listener);
        }

        info!(symbol = %self.symbol, intervals = ?self.intervals, "Following live klines");
        Ok(())
    }

    /// Close all live connections. Safe to call repeatedly.
    pub fn stop(&self) {
        self.source.disconnect();
    }
}

// ─── Builder ─────────────────────────────────────────────────────────────────

pub struct StrategyBuilder {
    symbol: String,
    bindings: Vec<IndicatorBinding>,
    reducer: Option<Box<dyn ConsensusReducer>>,
    source: Option<Arc<Source>>,
    source_config: SourceConfig,
}

impl StrategyBuilder {
    fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bindings: Vec::new(),
            reducer: None,
            source: None,
            source_config: SourceConfig::default(),
        }
    }

    pub fn binding(mut self, binding: IndicatorBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn bindings(mut self, bindings: impl IntoIterator<Item = IndicatorBinding>) -> Self {
        self.bindings.extend(bindings);
        self
    }

    /// Replace the default [`Unanimous`] reducer.
    pub fn reducer(mut self, reducer: impl ConsensusReducer + 'static) -> Self {
        self.reducer = Some(Box::new(reducer));
        self
    }

    /// Use an existing acquisition engine instead of building one from config.
    pub fn source(mut self, source: Arc<Source>) -> Self {
        self.source = Some(source);
        self
    }

    /// Configuration for the Binance-backed source built when none is supplied.
    pub fn source_config(mut self, cfg: SourceConfig) -> Self {
        self.source_config = cfg;
        self
    }

    pub fn build(self) -> Result<Strategy> {
        if self.bindings.is_empty() {
            return Err(Error::Config(format!("strategy for {} has no bindings", self.symbol)));
        }

        let mut names = HashSet::new();
        let mut intervals: Vec<String> = Vec::new();
        let mut minimum_values: HashMap<String, usize> = HashMap::new();

        for b in &self.bindings {
            if !names.insert(b.name()) {
                return Err(Error::Config(format!("duplicate binding name '{}'", b.name())));
            }
            interval_seconds(b.interval())?;
            if b.minimum_values() == 0 {
                return Err(Error::Config(format!(
                    "binding '{}' needs at least one bar of history",
                    b.name()
                )));
            }

            let min = minimum_values.entry(b.interval().to_string()).or_insert_with(|| {
                intervals.push(b.interval().to_string());
                0
            });
            *min = (*min).max(b.minimum_values());
        }

        let source = match self.source {
            Some(source) => source,
            None => Arc::new(Source::binance(&self.source_config)?),
        };

        info!(
            symbol = %self.symbol,
            bindings = self.bindings.len(),
            intervals = ?intervals,
            "Strategy ready"
        );

        Ok(Strategy {
            symbol: self.symbol,
            intervals,
            minimum_values,
            source,
            core: Arc::new(Mutex::new(Aggregator {
                bindings: self.bindings,
                reducer: self.reducer.unwrap_or_else(|| Box::new(Unanimous)),
                state: ConsensusState::new(),
                last_timestamp: HashMap::new(),
            })),
        })
    }
}
