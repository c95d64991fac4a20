use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures_util::stream::{self, Stream};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use common::{
    interval_millis, parse_kline_update, Bar, Error, KlineFetcher, KlineQuery, KlineStream,
    Result, SourceConfig, SubscriptionKey,
};

use crate::binance::{BinanceClient, BinanceStream};

/// Most bars the historical endpoint returns per call.
pub const MAX_KLINE_LIMIT: usize = 1000;

/// Envelopes buffered between the live transport and listener dispatch.
const LIVE_BUFFER: usize = 256;

/// Callback invoked on every closed live bar. Identity (`Arc::ptr_eq`) is what
/// `unsubscribe` matches on.
pub type Listener = Arc<dyn Fn(&Bar) + Send + Sync>;

/// Result of [`Source::get_klines`]. A one-bar query is a "latest bar" probe and
/// yields the bar itself rather than a series.
#[derive(Debug, Clone, PartialEq)]
pub enum Klines {
    Latest(Bar),
    Series(Vec<Bar>),
}

impl Klines {
    pub fn into_vec(self) -> Vec<Bar> {
        match self {
            Klines::Latest(bar) => vec![bar],
            Klines::Series(bars) => bars,
        }
    }
}

/// A windowed history request: `limit` bars ending at `end_time`
/// (the most recent bar when `None`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KlineRequest {
    pub symbol: String,
    pub interval: String,
    pub limit: usize,
    pub end_time: Option<i64>,
}

impl KlineRequest {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>, limit: usize) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
            limit,
            end_time: None,
        }
    }

    pub fn ending_at(mut self, end_time: Option<i64>) -> Self {
        self.end_time = end_time;
        self
    }
}

/// Snapshot accessor for the bar currently forming on a live stream.
#[derive(Clone)]
pub struct CurrentBar(Arc<Mutex<Option<Bar>>>);

impl CurrentBar {
    /// The latest unclosed bar, if one has arrived since the last close.
    pub fn get(&self) -> Option<Bar> {
        *self.0.lock()
    }
}

struct Subscription {
    listeners: Arc<Mutex<Vec<Listener>>>,
    current: Arc<Mutex<Option<Bar>>>,
    producer: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl Subscription {
    fn close(self) {
        self.producer.abort();
        self.dispatcher.abort();
    }
}

/// The kline acquisition engine.
///
/// Pages through history with [`Source::klines`] and multiplexes live bars so
/// that each `(symbol, interval)` holds at most one open connection no matter
/// how many listeners are registered on it.
pub struct Source {
    fetcher: Arc<dyn KlineFetcher>,
    streamer: Arc<dyn KlineStream>,
    subscriptions: Mutex<HashMap<SubscriptionKey, Subscription>>,
}

impl Source {
    pub fn new(fetcher: Arc<dyn KlineFetcher>, streamer: Arc<dyn KlineStream>) -> Self {
        Self {
            fetcher,
            streamer,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// A source backed by the Binance REST and WebSocket endpoints in `cfg`.
    pub fn binance(cfg: &SourceConfig) -> Result<Self> {
        Ok(Self::new(
            Arc::new(BinanceClient::new(cfg)?),
            Arc::new(BinanceStream::new(&cfg.ws_url)),
        ))
    }

    /// Fetch the most recent `query.limit` bars (or whatever window the query names),
    /// oldest first.
    pub async fn get_klines(&self, symbol: &str, interval: &str, query: KlineQuery) -> Result<Klines> {
        fetch_klines(self.fetcher.as_ref(), symbol, interval, query).await
    }

    /// Timestamp of the most recent bar.
    pub async fn get_recent_timestamp(&self, symbol: &str, interval: &str) -> Result<i64> {
        recent_timestamp(self.fetcher.as_ref(), symbol, interval).await
    }

    /// A lazy, page-at-a-time sequence of `request.limit` bars ending at
    /// `request.end_time`. Fails immediately on an unparseable interval.
    pub fn klines(&self, request: KlineRequest) -> Result<KlinePager> {
        KlinePager::new(self.fetcher.clone(), request)
    }

    /// Register `listener` for closed bars on `(symbol, interval)`, opening the
    /// live connection if this is the first listener for the key.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(&self, symbol: &str, interval: &str, listener: Listener) -> CurrentBar {
        let key = SubscriptionKey::new(symbol, interval);
        let mut subscriptions = self.subscriptions.lock();

        if let Some(sub) = subscriptions.get(&key) {
            let mut listeners = sub.listeners.lock();
            listeners.push(listener);
            debug!(key = %key, listeners = listeners.len(), "Added kline listener");
            return CurrentBar(sub.current.clone());
        }

        let sub = self.open(&key, listener);
        let current = CurrentBar(sub.current.clone());
        subscriptions.insert(key, sub);
        current
    }

    /// Remove every registration of `listener` on `(symbol, interval)`. The live
    /// connection is torn down when no listeners remain.
    pub fn unsubscribe(&self, symbol: &str, interval: &str, listener: &Listener) {
        let key = SubscriptionKey::new(symbol, interval);
        let mut subscriptions = self.subscriptions.lock();

        let Some(sub) = subscriptions.get(&key) else {
            return;
        };
        let remaining = {
            let mut listeners = sub.listeners.lock();
            listeners.retain(|l| !Arc::ptr_eq(l, listener));
            listeners.len()
        };

        if remaining == 0 {
            if let Some(sub) = subscriptions.remove(&key) {
                info!(key = %key, "Last listener removed, closing live kline stream");
                sub.close();
            }
        }
    }

    /// Close every live connection and forget all listeners.
    pub fn disconnect(&self) {
        let drained: Vec<_> = self.subscriptions.lock().drain().collect();
        for (key, sub) in drained {
            info!(key = %key, "Closing live kline stream");
            sub.close();
        }
    }

    /// Number of open live connections.
    pub fn connection_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Number of listener registrations on `(symbol, interval)`.
    pub fn listener_count(&self, symbol: &str, interval: &str) -> usize {
        self.subscriptions
            .lock()
            .get(&SubscriptionKey::new(symbol, interval))
            .map_or(0, |sub| sub.listeners.lock().len())
    }

    fn open(&self, key: &SubscriptionKey, listener: Listener) -> Subscription {
        info!(key = %key, "Opening live kline stream");

        let (tx, mut rx) = mpsc::channel::<String>(LIVE_BUFFER);
        let listeners = Arc::new(Mutex::new(vec![listener]));
        let current = Arc::new(Mutex::new(None));

        let producer = tokio::spawn({
            let streamer = self.streamer.clone();
            let key = key.clone();
            async move {
                if let Err(e) = streamer.stream(&key.symbol, &key.interval, tx).await {
                    warn!(key = %key, error = %e, "Live kline stream ended with error");
                }
            }
        });

        let dispatcher = tokio::spawn({
            let listeners = listeners.clone();
            let current = current.clone();
            let key = key.clone();
            async move {
                while let Some(text) = rx.recv().await {
                    deliver(&key, &text, &listeners, &current);
                }
            }
        });

        Subscription {
            listeners,
            current,
            producer,
            dispatcher,
        }
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Handle one live envelope: an unclosed bar only updates the in-progress
/// snapshot; a closed bar goes to every listener in registration order.
fn deliver(
    key: &SubscriptionKey,
    text: &str,
    listeners: &Mutex<Vec<Listener>>,
    current: &Mutex<Option<Bar>>,
) {
    let update = match parse_kline_update(text) {
        Ok(update) => update,
        Err(e) => {
            warn!(key = %key, error = %e, "Failed to parse kline event");
            return;
        }
    };

    if !update.is_closed {
        *current.lock() = Some(update.bar);
        return;
    }
    *current.lock() = None;

    // Snapshot so listeners can (un)subscribe from inside a callback.
    let snapshot: Vec<Listener> = listeners.lock().clone();
    for listener in snapshot {
        let bar = update.bar;
        if panic::catch_unwind(AssertUnwindSafe(|| listener(&bar))).is_err() {
            warn!(key = %key, timestamp = bar.timestamp, time = %bar.time(), "Kline listener panicked");
        }
    }
}

async fn fetch_klines(
    fetcher: &dyn KlineFetcher,
    symbol: &str,
    interval: &str,
    query: KlineQuery,
) -> Result<Klines> {
    let records = fetcher.fetch_bars(symbol, interval, query).await?;

    if query.limit == 1 {
        let first = records.first().ok_or_else(|| {
            Error::Exchange(format!("no klines returned for {symbol}@{interval}"))
        })?;
        return Ok(Klines::Latest(first.to_bar()?));
    }

    records
        .iter()
        .map(|r| r.to_bar())
        .collect::<Result<Vec<_>>>()
        .map(Klines::Series)
}

async fn recent_timestamp(fetcher: &dyn KlineFetcher, symbol: &str, interval: &str) -> Result<i64> {
    match fetch_klines(fetcher, symbol, interval, KlineQuery::default()).await? {
        Klines::Latest(bar) => Ok(bar.timestamp),
        Klines::Series(bars) => bars
            .last()
            .map(|b| b.timestamp)
            .ok_or_else(|| Error::Exchange(format!("no klines returned for {symbol}@{interval}"))),
    }
}

// ─── Pagination ──────────────────────────────────────────────────────────────

/// Lazy, single-pass sequence of historical bars.
///
/// One page (at most [`MAX_KLINE_LIMIT`] bars) is fetched per suspension point and
/// only when the previous page has been fully consumed. The page count is
/// `ceil(limit / MAX_KLINE_LIMIT)`; an empty page is skipped without moving the
/// cursor, and iteration stops early once a page reaches `end_time`.
pub struct KlinePager {
    fetcher: Arc<dyn KlineFetcher>,
    symbol: String,
    interval: String,
    step_ms: i64,
    span_ms: i64,
    limit: usize,
    end_time: Option<i64>,
    page: usize,
    pages: usize,
    last_end_time: Option<i64>,
    buffer: VecDeque<Bar>,
    done: bool,
}

impl KlinePager {
    fn new(fetcher: Arc<dyn KlineFetcher>, request: KlineRequest) -> Result<Self> {
        let step_ms = interval_millis(&request.interval)?;
        let span_ms = i64::try_from(request.limit.saturating_sub(1))
            .ok()
            .and_then(|bars| bars.checked_mul(step_ms))
            .ok_or_else(|| {
                Error::Config(format!(
                    "{} bars of {} do not fit in a millisecond window",
                    request.limit, request.interval
                ))
            })?;
        Ok(Self {
            fetcher,
            symbol: request.symbol,
            interval: request.interval,
            step_ms,
            span_ms,
            limit: request.limit,
            end_time: request.end_time,
            page: 0,
            pages: request.limit.div_ceil(MAX_KLINE_LIMIT),
            last_end_time: None,
            buffer: VecDeque::new(),
            done: false,
        })
    }

    /// The next bar in chronological order, or `None` once the window is exhausted.
    pub async fn next(&mut self) -> Result<Option<Bar>> {
        loop {
            if let Some(bar) = self.buffer.pop_front() {
                return Ok(Some(bar));
            }
            if self.done || self.page >= self.pages {
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }

    /// Drain the remaining bars into a `Vec`.
    pub async fn collect(mut self) -> Result<Vec<Bar>> {
        let mut bars = Vec::with_capacity(self.limit);
        while let Some(bar) = self.next().await? {
            bars.push(bar);
        }
        Ok(bars)
    }

    /// Adapt into a `futures` stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bar>> {
        stream::try_unfold(self, |mut pager| async move {
            Ok(pager.next().await?.map(|bar| (bar, pager)))
        })
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let end_time = match self.end_time {
            Some(t) => t,
            None => recent_timestamp(self.fetcher.as_ref(), &self.symbol, &self.interval).await?,
        };
        // Bars open on interval boundaries; the window ends on the last one at or before `end_time`.
        let end_time = end_time - end_time.rem_euclid(self.step_ms);
        self.end_time = Some(end_time);

        let window_start = end_time.checked_sub(self.span_ms).ok_or_else(|| {
            Error::Config(format!(
                "{} bars of {} before {end_time} underflow the timestamp range",
                self.limit, self.interval
            ))
        })?;
        let remaining = self.limit - self.page * MAX_KLINE_LIMIT;
        let query = KlineQuery {
            start_time: Some(match self.last_end_time {
                Some(last) if self.page > 0 => last + 1,
                _ => window_start,
            }),
            end_time: Some(end_time),
            limit: remaining.min(MAX_KLINE_LIMIT),
        };
        self.page += 1;

        debug!(
            symbol = %self.symbol,
            interval = %self.interval,
            page = self.page,
            pages = self.pages,
            start = ?query.start_time,
            end = end_time,
            limit = query.limit,
            "Fetching kline page"
        );
        let records = self
            .fetcher
            .fetch_bars(&self.symbol, &self.interval, query)
            .await?;

        if records.is_empty() {
            debug!(symbol = %self.symbol, interval = %self.interval, page = self.page, "Empty kline page");
            return Ok(());
        }

        for record in &records {
            let bar = record.to_bar()?;
            if self.last_end_time.is_some_and(|last| bar.timestamp <= last) || bar.timestamp > end_time {
                continue;
            }
            self.last_end_time = Some(bar.timestamp);
            self.buffer.push_back(bar);
        }

        if self.last_end_time.is_some_and(|last| last >= end_time) {
            self.done = true;
        }
        Ok(())
    }
}
