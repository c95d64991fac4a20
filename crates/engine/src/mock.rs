//! In-memory exchange collaborators for tests.
//!
//! `MockFetcher` serves a gap-free synthetic history aligned to each interval,
//! honouring the REST endpoint's window and 1000-bar page cap. `MockStream` lets
//! a test push raw envelopes into whichever live connections `Source` opened.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

use common::{interval_millis, KlineFetcher, KlineQuery, KlineStream, RawKline, Result, SubscriptionKey};

use crate::MAX_KLINE_LIMIT;

type PriceFn = Box<dyn Fn(i64) -> f64 + Send + Sync>;

/// One recorded `fetch_bars` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    pub symbol: String,
    pub interval: String,
    pub query: KlineQuery,
}

pub struct MockFetcher {
    now_ms: i64,
    close: PriceFn,
    empty_calls: HashSet<usize>,
    calls: Mutex<Vec<FetchCall>>,
}

impl MockFetcher {
    /// History whose most recent bar is the last interval boundary at or before `now_ms`.
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms,
            close: Box::new(|_| 100.0),
            empty_calls: HashSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Close price as a function of bar timestamp.
    pub fn with_close(mut self, close: impl Fn(i64) -> f64 + Send + Sync + 'static) -> Self {
        self.close = Box::new(close);
        self
    }

    /// Make the `n`th call (0-based) return an empty page.
    pub fn with_empty_call(mut self, n: usize) -> Self {
        self.empty_calls.insert(n);
        self
    }

    /// Timestamp of the most recent bar for `interval`.
    pub fn latest(&self, interval: &str) -> Result<i64> {
        let step = interval_millis(interval)?;
        Ok(self.now_ms.div_euclid(step) * step)
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().clone()
    }

    fn record(&self, t: i64) -> RawKline {
        let close = (self.close)(t);
        RawKline(vec![
            json!(t),
            json!(format!("{close:.8}")),
            json!(format!("{:.8}", close + 1.0)),
            json!(format!("{:.8}", close - 1.0)),
            json!(format!("{close:.8}")),
            json!("1.00000000"),
        ])
    }
}

#[async_trait]
impl KlineFetcher for MockFetcher {
    async fn fetch_bars(
        &self,
        symbol: &str,
        interval: &str,
        query: KlineQuery,
    ) -> Result<Vec<RawKline>> {
        let call = {
            let mut calls = self.calls.lock();
            calls.push(FetchCall {
                symbol: symbol.to_string(),
                interval: interval.to_string(),
                query,
            });
            calls.len() - 1
        };
        if self.empty_calls.contains(&call) {
            return Ok(Vec::new());
        }

        let step = interval_millis(interval)?;
        let latest = self.latest(interval)?;
        let end = query
            .end_time
            .map_or(latest, |t| t.min(latest).div_euclid(step) * step);
        let limit = query.limit.min(MAX_KLINE_LIMIT);

        let first = match query.start_time {
            // Oldest-first from the first boundary at or after `start`.
            Some(start) => start.div_euclid(step) * step + if start.rem_euclid(step) == 0 { 0 } else { step },
            // No start: the newest `limit` bars ending at `end`.
            None => end - step * (limit as i64 - 1),
        };

        Ok((0..limit as i64)
            .map(|i| first + i * step)
            .take_while(|t| *t <= end)
            .map(|t| self.record(t))
            .collect())
    }
}

struct MockConnection {
    key: SubscriptionKey,
    tx: mpsc::Sender<String>,
}

#[derive(Default)]
pub struct MockStream {
    connections: Mutex<Vec<MockConnection>>,
}

impl MockStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections ever opened for `key`.
    pub fn connection_count(&self, key: &SubscriptionKey) -> usize {
        self.connections.lock().iter().filter(|c| &c.key == key).count()
    }

    /// Connections for `key` whose consumer is still alive.
    pub fn open_count(&self, key: &SubscriptionKey) -> usize {
        self.connections
            .lock()
            .iter()
            .filter(|c| &c.key == key && !c.tx.is_closed())
            .count()
    }

    /// Wait until `n` connections have been opened for `key`.
    pub async fn wait_for_connections(&self, key: &SubscriptionKey, n: usize) {
        for _ in 0..200 {
            if self.connection_count(key) >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Deliver `text` on the most recent open connection for `key`.
    /// Returns false if there is none.
    pub async fn push(&self, key: &SubscriptionKey, text: String) -> bool {
        let tx = self
            .connections
            .lock()
            .iter()
            .rev()
            .find(|c| &c.key == key && !c.tx.is_closed())
            .map(|c| c.tx.clone());

        match tx {
            Some(tx) => tx.send(text).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl KlineStream for MockStream {
    async fn stream(&self, symbol: &str, interval: &str, tx: mpsc::Sender<String>) -> Result<()> {
        self.connections.lock().push(MockConnection {
            key: SubscriptionKey::new(symbol, interval),
            tx: tx.clone(),
        });
        tx.closed().await;
        Ok(())
    }
}

/// A Binance-shaped kline envelope.
pub fn kline_envelope(timestamp: i64, close: f64, closed: bool) -> String {
    json!({
        "e": "kline",
        "k": {
            "t": timestamp,
            "o": format!("{close:.8}"),
            "h": format!("{:.8}", close + 1.0),
            "l": format!("{:.8}", close - 1.0),
            "c": format!("{close:.8}"),
            "x": closed,
        }
    })
    .to_string()
}
