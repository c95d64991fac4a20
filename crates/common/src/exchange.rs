use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{KlineQuery, RawKline, Result};

/// Historical-data side of the exchange connection.
///
/// `BinanceClient` implements this over REST. Implementations return records in
/// chronological order, at most `query.limit` of them.
#[async_trait]
pub trait KlineFetcher: Send + Sync {
    async fn fetch_bars(
        &self,
        symbol: &str,
        interval: &str,
        query: KlineQuery,
    ) -> Result<Vec<RawKline>>;
}

/// Live-data side of the exchange connection.
///
/// One call drives one persistent connection for `(symbol, interval)`, forwarding
/// every text envelope into `tx`. It returns once `tx` is closed; reconnecting on
/// transport failure is the implementation's concern.
#[async_trait]
pub trait KlineStream: Send + Sync {
    async fn stream(&self, symbol: &str, interval: &str, tx: mpsc::Sender<String>) -> Result<()>;
}
