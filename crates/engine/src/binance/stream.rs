use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};
use url::Url;

use common::{Error, KlineStream, Result};

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Binance kline/candlestick WebSocket transport.
///
/// Each `stream` call connects to `<ws_url>/ws/<symbol>@kline_<interval>` and
/// forwards raw text frames. Reconnects with exponential backoff until the
/// receiving side goes away.
pub struct BinanceStream {
    ws_url: String,
}

impl BinanceStream {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }

    fn stream_url(&self, symbol: &str, interval: &str) -> Result<Url> {
        let url_str = format!(
            "{}/ws/{}@kline_{}",
            self.ws_url.trim_end_matches('/'),
            symbol.to_lowercase(),
            interval
        );
        Url::parse(&url_str).map_err(|e| Error::WebSocket(e.to_string()))
    }

    async fn connect_once(&self, url: &Url, tx: &mpsc::Sender<String>) -> Result<()> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;

        let (_, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                _ = tx.closed() => return Ok(()),
                msg = read.next() => {
                    let Some(msg) = msg else {
                        return Ok(());
                    };
                    let msg = msg.map_err(|e| Error::WebSocket(e.to_string()))?;
                    if let Message::Text(text) = msg {
                        if tx.send(text).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl KlineStream for BinanceStream {
    async fn stream(&self, symbol: &str, interval: &str, tx: mpsc::Sender<String>) -> Result<()> {
        let url = self.stream_url(symbol, interval)?;
        let mut backoff = Duration::from_secs(1);

        while !tx.is_closed() {
            info!(symbol, interval, "Connecting to Binance WebSocket stream");
            match self.connect_once(&url, &tx).await {
                Ok(()) => {
                    if tx.is_closed() {
                        break;
                    }
                    info!(symbol, interval, "WebSocket stream closed cleanly");
                    // Clean close, e.g. 24h session end
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    warn!(symbol, interval, error = %e, backoff = ?backoff, "WebSocket error, reconnecting");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }

        Ok(())
    }
}
