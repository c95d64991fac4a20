use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use common::{Error, KlineFetcher, KlineQuery, RawKline, Result, SourceConfig};

/// REST client for Binance market data. Used for historical kline pages.
///
/// Klines are a public endpoint, so requests are unsigned; the API key is only
/// attached as `X-MBX-APIKEY` when one is configured.
pub struct BinanceClient {
    base_url: String,
    api_key: Option<String>,
    http: Client,
}

impl BinanceClient {
    pub fn new(cfg: &SourceConfig) -> Result<Self> {
        let http = Client::builder()
            .use_rustls_tls()
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: cfg.spot_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            http,
        })
    }
}

#[async_trait]
impl KlineFetcher for BinanceClient {
    async fn fetch_bars(
        &self,
        symbol: &str,
        interval: &str,
        query: KlineQuery,
    ) -> Result<Vec<RawKline>> {
        let url = format!("{}/api/v3/klines", self.base_url);
        debug!(symbol, interval, ?query, "GET /api/v3/klines");

        let mut req = self
            .http
            .get(&url)
            .query(&[("symbol", symbol), ("interval", interval)])
            .query(&query);
        if let Some(key) = &self.api_key {
            req = req.header("X-MBX-APIKEY", key);
        }

        let resp = req.send().await.map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(Error::Exchange(format!("HTTP {status}: {body}")));
        }

        serde_json::from_str(&body).map_err(|e| Error::Exchange(e.to_string()))
    }
}
