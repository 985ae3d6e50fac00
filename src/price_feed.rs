//! Price oracle - pull-based mark prices with bounded retry

use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::OracleConfig;
use crate::error::TradeError;
use crate::types::Symbol;

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("parse failed: {0}")]
    Parse(String),
    #[error("no price for {0}")]
    Missing(Symbol),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Source of current mark prices
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn price(&self, symbol: Symbol) -> Result<Decimal, OracleError>;
}

/// REST ticker oracle (`GET /api/v3/ticker/price?symbol=BTCUSDT`)
pub struct HttpPriceOracle {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

impl HttpPriceOracle {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PriceOracle for HttpPriceOracle {
    async fn price(&self, symbol: Symbol) -> Result<Decimal, OracleError> {
        let resp = self
            .client
            .get(format!("{}/api/v3/ticker/price", self.base_url))
            .query(&[("symbol", symbol.as_str())])
            .header("User-Agent", "trade-settlement/0.1")
            .send()
            .await
            .map_err(|e| OracleError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(OracleError::Request(format!("HTTP {}", resp.status())));
        }

        let text = resp.text().await.map_err(|e| OracleError::Request(e.to_string()))?;
        let ticker: TickerPrice = serde_json::from_str(&text).map_err(|e| {
            OracleError::Parse(format!("{} - body: {}", e, text.chars().take(100).collect::<String>()))
        })?;

        debug!("Fetched {} = {}", symbol, ticker.price);
        Decimal::from_str(&ticker.price).map_err(|e| OracleError::Parse(e.to_string()))
    }
}

/// In-memory prices; used for demos and tests
#[derive(Default)]
pub struct StaticPriceOracle {
    prices: DashMap<Symbol, Decimal>,
    /// Number of upcoming calls that fail before prices are served
    failures_remaining: AtomicU32,
    calls: AtomicU32,
}

impl StaticPriceOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(self, symbol: Symbol, price: Decimal) -> Self {
        self.prices.insert(symbol, price);
        self
    }

    pub fn set_price(&self, symbol: Symbol, price: Decimal) {
        self.prices.insert(symbol, price);
    }

    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceOracle for StaticPriceOracle {
    async fn price(&self, symbol: Symbol) -> Result<Decimal, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(OracleError::Request("simulated outage".to_string()));
        }

        self.prices
            .get(&symbol)
            .map(|p| *p)
            .ok_or(OracleError::Missing(symbol))
    }
}

/// Fetch a mark price with a per-attempt timeout and fixed-delay retries.
/// Non-positive prices are treated as unavailable.
pub async fn fetch_mark_price(
    oracle: &dyn PriceOracle,
    symbol: Symbol,
    config: &OracleConfig,
) -> Result<Decimal, TradeError> {
    let attempts = config.max_retries + 1;

    for attempt in 1..=attempts {
        let result = match tokio::time::timeout(config.timeout, oracle.price(symbol)).await {
            Ok(inner) => inner,
            Err(_) => Err(OracleError::Timeout(config.timeout)),
        };

        match result {
            Ok(price) if price > Decimal::ZERO => return Ok(price),
            Ok(price) => {
                warn!("Oracle returned non-positive price {} for {}", price, symbol);
                return Err(TradeError::PriceUnavailable(symbol.to_string()));
            }
            Err(e) => {
                warn!("Price fetch for {} failed (attempt {}/{}): {}", symbol, attempt, attempts, e);
                if attempt < attempts {
                    tokio::time::sleep(config.retry_delay).await;
                }
            }
        }
    }

    Err(TradeError::PriceUnavailable(symbol.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fast_config() -> OracleConfig {
        OracleConfig {
            timeout: Duration::from_millis(200),
            max_retries: 2,
            retry_delay: Duration::from_millis(1),
        }
    }

    struct SlowOracle;

    #[async_trait]
    impl PriceOracle for SlowOracle {
        async fn price(&self, _symbol: Symbol) -> Result<Decimal, OracleError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(dec!(1))
        }
    }

    #[tokio::test]
    async fn test_recovers_within_retry_budget() {
        let oracle = StaticPriceOracle::new().with_price(Symbol::BtcUsdt, dec!(65000));
        oracle.fail_next(2);

        let price = fetch_mark_price(&oracle, Symbol::BtcUsdt, &fast_config()).await.unwrap();
        assert_eq!(price, dec!(65000));
        assert_eq!(oracle.calls(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_retries() {
        let oracle = StaticPriceOracle::new().with_price(Symbol::BtcUsdt, dec!(65000));
        oracle.fail_next(3);

        let err = fetch_mark_price(&oracle, Symbol::BtcUsdt, &fast_config()).await.unwrap_err();
        assert!(matches!(err, TradeError::PriceUnavailable(_)));
        assert!(err.is_retryable());
        assert_eq!(oracle.calls(), 3);
    }

    #[tokio::test]
    async fn test_zero_price_rejected() {
        let oracle = StaticPriceOracle::new().with_price(Symbol::EthUsdt, Decimal::ZERO);
        let err = fetch_mark_price(&oracle, Symbol::EthUsdt, &fast_config()).await.unwrap_err();
        assert!(matches!(err, TradeError::PriceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let config = OracleConfig {
            timeout: Duration::from_millis(10),
            max_retries: 1,
            retry_delay: Duration::from_millis(1),
        };
        let err = fetch_mark_price(&SlowOracle, Symbol::SolUsdt, &config).await.unwrap_err();
        assert!(matches!(err, TradeError::PriceUnavailable(_)));
    }
}
