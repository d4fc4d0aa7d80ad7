//! Fiat → crypto exchange rate with a short-lived cache.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::PriceConfig;

/// A rate and the monotonic instant it was fetched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceQuote {
    pub rate: f64,
    pub fetched_at: Instant,
}

#[derive(Debug, Error)]
enum FeedError {
    #[error("price feed request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("price feed returned status {0}")]
    Status(u16),

    #[error("price feed response has no number at {0}")]
    Missing(String),

    #[error("price feed returned a non-positive rate {0}")]
    Invalid(f64),
}

/// Serves the current rate, never failing.
///
/// A fresh cached quote is returned as is. Otherwise the feed is queried;
/// when that fails the last good quote is served even if stale, and with no
/// quote at all the configured fallback constant is used. Concurrent misses
/// may both fetch; the cache is last-write-wins.
pub struct PriceOracle {
    client: Client,
    feed_url: String,
    pointer: String,
    ttl: Duration,
    fallback_rate: f64,
    cache: Mutex<Option<PriceQuote>>,
}

impl PriceOracle {
    pub fn new(config: &PriceConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            feed_url: config.feed_url.clone(),
            pointer: config.json_pointer.clone(),
            ttl: Duration::from_secs(config.ttl_secs),
            fallback_rate: config.fallback_rate,
            cache: Mutex::new(None),
        })
    }

    /// Current rate, in fiat units per coin. Always positive.
    pub async fn rate(&self) -> f64 {
        let cached = self.cached();
        if let Some(quote) = cached
            && quote.fetched_at.elapsed() < self.ttl
        {
            return quote.rate;
        }

        match self.fetch().await {
            Ok(rate) => {
                debug!(rate, "price quote refreshed");
                self.store(PriceQuote {
                    rate,
                    fetched_at: Instant::now(),
                });
                rate
            }
            Err(e) => {
                let rate = cached.map(|q| q.rate).unwrap_or(self.fallback_rate);
                warn!(error = %e, rate, "price feed unavailable, serving last known rate");
                rate
            }
        }
    }

    /// The cached quote, if any, regardless of age.
    pub fn cached(&self) -> Option<PriceQuote> {
        *self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn store(&self, quote: PriceQuote) {
        *self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(quote);
    }

    async fn fetch(&self) -> Result<f64, FeedError> {
        let response = self.client.get(&self.feed_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status(status.as_u16()));
        }
        let body = response.json::<Value>().await?;
        parse_rate(&body, &self.pointer)
    }
}

fn parse_rate(body: &Value, pointer: &str) -> Result<f64, FeedError> {
    let rate = body
        .pointer(pointer)
        .and_then(Value::as_f64)
        .ok_or_else(|| FeedError::Missing(pointer.to_string()))?;
    if rate.is_finite() && rate > 0.0 {
        Ok(rate)
    } else {
        Err(FeedError::Invalid(rate))
    }
}
