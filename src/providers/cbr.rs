//! Bank of Russia daily quotes source.
//!
//! Fetches the official daily JSON document and normalizes per-nominal
//! quote values into per-unit ruble rates. This is the only component with
//! a mandatory network timeout: a hung fetch must never suspend a resolving
//! fire indefinitely.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::core::currency::{Currency, CurrencyRate, RateError, RateSource};
use crate::providers::util::with_retry;

pub struct CbrRateSource {
    base_url: String,
    timeout: Duration,
    retries: usize,
}

impl CbrRateSource {
    pub fn new(base_url: &str, timeout: Duration, retries: usize) -> Self {
        CbrRateSource {
            base_url: base_url.to_string(),
            timeout,
            retries,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DailyQuotes {
    #[serde(rename = "Date")]
    date: Option<DateTime<FixedOffset>>,
    #[serde(rename = "Valute")]
    valute: HashMap<String, Valute>,
}

#[derive(Debug, Deserialize)]
struct Valute {
    #[serde(rename = "NumCode")]
    num_code: String,
    #[serde(rename = "CharCode")]
    char_code: String,
    #[serde(rename = "Nominal")]
    nominal: f64,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value")]
    value: f64,
}

#[async_trait]
impl RateSource for CbrRateSource {
    async fn fetch_rates(&self) -> Result<Vec<CurrencyRate>, RateError> {
        let url = format!("{}/daily_json.js", self.base_url);
        debug!("Requesting daily quotes from {}", url);

        let client = reqwest::Client::builder()
            .user_agent("kurs/0.1")
            .timeout(self.timeout)
            .build()
            .map_err(|e| RateError::SourceUnavailable(e.to_string()))?;

        let response = with_retry(|| async { client.get(&url).send().await }, self.retries, 500)
            .await
            .map_err(|e| RateError::SourceUnavailable(format!("request to {url} failed: {e}")))?;

        let quotes: DailyQuotes = response
            .json()
            .await
            .map_err(|e| RateError::SourceUnavailable(format!("malformed daily quotes: {e}")))?;

        let as_of = quotes
            .date
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let mut rates = Vec::with_capacity(quotes.valute.len());
        for entry in quotes.valute.into_values() {
            if entry.nominal <= 0.0 {
                warn!(
                    "Skipping quote {} with non-positive nominal {}",
                    entry.char_code, entry.nominal
                );
                continue;
            }
            rates.push(CurrencyRate {
                currency: Currency {
                    name: entry.name,
                    symbol: entry.char_code,
                    code: entry.num_code.parse().ok(),
                },
                // Quotes are published per nominal (e.g. per 100 units).
                rate_to_rub: entry.value / entry.nominal,
                as_of,
            });
        }
        debug!("Fetched {} rates as of {}", rates.len(), as_of);
        Ok(rates)
    }
}
