//! Rate cache with copy-on-write index publication.
//!
//! The cache owns the current rate set and its derived lookup index.
//! Refreshes build a brand new index off to the side and publish it with a
//! single swap under a short write lock, so readers keep resolving against
//! the previous index while a refresh is in flight.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::currency::{CurrencyRate, RateError, RateSource};

/// Lookup structure derived from one rate set: lower-cased name and symbol
/// labels mapped to their rate. Rebuilt from scratch on every refresh.
#[derive(Default)]
struct RateIndex {
    by_name: BTreeMap<String, CurrencyRate>,
    by_symbol: BTreeMap<String, CurrencyRate>,
}

impl RateIndex {
    fn build(rates: Vec<CurrencyRate>) -> Self {
        let mut index = RateIndex::default();
        for rate in rates {
            index
                .by_name
                .insert(rate.currency.name.to_lowercase(), rate.clone());
            index
                .by_symbol
                .insert(rate.currency.symbol.to_lowercase(), rate);
        }
        index
    }

    /// Exact key first, substring containment as the fallback. The exact
    /// hit short-circuits the scan within its dimension only.
    fn match_dimension(dimension: &BTreeMap<String, CurrencyRate>, token: &str) -> Vec<CurrencyRate> {
        if let Some(rate) = dimension.get(token) {
            return vec![rate.clone()];
        }
        dimension
            .iter()
            .filter(|(label, _)| label.contains(token))
            .map(|(_, rate)| rate.clone())
            .collect()
    }

    /// Union across dimensions in dimension order, name before symbol,
    /// without deduplication. Callers handle duplicate-looking results.
    fn lookup(&self, token: &str) -> Vec<CurrencyRate> {
        let mut matched = Self::match_dimension(&self.by_name, token);
        matched.extend(Self::match_dimension(&self.by_symbol, token));
        matched
    }
}

struct Published {
    index: Arc<RateIndex>,
    refreshed_at: Option<DateTime<Utc>>,
}

pub struct RateCache {
    source: Arc<dyn RateSource>,
    published: RwLock<Published>,
    refresh_gate: Mutex<()>,
    freshness: Duration,
}

impl RateCache {
    pub fn new(source: Arc<dyn RateSource>, freshness: Duration) -> Self {
        Self {
            source,
            published: RwLock::new(Published {
                index: Arc::new(RateIndex::default()),
                refreshed_at: None,
            }),
            refresh_gate: Mutex::new(()),
            freshness,
        }
    }

    /// Fetches the full rate set and atomically swaps in a fresh index.
    /// All-or-nothing: on failure the previous index stays published.
    pub async fn refresh(&self) -> Result<(), RateError> {
        let _gate = self.refresh_gate.lock().await;
        self.fetch_and_publish().await
    }

    /// Resolves a user-supplied token against the current index, refreshing
    /// first when no refresh ever happened or the index has gone stale.
    /// An empty result means "no match" and is not an error.
    pub async fn match_token(&self, token: &str) -> Result<Vec<CurrencyRate>, RateError> {
        self.ensure_fresh().await?;
        let index = self.published.read().unwrap().index.clone();
        Ok(index.lookup(&token.to_lowercase()))
    }

    async fn ensure_fresh(&self) -> Result<(), RateError> {
        if self.is_fresh() {
            return Ok(());
        }
        let _gate = self.refresh_gate.lock().await;
        // Another task may have finished a refresh while we waited on the gate.
        if self.is_fresh() {
            return Ok(());
        }
        debug!("Rate index missing or stale, refreshing");
        self.fetch_and_publish().await
    }

    async fn fetch_and_publish(&self) -> Result<(), RateError> {
        let rates = self.source.fetch_rates().await?;
        if rates.is_empty() {
            return Err(RateError::SourceUnavailable(
                "rate source returned an empty set".to_string(),
            ));
        }
        let count = rates.len();
        let index = Arc::new(RateIndex::build(rates));
        let mut published = self.published.write().unwrap();
        published.index = index;
        published.refreshed_at = Some(Utc::now());
        info!("Published fresh rate index with {count} currencies");
        Ok(())
    }

    fn is_fresh(&self) -> bool {
        match self.published.read().unwrap().refreshed_at {
            Some(at) => Utc::now() - at < self.freshness,
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_refresh(&self, age: Duration) {
        let mut published = self.published.write().unwrap();
        if let Some(at) = published.refreshed_at {
            debug!("Backdating last refresh by {age}");
            published.refreshed_at = Some(at - age);
        }
    }
}
