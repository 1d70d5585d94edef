//! Currency models and the rate source seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RateError {
    #[error("rate source unavailable: {0}")]
    SourceUnavailable(String),
}

/// Static identity of a currency as published by the rate source.
///
/// `code` is the numeric ISO 4217 code. It is carried for display and
/// future use but does not participate in token matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Currency {
    pub name: String,
    pub symbol: String,
    pub code: Option<u32>,
}

/// A single currency→ruble quote. Immutable once fetched; the whole set
/// is replaced on refresh, never patched field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrencyRate {
    pub currency: Currency,
    pub rate_to_rub: f64,
    pub as_of: DateTime<Utc>,
}

#[async_trait]
pub trait RateSource: Send + Sync {
    /// Fetches the complete current rate set, never a delta.
    async fn fetch_rates(&self) -> Result<Vec<CurrencyRate>, RateError>;
}
