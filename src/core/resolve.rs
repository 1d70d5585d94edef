//! Query resolution: "<amount> <currency>" into ruble conversions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use super::currency::{CurrencyRate, RateError};
use super::expr::{self, ExprError};
use super::rates::RateCache;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("request cannot be empty")]
    EmptyRequest,
    #[error("request must be '<amount> <currency>' or '<currency>', got '{0}'")]
    MalformedRequest(String),
    #[error("currency is not recognized (empty)")]
    EmptyCurrency,
    #[error("currency '{0}' is not recognized")]
    UnknownCurrency(String),
    #[error(transparent)]
    Expr(#[from] ExprError),
    #[error(transparent)]
    Rates(#[from] RateError),
}

/// One resolved conversion. `converted_amount` is computed once at
/// construction and never recomputed against a later rate set.
#[derive(Debug, Clone)]
pub struct ResolvedConversion {
    pub id: Uuid,
    pub source_query: String,
    pub amount: f64,
    pub rate: CurrencyRate,
    pub converted_amount: f64,
    pub created_at: DateTime<Utc>,
}

impl ResolvedConversion {
    fn new(source_query: &str, amount: f64, rate: CurrencyRate) -> Self {
        let converted_amount = amount * rate.rate_to_rub;
        Self {
            id: Uuid::new_v4(),
            source_query: source_query.to_string(),
            amount,
            rate,
            converted_amount,
            created_at: Utc::now(),
        }
    }
}

pub struct QueryResolver {
    rates: Arc<RateCache>,
}

impl QueryResolver {
    pub fn new(rates: Arc<RateCache>) -> Self {
        Self { rates }
    }

    /// Resolves a free-text request into one conversion per matched rate,
    /// preserving match order. A missing amount defaults to 1.
    pub async fn resolve(&self, request: &str) -> Result<Vec<ResolvedConversion>, ResolveError> {
        let tokens: Vec<&str> = request.split_whitespace().map(str::trim).collect();
        let (amount_expr, currency_token) = match tokens.as_slice() {
            [] => return Err(ResolveError::EmptyRequest),
            [currency] => ("1", *currency),
            [amount, currency] => (*amount, *currency),
            _ => return Err(ResolveError::MalformedRequest(request.to_string())),
        };
        if currency_token.is_empty() {
            return Err(ResolveError::EmptyCurrency);
        }

        let amount = expr::evaluate(amount_expr)?;
        let matched = self.rates.match_token(currency_token).await?;
        if matched.is_empty() {
            return Err(ResolveError::UnknownCurrency(currency_token.to_string()));
        }

        Ok(matched
            .into_iter()
            .map(|rate| ResolvedConversion::new(request, amount, rate))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::currency::{Currency, RateSource};
    use async_trait::async_trait;
    use chrono::Duration;

    struct StaticSource(Vec<CurrencyRate>);

    #[async_trait]
    impl RateSource for StaticSource {
        async fn fetch_rates(&self) -> Result<Vec<CurrencyRate>, RateError> {
            Ok(self.0.clone())
        }
    }

    fn rate(name: &str, symbol: &str, rate_to_rub: f64) -> CurrencyRate {
        CurrencyRate {
            currency: Currency {
                name: name.to_string(),
                symbol: symbol.to_string(),
                code: None,
            },
            rate_to_rub,
            as_of: Utc::now(),
        }
    }

    fn resolver() -> QueryResolver {
        let source = Arc::new(StaticSource(vec![
            rate("US Dollar", "USD", 90.0),
            rate("Euro", "EUR", 100.0),
        ]));
        QueryResolver::new(Arc::new(RateCache::new(source, Duration::hours(24))))
    }

    #[tokio::test]
    async fn test_amount_expression_and_conversion() {
        let conversions = resolver().resolve("10*2 USD").await.unwrap();
        assert_eq!(conversions.len(), 1);
        assert_eq!(conversions[0].amount, 20.0);
        assert_eq!(conversions[0].converted_amount, 1800.0);
        assert_eq!(conversions[0].source_query, "10*2 USD");
    }

    #[tokio::test]
    async fn test_bare_currency_defaults_amount_to_one() {
        let resolver = resolver();
        let bare = resolver.resolve("USD").await.unwrap();
        let explicit = resolver.resolve("1 USD").await.unwrap();
        assert_eq!(bare[0].amount, explicit[0].amount);
        assert_eq!(bare[0].converted_amount, explicit[0].converted_amount);
        assert_eq!(bare[0].converted_amount, 90.0);
    }

    #[tokio::test]
    async fn test_empty_request() {
        assert!(matches!(
            resolver().resolve("  ").await,
            Err(ResolveError::EmptyRequest)
        ));
    }

    #[tokio::test]
    async fn test_three_tokens_is_malformed() {
        assert!(matches!(
            resolver().resolve("1 2 USD").await,
            Err(ResolveError::MalformedRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_currency() {
        assert!(matches!(
            resolver().resolve("5 pesos").await,
            Err(ResolveError::UnknownCurrency(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_amount_expression_propagates() {
        assert!(matches!(
            resolver().resolve("*5 USD").await,
            Err(ResolveError::Expr(_))
        ));
    }

    #[tokio::test]
    async fn test_ambiguous_token_yields_one_conversion_per_match() {
        // "dollar" matches by name containment only; "usd" exactly by symbol.
        let conversions = resolver().resolve("2 dollar").await.unwrap();
        assert_eq!(conversions.len(), 1);
        assert_eq!(conversions[0].rate.currency.symbol, "USD");
        assert_eq!(conversions[0].converted_amount, 180.0);
    }
}
