//! Delivery seam for scheduled conversion results.

use async_trait::async_trait;
use console::style;
use thiserror::Error;

use super::resolve::ResolvedConversion;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("failed to deliver notification: {0}")]
    DeliveryFailed(String),
}

/// A trait for delivering a resolved conversion to a subscriber's chat
/// address. Concrete channels (console, a chat platform bridge) implement
/// this; the scheduler never knows which one it is talking to.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends a message to a chat address. `markup` is an optional
    /// channel-specific action payload; channels without actions ignore it.
    async fn send(
        &self,
        chat_address: &str,
        message: &str,
        markup: Option<&str>,
    ) -> Result<(), NotifyError>;
}

/// Renders one conversion as a single delivery line.
pub fn format_conversion(conversion: &ResolvedConversion) -> String {
    format!(
        "{} {} = {:.2} RUB (rate {:.4})",
        conversion.amount,
        conversion.rate.currency.symbol,
        conversion.converted_amount,
        conversion.rate.rate_to_rub
    )
}

/// Prints deliveries to the terminal.
pub struct ConsoleNotifier;

#[async_trait]
impl Notifier for ConsoleNotifier {
    async fn send(
        &self,
        chat_address: &str,
        message: &str,
        _markup: Option<&str>,
    ) -> Result<(), NotifyError> {
        println!(
            "{} {}",
            style(format!("[{chat_address}]")).dim(),
            style(message).green()
        );
        Ok(())
    }
}
