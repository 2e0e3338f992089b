use thiserror::Error;
use tidewatch_events::EventLogError;

use super::subscriber::DeliveryError;

/// Errors raised inside the stream engine. None of them are fatal to the
/// process; callers log them and carry on.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    EventLog(#[from] EventLogError),

    /// A blocking event log call panicked or was cancelled.
    #[error("event log task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
}
