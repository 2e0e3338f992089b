//! Error types for the event log.

/// Errors that can occur during event log operations.
#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    /// A database operation failed.
    #[error("event log database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No pooled connection could be obtained.
    #[error("event log pool error: {0}")]
    Pool(#[from] r2d2::Error),
}
