//! Error types for the watcher.

use thiserror::Error;

/// Main error type for watcher operations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WatchError {
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Invalid bookmark format: {0}")]
    InvalidBookmarkFormat(String),

    #[error("A subscription for channel {0:?} already exists")]
    DuplicateSubscription(String),

    #[error("Failed to render event values and XML: fields: {fields}; xml: {xml}")]
    EventRenderFailed { fields: String, xml: String },

    #[error("No subscription for channel {0:?}")]
    NoSubscriptionForChannel(String),

    #[error("Event log callback for channel {channel:?} got error: {message}")]
    Notification { channel: String, message: String },

    #[error("Bookmark error on channel {channel:?}: {message}")]
    Bookmark { channel: String, message: String },

    #[error("Watcher has been shut down")]
    ShutDown,
}

impl WatchError {
    /// Shorthand for a provider failure.
    pub fn provider(message: impl Into<String>) -> Self {
        WatchError::Provider(message.into())
    }
}

/// Result type for watcher operations.
pub type Result<T> = std::result::Result<T, WatchError>;
