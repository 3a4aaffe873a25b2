//! # Winlog Watcher
//!
//! Resumable watching of event log channels, with bookmark-based
//! at-least-once delivery.
//!
//! ## Core Concepts
//!
//! - **Provider**: The log service that stores, filters and renders records
//! - **Bookmark**: Serializable position in a channel, embedded in every event
//! - **Event**: Normalized snapshot of one record, with partial failures kept
//! - **Watcher**: Per-channel subscriptions feeding one event and one error stream
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use winlog_watcher::{MemoryProvider, MemoryRecord, Watcher};
//!
//! let provider = Arc::new(MemoryProvider::new());
//! provider.create_channel("Application");
//!
//! let watcher = Watcher::new(Arc::clone(&provider))?;
//! watcher.subscribe_from_now("Application", "*")?;
//!
//! provider.append("Application", MemoryRecord::new("Service Control Manager", 7036));
//!
//! let event = watcher.events().recv()?;
//! // Persist event.bookmark, then resume later with
//! // watcher.subscribe_from_bookmark("Application", "*", &event.bookmark)
//! let report = watcher.shutdown();
//! ```

pub mod bookmark;
pub mod error;
pub mod events;
pub mod provider;
pub mod types;
pub mod watcher;

// Re-exports
pub use bookmark::Bookmark;
pub use error::{Result, WatchError};
pub use events::{filetime_to_utc, utc_to_filetime, EventConverter, FieldSet, SystemProperty, Variant};
pub use provider::{
    MemoryProvider, MemoryRecord, Notification, NotificationSink, Notifier, Provider, ProviderOp,
    SubscribeRequest, SubscribeStart,
};
pub use types::*;
pub use watcher::{
    ShutdownReport, SubscribeOptions, SubscriptionState, Teardown, Watcher, WatcherConfig,
};
