//! Channel watching.
//!
//! A [`Watcher`] owns one subscription per channel and bridges the provider's
//! push-style notifications into two pull-style streams:
//! - Events, one per delivered record, each with its resumption bookmark
//! - Errors, for notifications that could not become an event
//!
//! Subscriptions support:
//! - Starting at the oldest record, at new records only, or after a bookmark
//! - Provider-side query filters
//! - Per-subscription localized-text toggles
//!
//! Shutdown closes every subscription before the streams, so nothing is
//! published to a closed stream and no delivered position is lost.
//!
//! # Example
//!
//! ```ignore
//! let watcher = Watcher::new(provider)?;
//! watcher.subscribe_from_bookmark("Application", "*", &saved)?;
//!
//! for event in watcher.events() {
//!     ship(&event)?;
//!     saved = event.bookmark;
//! }
//! ```

mod manager;
mod subscription;
mod types;

pub use manager::Watcher;
pub use types::{ShutdownReport, SubscribeOptions, SubscriptionState, Teardown, WatcherConfig};
