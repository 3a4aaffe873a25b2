//! Watcher configuration and result types.

use crate::error::WatchError;
use crate::types::{RenderOptions, StartMode};

/// Configuration for a watcher.
#[derive(Clone, Debug)]
pub struct WatcherConfig {
    /// Events buffered before notification threads block on the consumer.
    /// Zero makes every delivery a rendezvous.
    /// Default: 1000
    pub event_buffer: usize,

    /// Errors buffered before notification threads block on the consumer.
    /// Default: 100
    pub error_buffer: usize,

    /// Localized-text toggles for subscriptions without their own.
    pub render: RenderOptions,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            event_buffer: 1000,
            error_buffer: 100,
            render: RenderOptions::default(),
        }
    }
}

/// A subscription request.
#[derive(Clone, Debug)]
pub struct SubscribeOptions {
    pub channel: String,

    /// XPath-like filter evaluated by the provider. `"*"` matches everything.
    pub query: String,

    pub start: StartMode,

    /// Overrides the watcher's localized-text toggles for this channel.
    pub render: Option<RenderOptions>,
}

impl SubscribeOptions {
    /// Subscribe to every record on `channel`.
    pub fn new(channel: impl Into<String>, start: StartMode) -> Self {
        Self {
            channel: channel.into(),
            query: "*".to_string(),
            start,
            render: None,
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn with_render(mut self, render: RenderOptions) -> Self {
        self.render = Some(render);
        self
    }
}

/// Lifecycle of a channel subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Unregistered,
    /// Bookmark allocated, provider subscription being created.
    Registering,
    /// Receiving notifications.
    Active,
    /// Cancellation requested; notifications are disregarded.
    Draining,
    /// All resources released. Terminal.
    Closed,
}

/// Outcome of closing one subscription.
#[derive(Clone, Debug)]
pub struct Teardown {
    pub channel: String,

    /// Bookmark of the last event delivered to the consumer, or the starting
    /// position if nothing was delivered.
    pub bookmark: String,

    /// Release failures. Teardown continues past each one.
    pub errors: Vec<WatchError>,
}

impl Teardown {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Outcome of shutting a watcher down.
#[derive(Clone, Debug, Default)]
pub struct ShutdownReport {
    /// One entry per subscription that was active.
    pub channels: Vec<Teardown>,

    /// Failure releasing the shared render context.
    pub context_error: Option<WatchError>,
}

impl ShutdownReport {
    /// Final bookmark for `channel`.
    pub fn bookmark(&self, channel: &str) -> Option<&str> {
        self.channels
            .iter()
            .find(|t| t.channel == channel)
            .map(|t| t.bookmark.as_str())
    }

    /// Every failure, tagged with its channel (`None` for the render context).
    pub fn errors(&self) -> impl Iterator<Item = (Option<&str>, &WatchError)> {
        self.channels
            .iter()
            .flat_map(|t| t.errors.iter().map(move |e| (Some(t.channel.as_str()), e)))
            .chain(self.context_error.iter().map(|e| (None, e)))
    }

    pub fn is_clean(&self) -> bool {
        self.errors().next().is_none()
    }
}
