//! The log service collaborator.
//!
//! The watcher never touches native handles or buffers itself; everything it
//! needs from the platform log service goes through [`Provider`]:
//! - Render contexts and record rendering
//! - Bookmark creation, update and serialization
//! - Channel subscriptions that push [`Notification`]s through a [`Notifier`]
//! - Publisher metadata for localized text
//!
//! [`MemoryProvider`] is an in-process implementation used by the tests and
//! benchmarks, and by embedders that feed records from their own sources.

mod dispatch;
pub mod memory;

pub use dispatch::{NotificationSink, Notifier};
pub use memory::{MemoryProvider, MemoryRecord, ProviderOp};

use crate::error::Result;
use crate::events::FieldSet;
use crate::types::{
    BookmarkHandle, ContextHandle, PublisherHandle, RawHandle, RecordHandle, SubscriptionHandle,
    TextKind,
};

/// Where the provider should start a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscribeStart {
    ToFutureEvents,
    AtOldestRecord,
    /// Uses `SubscribeRequest::bookmark`.
    AfterBookmark,
}

/// Arguments for `Provider::subscribe`.
#[derive(Clone, Debug)]
pub struct SubscribeRequest<'a> {
    pub channel: &'a str,
    /// XPath-like filter; `"*"` matches everything.
    pub query: &'a str,
    pub start: SubscribeStart,
    pub bookmark: Option<BookmarkHandle>,
}

/// What the provider pushes for a subscription.
#[derive(Clone, Debug)]
pub enum Notification {
    /// A record arrived. The handle is only valid until the notifier returns.
    Deliver(RecordHandle),
    /// The subscription reported a failure instead of a record.
    Error(String),
}

/// Abstract interface to the platform log service.
///
/// Implementations must deliver at most one notification at a time per
/// subscription, and `close` on a subscription handle must not return while
/// a notification for it is still running (unless called from inside that
/// notification).
pub trait Provider: Send + Sync + 'static {
    /// Create the render context for system properties.
    fn create_render_context(&self) -> Result<ContextHandle>;

    /// Create a bookmark, empty or from a serialized token. A malformed token
    /// fails with `InvalidBookmarkFormat` and allocates nothing.
    fn create_bookmark(&self, token: Option<&str>) -> Result<BookmarkHandle>;

    /// Reposition `bookmark` at `record`.
    fn update_bookmark(&self, bookmark: BookmarkHandle, record: RecordHandle) -> Result<()>;

    /// Serialize `bookmark`.
    fn render_bookmark(&self, bookmark: BookmarkHandle) -> Result<String>;

    /// Start a subscription. Every notification for it goes to `notifier`.
    fn subscribe(
        &self,
        request: &SubscribeRequest<'_>,
        notifier: Notifier,
    ) -> Result<SubscriptionHandle>;

    /// Render system properties of `record` using `context`.
    fn render_system_fields(&self, context: ContextHandle, record: RecordHandle)
        -> Result<FieldSet>;

    /// Render `record` as an XML document.
    fn render_xml(&self, record: RecordHandle) -> Result<String>;

    /// Open publisher metadata for the provider named in `fields`.
    fn resolve_publisher(&self, fields: &FieldSet) -> Result<PublisherHandle>;

    /// Format localized text of `kind` for `record`.
    fn format_text(
        &self,
        publisher: PublisherHandle,
        record: RecordHandle,
        kind: TextKind,
    ) -> Result<String>;

    /// Cancel pending work on `handle`.
    fn cancel(&self, handle: RawHandle) -> Result<()>;

    /// Release `handle`.
    fn close(&self, handle: RawHandle) -> Result<()>;
}
