//! Resumption bookmarks.
//!
//! A bookmark owns one provider bookmark handle and marks a position in a
//! single channel. It is advanced once per delivered record and serialized
//! into every event, so a consumer that persists the last event's bookmark
//! can resume after it.

use crate::error::{Result, WatchError};
use crate::provider::Provider;
use crate::types::{BookmarkHandle, RecordHandle};
use std::fmt;
use std::sync::Arc;

/// Opaque, serializable position in a channel.
///
/// Not synchronized: `advance_to` and `serialize` need `&mut self`, so
/// callers sharing a bookmark must wrap it in a lock.
pub struct Bookmark<P: Provider> {
    provider: Arc<P>,
    handle: BookmarkHandle,
    /// Serialized form of the current position, filled on demand.
    cached: Option<String>,
    released: bool,
}

impl<P: Provider> Bookmark<P> {
    /// Allocate a fresh, unpositioned bookmark.
    pub fn create_empty(provider: Arc<P>) -> Result<Self> {
        let handle = provider.create_bookmark(None)?;
        Ok(Self::from_handle(provider, handle))
    }

    /// Rebuild a bookmark from a token produced by [`Bookmark::serialize`].
    pub fn create_from_serialized(provider: Arc<P>, token: &str) -> Result<Self> {
        if token.trim().is_empty() {
            return Err(WatchError::InvalidBookmarkFormat(
                "empty bookmark token".to_string(),
            ));
        }
        let handle = provider.create_bookmark(Some(token))?;
        Ok(Self::from_handle(provider, handle))
    }

    fn from_handle(provider: Arc<P>, handle: BookmarkHandle) -> Self {
        Self {
            provider,
            handle,
            cached: None,
            released: false,
        }
    }

    pub fn handle(&self) -> BookmarkHandle {
        self.handle
    }

    /// Reposition at `record`.
    pub fn advance_to(&mut self, record: RecordHandle) -> Result<()> {
        self.cached = None;
        self.provider.update_bookmark(self.handle, record)
    }

    /// Serialized form of the current position.
    pub fn serialize(&mut self) -> Result<String> {
        if let Some(ref cached) = self.cached {
            return Ok(cached.clone());
        }
        let rendered = self.provider.render_bookmark(self.handle)?;
        self.cached = Some(rendered.clone());
        Ok(rendered)
    }

    /// Release the provider handle.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.provider.close(self.handle.raw())
    }
}

impl<P: Provider> Drop for Bookmark<P> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.provider.close(self.handle.raw()) {
            tracing::warn!(handle = ?self.handle, error = %e, "failed to release bookmark");
        }
    }
}

impl<P: Provider> fmt::Debug for Bookmark<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bookmark")
            .field("handle", &self.handle)
            .field("cached", &self.cached)
            .finish()
    }
}
