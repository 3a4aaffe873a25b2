//! Per-channel subscription state.

use super::types::{SubscribeOptions, SubscriptionState, Teardown};
use crate::bookmark::Bookmark;
use crate::error::{Result, WatchError};
use crate::provider::{NotificationSink, Notifier, Provider, SubscribeRequest, SubscribeStart};
use crate::types::{RecordHandle, RenderOptions, StartMode, SubscriptionHandle};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

struct Lifecycle {
    state: SubscriptionState,
    handle: Option<SubscriptionHandle>,
    notifier: Option<Notifier>,
}

/// What registration hands over once the provider accepted the subscription.
struct Registered<P: Provider> {
    bookmark: Bookmark<P>,
    initial: String,
    notifier: Notifier,
    handle: SubscriptionHandle,
}

/// One channel's registration with the provider.
///
/// `lifecycle` is held across registration, so a concurrent close waits for
/// it. It is never held across `Provider::close`, which waits for in-flight
/// notifications that themselves read the state.
pub(crate) struct ChannelSubscription<P: Provider> {
    options: SubscribeOptions,
    lifecycle: Mutex<Lifecycle>,
    /// Only touched by this channel's notifications and by close.
    bookmark: Mutex<Option<Bookmark<P>>>,
    /// Position of the last event the consumer accepted.
    delivered: Mutex<String>,
    /// Dropped when draining starts, which aborts a blocked publish.
    cancel_tx: Mutex<Option<Sender<()>>>,
    cancel_rx: Receiver<()>,
}

impl<P: Provider> ChannelSubscription<P> {
    pub(crate) fn new(options: SubscribeOptions) -> Self {
        let (cancel_tx, cancel_rx) = bounded(0);
        Self {
            options,
            lifecycle: Mutex::new(Lifecycle {
                state: SubscriptionState::Unregistered,
                handle: None,
                notifier: None,
            }),
            bookmark: Mutex::new(None),
            delivered: Mutex::new(String::new()),
            cancel_tx: Mutex::new(Some(cancel_tx)),
            cancel_rx,
        }
    }

    pub(crate) fn channel(&self) -> &str {
        &self.options.channel
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        self.lifecycle.lock().state
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state() == SubscriptionState::Active
    }

    pub(crate) fn render_options(&self) -> Option<RenderOptions> {
        self.options.render
    }

    /// Disconnects once draining starts.
    pub(crate) fn cancelled(&self) -> &Receiver<()> {
        &self.cancel_rx
    }

    /// Allocate the bookmark, then register with the provider.
    pub(crate) fn register(&self, provider: &Arc<P>, sink: Weak<dyn NotificationSink>) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        // Closed before registration started: the watcher shut down.
        if lifecycle.state != SubscriptionState::Unregistered {
            return Err(WatchError::ShutDown);
        }
        lifecycle.state = SubscriptionState::Registering;

        match self.try_register(provider, sink) {
            Ok(registered) => {
                *self.bookmark.lock() = Some(registered.bookmark);
                *self.delivered.lock() = registered.initial;
                lifecycle.handle = Some(registered.handle);
                lifecycle.notifier = Some(registered.notifier);
                lifecycle.state = SubscriptionState::Active;
                Ok(())
            }
            Err(e) => {
                lifecycle.state = SubscriptionState::Closed;
                Err(e)
            }
        }
    }

    fn try_register(
        &self,
        provider: &Arc<P>,
        sink: Weak<dyn NotificationSink>,
    ) -> Result<Registered<P>> {
        let (mut bookmark, start) = match &self.options.start {
            StartMode::Bookmark(token) => (
                Bookmark::create_from_serialized(Arc::clone(provider), token)?,
                SubscribeStart::AfterBookmark,
            ),
            StartMode::Beginning => (
                Bookmark::create_empty(Arc::clone(provider))?,
                SubscribeStart::AtOldestRecord,
            ),
            StartMode::Now => (
                Bookmark::create_empty(Arc::clone(provider))?,
                SubscribeStart::ToFutureEvents,
            ),
        };

        let initial = match &self.options.start {
            StartMode::Bookmark(token) => token.clone(),
            _ => bookmark.serialize()?,
        };

        let notifier = Notifier::register(sink, &self.options.channel);
        let request = SubscribeRequest {
            channel: &self.options.channel,
            query: &self.options.query,
            start,
            bookmark: (start == SubscribeStart::AfterBookmark).then(|| bookmark.handle()),
        };

        match provider.subscribe(&request, notifier) {
            Ok(handle) => Ok(Registered {
                bookmark,
                initial,
                notifier,
                handle,
            }),
            Err(e) => {
                notifier.unregister();
                if let Err(release_err) = bookmark.release() {
                    tracing::warn!(
                        channel = %self.options.channel,
                        error = %release_err,
                        "failed to release bookmark after subscribe failure"
                    );
                }
                Err(e)
            }
        }
    }

    /// Advance the bookmark to `record` and serialize it. `None` once the
    /// bookmark has been released by close.
    pub(crate) fn advance(&self, record: RecordHandle) -> Result<Option<String>> {
        let mut guard = self.bookmark.lock();
        let Some(bookmark) = guard.as_mut() else {
            return Ok(None);
        };
        let wrap = |e: WatchError| WatchError::Bookmark {
            channel: self.options.channel.clone(),
            message: e.to_string(),
        };
        bookmark.advance_to(record).map_err(wrap)?;
        bookmark.serialize().map(Some).map_err(wrap)
    }

    pub(crate) fn mark_delivered(&self, bookmark: String) {
        *self.delivered.lock() = bookmark;
    }

    pub(crate) fn delivered(&self) -> String {
        self.delivered.lock().clone()
    }

    /// Drain and close. Release failures are collected, not returned early.
    ///
    /// Fails with `NoSubscriptionForChannel` if the subscription is not
    /// active, which covers a concurrent close and a failed registration.
    pub(crate) fn close(&self, provider: &P) -> Result<Teardown> {
        let (handle, notifier) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == SubscriptionState::Unregistered {
                // Nothing allocated yet; a later register fails.
                lifecycle.state = SubscriptionState::Closed;
            }
            if lifecycle.state != SubscriptionState::Active {
                return Err(WatchError::NoSubscriptionForChannel(
                    self.options.channel.clone(),
                ));
            }
            lifecycle.state = SubscriptionState::Draining;
            (lifecycle.handle.take(), lifecycle.notifier.take())
        };
        self.cancel_tx.lock().take();

        let mut errors = Vec::new();
        if let Some(handle) = handle {
            if let Err(e) = provider.cancel(handle.raw()) {
                errors.push(e);
            }
            if let Err(e) = provider.close(handle.raw()) {
                errors.push(e);
            }
        }
        if let Some(notifier) = notifier {
            notifier.unregister();
        }
        if let Some(bookmark) = self.bookmark.lock().take() {
            if let Err(e) = bookmark.release() {
                errors.push(e);
            }
        }

        for error in &errors {
            tracing::warn!(channel = %self.options.channel, %error, "subscription teardown failure");
        }

        let teardown = Teardown {
            channel: self.options.channel.clone(),
            bookmark: self.delivered(),
            errors,
        };
        self.lifecycle.lock().state = SubscriptionState::Closed;
        Ok(teardown)
    }
}
