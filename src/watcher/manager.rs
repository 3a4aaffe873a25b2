//! Watcher core: registry, notification handling and shutdown.

use super::subscription::ChannelSubscription;
use super::types::{ShutdownReport, SubscribeOptions, SubscriptionState, Teardown, WatcherConfig};
use crate::error::{Result, WatchError};
use crate::events::EventConverter;
use crate::provider::{Notification, NotificationSink, Provider};
use crate::types::{ContextHandle, Event, RecordHandle, RenderOptions, StartMode};
use crossbeam_channel::{bounded, never, select, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

struct Outputs {
    events: Sender<Event>,
    errors: Sender<WatchError>,
}

struct Registry<P: Provider> {
    /// Includes subscriptions still registering, so a duplicate is caught
    /// before the provider is called.
    subscriptions: HashMap<String, Arc<ChannelSubscription<P>>>,
    shut_down: bool,
}

/// State shared with notification threads.
struct Shared<P: Provider> {
    provider: Arc<P>,
    /// Taken on shutdown.
    context: Mutex<Option<ContextHandle>>,
    registry: Mutex<Registry<P>>,
    /// Publishers hold the read side; shutdown takes the write side to close
    /// the streams, so closing waits for every in-flight publish.
    outputs: RwLock<Option<Outputs>>,
    /// Dropped on shutdown to abort blocked publishes.
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    render: RwLock<RenderOptions>,
    /// Serializes concurrent shutdown calls.
    teardown: Mutex<()>,
}

impl<P: Provider> Shared<P> {
    fn lookup(&self, channel: &str) -> Option<Arc<ChannelSubscription<P>>> {
        self.registry.lock().subscriptions.get(channel).cloned()
    }

    /// Remove `sub` from the registry unless the slot was already reused.
    fn remove(&self, sub: &Arc<ChannelSubscription<P>>) {
        let mut registry = self.registry.lock();
        let same = registry
            .subscriptions
            .get(sub.channel())
            .is_some_and(|current| Arc::ptr_eq(current, sub));
        if same {
            registry.subscriptions.remove(sub.channel());
        }
    }

    /// Convert `record` and stamp the advanced bookmark on it. `None` if the
    /// watcher or subscription is already gone.
    fn build_event(
        &self,
        sub: &ChannelSubscription<P>,
        record: RecordHandle,
    ) -> Result<Option<Event>> {
        let Some(context) = *self.context.lock() else {
            return Ok(None);
        };
        let options = sub
            .render_options()
            .unwrap_or_else(|| *self.render.read());

        let mut event =
            EventConverter::new(&*self.provider, context, options).convert(record, sub.channel())?;
        match sub.advance(record)? {
            Some(bookmark) => event.bookmark = bookmark,
            None => return Ok(None),
        }
        Ok(Some(event))
    }

    /// Send `event`, racing the shutdown and drain signals.
    fn publish_event(&self, sub: &ChannelSubscription<P>, event: Event) -> bool {
        let outputs = self.outputs.read();
        let Some(outputs) = outputs.as_ref() else {
            return false;
        };
        select! {
            send(outputs.events, event) -> sent => sent.is_ok(),
            recv(self.shutdown_rx) -> _ => {
                tracing::debug!(channel = %sub.channel(), "shutdown won the publish race, event abandoned");
                false
            }
            recv(sub.cancelled()) -> _ => {
                tracing::debug!(channel = %sub.channel(), "subscription draining, event abandoned");
                false
            }
        }
    }

    fn publish_error(&self, sub: Option<&ChannelSubscription<P>>, error: WatchError) {
        let outputs = self.outputs.read();
        let Some(outputs) = outputs.as_ref() else {
            return;
        };
        let cancelled = sub.map_or_else(never, |s| s.cancelled().clone());
        select! {
            send(outputs.errors, error) -> _ => {}
            recv(self.shutdown_rx) -> _ => {}
            recv(cancelled) -> _ => {}
        }
    }
}

impl<P: Provider> NotificationSink for Shared<P> {
    fn notify(&self, channel: &str, notification: Notification) {
        let Some(sub) = self.lookup(channel) else {
            tracing::warn!(channel, "notification for a channel with no subscription");
            self.publish_error(None, WatchError::NoSubscriptionForChannel(channel.to_string()));
            return;
        };
        // Waits out a registration in progress.
        if !sub.is_active() {
            tracing::debug!(channel, state = ?sub.state(), "notification disregarded");
            return;
        }

        match notification {
            Notification::Deliver(record) => match self.build_event(&sub, record) {
                Ok(Some(event)) => {
                    let bookmark = event.bookmark.clone();
                    if self.publish_event(&sub, event) {
                        sub.mark_delivered(bookmark);
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::debug!(channel, %error, "record could not be converted");
                    self.publish_error(Some(&sub), error);
                }
            },
            Notification::Error(message) => {
                tracing::debug!(channel, %message, "provider reported a subscription error");
                self.publish_error(
                    Some(&sub),
                    WatchError::Notification {
                        channel: channel.to_string(),
                        message,
                    },
                );
            }
        }
    }
}

/// Watches log channels and streams their records as [`Event`]s.
///
/// Every subscribed channel feeds the same event and error streams. Each
/// event carries a bookmark that can be passed back to
/// [`Watcher::subscribe_from_bookmark`] to resume after it.
///
/// Dropping the watcher shuts it down.
pub struct Watcher<P: Provider> {
    shared: Arc<Shared<P>>,
    events: Receiver<Event>,
    errors: Receiver<WatchError>,
}

impl<P: Provider> Watcher<P> {
    /// Create a watcher with default configuration.
    pub fn new(provider: Arc<P>) -> Result<Self> {
        Self::with_config(provider, WatcherConfig::default())
    }

    /// Create a watcher. Allocates the shared render context.
    pub fn with_config(provider: Arc<P>, config: WatcherConfig) -> Result<Self> {
        let context = provider.create_render_context()?;
        let (events_tx, events) = bounded(config.event_buffer);
        let (errors_tx, errors) = bounded(config.error_buffer);
        let (shutdown_tx, shutdown_rx) = bounded(0);

        let shared = Arc::new(Shared {
            provider,
            context: Mutex::new(Some(context)),
            registry: Mutex::new(Registry {
                subscriptions: HashMap::new(),
                shut_down: false,
            }),
            outputs: RwLock::new(Some(Outputs {
                events: events_tx,
                errors: errors_tx,
            })),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            render: RwLock::new(config.render),
            teardown: Mutex::new(()),
        });

        tracing::info!(
            event_buffer = config.event_buffer,
            error_buffer = config.error_buffer,
            "watcher created"
        );
        Ok(Self {
            shared,
            events,
            errors,
        })
    }

    // --- Subscriptions ---

    /// Subscribe to a channel.
    ///
    /// Fails with `DuplicateSubscription` if the channel is already watched,
    /// without touching the provider.
    pub fn subscribe_with(&self, options: SubscribeOptions) -> Result<()> {
        let channel = options.channel.clone();
        let start = options.start.as_str();

        let sub = {
            let mut registry = self.shared.registry.lock();
            if registry.shut_down {
                return Err(WatchError::ShutDown);
            }
            if registry.subscriptions.contains_key(&channel) {
                return Err(WatchError::DuplicateSubscription(channel));
            }
            let sub = Arc::new(ChannelSubscription::new(options));
            registry
                .subscriptions
                .insert(channel.clone(), Arc::clone(&sub));
            sub
        };

        let weak: Weak<Shared<P>> = Arc::downgrade(&self.shared);
        let sink: Weak<dyn NotificationSink> = weak;
        if let Err(e) = sub.register(&self.shared.provider, sink) {
            self.shared.remove(&sub);
            tracing::warn!(channel = %channel, error = %e, "subscribe failed");
            return Err(e);
        }
        // Shutdown ran while this was registering. Whichever side gets to
        // the subscription second finds it closed.
        if self.shared.registry.lock().shut_down {
            if let Ok(teardown) = sub.close(&*self.shared.provider) {
                tracing::debug!(
                    channel = %channel,
                    clean = teardown.is_clean(),
                    "closed subscription registered during shutdown"
                );
            }
            self.shared.remove(&sub);
            return Err(WatchError::ShutDown);
        }

        tracing::info!(channel = %channel, start, "subscribed");
        Ok(())
    }

    /// Subscribe to records on `channel` matching `query`.
    pub fn subscribe(&self, channel: &str, query: &str, start: StartMode) -> Result<()> {
        self.subscribe_with(SubscribeOptions::new(channel, start).with_query(query))
    }

    /// Subscribe starting at the oldest record still in the channel.
    pub fn subscribe_from_beginning(&self, channel: &str, query: &str) -> Result<()> {
        self.subscribe(channel, query, StartMode::Beginning)
    }

    /// Subscribe to records that arrive from now on.
    pub fn subscribe_from_now(&self, channel: &str, query: &str) -> Result<()> {
        self.subscribe(channel, query, StartMode::Now)
    }

    /// Resume after the position in `bookmark`.
    pub fn subscribe_from_bookmark(&self, channel: &str, query: &str, bookmark: &str) -> Result<()> {
        self.subscribe(channel, query, StartMode::Bookmark(bookmark.to_string()))
    }

    /// Stop watching `channel`. The teardown carries the bookmark of the
    /// last delivered event.
    pub fn unsubscribe(&self, channel: &str) -> Result<Teardown> {
        let sub = {
            let registry = self.shared.registry.lock();
            if registry.shut_down {
                return Err(WatchError::ShutDown);
            }
            registry
                .subscriptions
                .get(channel)
                .cloned()
                .ok_or_else(|| WatchError::NoSubscriptionForChannel(channel.to_string()))?
        };

        let teardown = sub.close(&*self.shared.provider)?;
        self.shared.remove(&sub);
        tracing::info!(channel, clean = teardown.is_clean(), "unsubscribed");
        Ok(teardown)
    }

    /// Close every subscription, release the render context, then close both
    /// streams. Blocks until in-flight notifications are done. Later calls
    /// return an empty report.
    pub fn shutdown(&self) -> ShutdownReport {
        let _teardown = self.shared.teardown.lock();
        let subscriptions: Vec<_> = {
            let mut registry = self.shared.registry.lock();
            if registry.shut_down {
                return ShutdownReport::default();
            }
            registry.shut_down = true;
            registry.subscriptions.values().cloned().collect()
        };
        self.shared.shutdown_tx.lock().take();

        let mut report = ShutdownReport::default();
        for sub in subscriptions {
            match sub.close(&*self.shared.provider) {
                Ok(teardown) => report.channels.push(teardown),
                Err(error) => {
                    tracing::debug!(channel = %sub.channel(), %error, "subscription already closed");
                }
            }
        }
        report.channels.sort_by(|a, b| a.channel.cmp(&b.channel));
        self.shared.registry.lock().subscriptions.clear();

        if let Some(context) = self.shared.context.lock().take() {
            if let Err(error) = self.shared.provider.close(context.raw()) {
                tracing::warn!(%error, "failed to release render context");
                report.context_error = Some(error);
            }
        }
        self.shared.outputs.write().take();

        tracing::info!(
            channels = report.channels.len(),
            clean = report.is_clean(),
            "watcher shut down"
        );
        report
    }

    // --- Streams ---

    /// Converted events from every channel. Disconnects after shutdown.
    pub fn events(&self) -> Receiver<Event> {
        self.events.clone()
    }

    /// Failures that prevented an event from being produced.
    pub fn errors(&self) -> Receiver<WatchError> {
        self.errors.clone()
    }

    // --- Introspection ---

    /// Channels with an active subscription, sorted.
    pub fn channels(&self) -> Vec<String> {
        let subscriptions: Vec<_> = self
            .shared
            .registry
            .lock()
            .subscriptions
            .values()
            .cloned()
            .collect();
        let mut channels: Vec<_> = subscriptions
            .iter()
            .filter(|sub| sub.is_active())
            .map(|sub| sub.channel().to_string())
            .collect();
        channels.sort();
        channels
    }

    /// Bookmark of the last event delivered on `channel`, or its starting
    /// position if nothing was delivered yet.
    pub fn bookmark(&self, channel: &str) -> Result<String> {
        match self.shared.lookup(channel) {
            Some(sub) if sub.is_active() => Ok(sub.delivered()),
            _ => Err(WatchError::NoSubscriptionForChannel(channel.to_string())),
        }
    }

    /// Lifecycle state of the subscription on `channel`, if there is one.
    pub fn state(&self, channel: &str) -> Option<SubscriptionState> {
        self.shared.lookup(channel).map(|sub| sub.state())
    }

    // --- Localized text toggles ---

    /// Toggles used by subscriptions without their own. Takes effect from the
    /// next notification.
    pub fn set_render_options(&self, options: RenderOptions) {
        *self.shared.render.write() = options;
    }

    /// Toggles currently used by subscriptions without their own.
    pub fn render_options(&self) -> RenderOptions {
        *self.shared.render.read()
    }

    /// Resolve the formatted message text.
    pub fn set_render_message(&self, render: bool) {
        self.shared.render.write().message = render;
    }

    /// Resolve the level name.
    pub fn set_render_level(&self, render: bool) {
        self.shared.render.write().level = render;
    }

    /// Resolve the task name.
    pub fn set_render_task(&self, render: bool) {
        self.shared.render.write().task = render;
    }

    /// Resolve the provider display name.
    pub fn set_render_provider(&self, render: bool) {
        self.shared.render.write().provider = render;
    }

    /// Resolve the opcode name.
    pub fn set_render_opcode(&self, render: bool) {
        self.shared.render.write().opcode = render;
    }

    /// Resolve the channel display name.
    pub fn set_render_channel(&self, render: bool) {
        self.shared.render.write().channel = render;
    }

    /// Resolve the message text for the event id.
    pub fn set_render_id(&self, render: bool) {
        self.shared.render.write().id = render;
    }
}

impl<P: Provider> Drop for Watcher<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
