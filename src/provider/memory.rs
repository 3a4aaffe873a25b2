//! In-process provider backed by plain vectors.
//!
//! Channels hold records in append order with ids starting at 1. Every
//! subscription gets its own delivery thread, so notifications arrive off the
//! caller's thread, one at a time per subscription, the way the platform
//! service delivers them. Bookmarks serialize to the platform's XML form.
//!
//! Any operation can be told to fail through [`MemoryProvider::fail`], which
//! is how the tests reach the error paths.

use super::{Notifier, Provider, SubscribeRequest, SubscribeStart};
use crate::error::{Result, WatchError};
use crate::events::{utc_to_filetime, FieldSet, SystemProperty, Variant};
use crate::types::{
    BookmarkHandle, ContextHandle, PublisherHandle, RawHandle, RecordHandle, SubscriptionHandle,
    TextKind,
};
use chrono::{DateTime, SecondsFormat, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

/// Operations that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProviderOp {
    CreateRenderContext,
    CreateBookmark,
    UpdateBookmark,
    RenderBookmark,
    Subscribe,
    RenderSystemFields,
    RenderXml,
    ResolvePublisher,
    Cancel,
    Close,
}

/// A record to append to a channel.
#[derive(Clone, Debug)]
pub struct MemoryRecord {
    provider: String,
    provider_guid: Option<String>,
    event_id: u16,
    qualifiers: Option<u16>,
    level: u8,
    task: u16,
    opcode: u8,
    keywords: u64,
    created: DateTime<Utc>,
    activity_id: Option<String>,
    process_id: u32,
    thread_id: u32,
    computer: String,
    user_id: Option<String>,
    version: u8,
    message: Option<String>,
    // Assigned on append.
    channel: String,
    record_id: u64,
}

impl MemoryRecord {
    /// An informational record from `provider`, created now.
    pub fn new(provider: impl Into<String>, event_id: u16) -> Self {
        Self {
            provider: provider.into(),
            provider_guid: None,
            event_id,
            qualifiers: None,
            level: 4,
            task: 0,
            opcode: 0,
            keywords: 0x0080_0000_0000_0000,
            created: Utc::now(),
            activity_id: None,
            process_id: 0,
            thread_id: 0,
            computer: "localhost".to_string(),
            user_id: None,
            version: 0,
            message: None,
            channel: String::new(),
            record_id: 0,
        }
    }

    pub fn provider_guid(mut self, guid: impl Into<String>) -> Self {
        self.provider_guid = Some(guid.into());
        self
    }

    pub fn qualifiers(mut self, qualifiers: u16) -> Self {
        self.qualifiers = Some(qualifiers);
        self
    }

    pub fn level(mut self, level: u8) -> Self {
        self.level = level;
        self
    }

    pub fn task(mut self, task: u16) -> Self {
        self.task = task;
        self
    }

    pub fn opcode(mut self, opcode: u8) -> Self {
        self.opcode = opcode;
        self
    }

    pub fn keywords(mut self, keywords: u64) -> Self {
        self.keywords = keywords;
        self
    }

    pub fn created(mut self, created: DateTime<Utc>) -> Self {
        self.created = created;
        self
    }

    pub fn activity(mut self, guid: impl Into<String>) -> Self {
        self.activity_id = Some(guid.into());
        self
    }

    pub fn process(mut self, process_id: u32, thread_id: u32) -> Self {
        self.process_id = process_id;
        self.thread_id = thread_id;
        self
    }

    pub fn computer(mut self, computer: impl Into<String>) -> Self {
        self.computer = computer.into();
        self
    }

    pub fn user(mut self, sid: impl Into<String>) -> Self {
        self.user_id = Some(sid.into());
        self
    }

    pub fn version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Formatted message text. Without one, message formatting fails the way
    /// it does for a publisher with no matching message resource.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    fn fields(&self) -> FieldSet {
        use SystemProperty::*;

        let optional = |value: &Option<String>, wrap: fn(String) -> Variant| {
            value.clone().map(wrap).unwrap_or(Variant::Null)
        };
        FieldSet::from_properties([
            (ProviderName, Variant::String(self.provider.clone())),
            (ProviderGuid, optional(&self.provider_guid, Variant::Guid)),
            (EventId, Variant::UInt16(self.event_id)),
            (
                Qualifiers,
                self.qualifiers.map(Variant::UInt16).unwrap_or(Variant::Null),
            ),
            (Level, Variant::Byte(self.level)),
            (Task, Variant::UInt16(self.task)),
            (Opcode, Variant::Byte(self.opcode)),
            (Keywords, Variant::HexInt64(self.keywords)),
            (
                TimeCreated,
                Variant::FileTime(utc_to_filetime(self.created).unwrap_or(0)),
            ),
            (EventRecordId, Variant::UInt64(self.record_id)),
            (ActivityId, optional(&self.activity_id, Variant::Guid)),
            (ProcessId, Variant::UInt32(self.process_id)),
            (ThreadId, Variant::UInt32(self.thread_id)),
            (Channel, Variant::String(self.channel.clone())),
            (Computer, Variant::String(self.computer.clone())),
            (UserId, optional(&self.user_id, Variant::Sid)),
            (Version, Variant::Byte(self.version)),
        ])
    }

    fn to_xml(&self) -> String {
        let mut xml = String::from(
            "<Event xmlns='http://schemas.microsoft.com/win/2004/08/events/event'><System>",
        );
        xml.push_str(&format!("<Provider Name='{}'", escape(&self.provider)));
        if let Some(guid) = &self.provider_guid {
            xml.push_str(&format!(" Guid='{}'", escape(guid)));
        }
        xml.push_str("/>");
        xml.push_str(&match self.qualifiers {
            Some(q) => format!("<EventID Qualifiers='{}'>{}</EventID>", q, self.event_id),
            None => format!("<EventID>{}</EventID>", self.event_id),
        });
        xml.push_str(&format!(
            "<Version>{}</Version><Level>{}</Level><Task>{}</Task><Opcode>{}</Opcode><Keywords>{:#x}</Keywords>",
            self.version, self.level, self.task, self.opcode, self.keywords
        ));
        xml.push_str(&format!(
            "<TimeCreated SystemTime='{}'/><EventRecordID>{}</EventRecordID>",
            self.created.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            self.record_id
        ));
        match &self.activity_id {
            Some(activity) => {
                xml.push_str(&format!("<Correlation ActivityID='{}'/>", escape(activity)))
            }
            None => xml.push_str("<Correlation/>"),
        }
        xml.push_str(&format!(
            "<Execution ProcessID='{}' ThreadID='{}'/><Channel>{}</Channel><Computer>{}</Computer>",
            self.process_id,
            self.thread_id,
            escape(&self.channel),
            escape(&self.computer)
        ));
        match &self.user_id {
            Some(sid) => xml.push_str(&format!("<Security UserID='{}'/>", escape(sid))),
            None => xml.push_str("<Security/>"),
        }
        xml.push_str("</System>");
        if let Some(message) = &self.message {
            xml.push_str(&format!(
                "<EventData><Data>{}</Data></EventData>",
                escape(message)
            ));
        }
        xml.push_str("</Event>");
        xml
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&apos;", "'")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

fn level_name(level: u8) -> &'static str {
    match level {
        1 => "Critical",
        2 => "Error",
        3 => "Warning",
        5 => "Verbose",
        _ => "Information",
    }
}

fn opcode_name(opcode: u8) -> String {
    match opcode {
        0 => "Info".to_string(),
        1 => "Start".to_string(),
        2 => "Stop".to_string(),
        n => format!("Opcode {}", n),
    }
}

/// Position of a bookmark: channel and the id of the last record read.
type Position = Option<(String, u64)>;

const BOOKMARK_OPEN: &str = "<BookmarkList>";
const BOOKMARK_CLOSE: &str = "</BookmarkList>";

fn render_bookmark_xml(position: &Position) -> String {
    match position {
        Some((channel, record_id)) => format!(
            "{}\r\n  <Bookmark Channel='{}' RecordId='{}' IsCurrent='true'/>\r\n{}",
            BOOKMARK_OPEN,
            escape(channel),
            record_id,
            BOOKMARK_CLOSE
        ),
        None => format!("{}\r\n{}", BOOKMARK_OPEN, BOOKMARK_CLOSE),
    }
}

fn parse_bookmark_xml(token: &str) -> Result<Position> {
    let invalid = |detail: &str| WatchError::InvalidBookmarkFormat(detail.to_string());

    let body = token
        .trim()
        .strip_prefix(BOOKMARK_OPEN)
        .and_then(|rest| rest.strip_suffix(BOOKMARK_CLOSE))
        .ok_or_else(|| invalid("expected a BookmarkList element"))?
        .trim();
    if body.is_empty() {
        return Ok(None);
    }

    let entry = body
        .strip_prefix("<Bookmark ")
        .and_then(|rest| rest.strip_suffix("/>"))
        .ok_or_else(|| invalid("expected a single Bookmark element"))?;
    let channel = attribute(entry, "Channel").ok_or_else(|| invalid("missing Channel"))?;
    let record_id = attribute(entry, "RecordId")
        .and_then(|id| id.parse::<u64>().ok())
        .ok_or_else(|| invalid("missing or malformed RecordId"))?;
    Ok(Some((unescape(channel), record_id)))
}

fn attribute<'a>(element: &'a str, name: &str) -> Option<&'a str> {
    let marker = format!("{}='", name);
    let start = element.find(&marker)? + marker.len();
    let len = element[start..].find('\'')?;
    Some(&element[start..start + len])
}

/// Record filter parsed from a subscription query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Filter {
    All,
    Level(u8),
    EventId(u16),
}

impl Filter {
    /// Accepts `*`, and `*[System[Level=N]]` or `*[System[EventID=N]]` with
    /// optional parentheses around the predicate.
    fn parse(query: &str) -> Result<Self> {
        let query = query.trim();
        if query.is_empty() || query == "*" {
            return Ok(Filter::All);
        }
        let invalid = || WatchError::provider(format!("the specified query is invalid: {:?}", query));

        let predicate = query
            .strip_prefix("*[System[")
            .and_then(|rest| rest.strip_suffix("]]"))
            .ok_or_else(invalid)?
            .trim_start_matches('(')
            .trim_end_matches(')');
        let (name, value) = predicate.split_once('=').ok_or_else(invalid)?;
        match name.trim() {
            "Level" => value.trim().parse().map(Filter::Level).map_err(|_| invalid()),
            "EventID" => value.trim().parse().map(Filter::EventId).map_err(|_| invalid()),
            _ => Err(invalid()),
        }
    }

    fn matches(self, record: &MemoryRecord) -> bool {
        match self {
            Filter::All => true,
            Filter::Level(level) => record.level == level,
            Filter::EventId(id) => record.event_id == id,
        }
    }
}

enum Work {
    Record(Arc<MemoryRecord>),
    Error(String),
}

struct Worker {
    channel: String,
    filter: Filter,
    queue: Mutex<Option<Sender<Work>>>,
    cancelled: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn push(&self, work: Work) {
        if let Some(queue) = self.queue.lock().as_ref() {
            let _ = queue.send(work);
        }
    }
}

enum Entry {
    Context,
    Bookmark(Position),
    Record(Arc<MemoryRecord>),
    Publisher,
    Subscription(Arc<Worker>),
}

#[derive(Default)]
struct ChannelLog {
    records: Vec<Arc<MemoryRecord>>,
    next_id: u64,
    subscribers: Vec<u64>,
}

#[derive(Default)]
struct State {
    channels: HashMap<String, ChannelLog>,
    handles: HashMap<u64, Entry>,
    next_handle: u64,
    failing: HashSet<ProviderOp>,
    failing_text: HashSet<TextKind>,
}

impl State {
    fn allocate(&mut self, entry: Entry) -> u64 {
        self.next_handle += 1;
        let id = self.next_handle;
        self.handles.insert(id, entry);
        id
    }

    fn check(&self, op: ProviderOp) -> Result<()> {
        if self.failing.contains(&op) {
            return Err(WatchError::provider(format!("injected failure in {:?}", op)));
        }
        Ok(())
    }

    fn record(&self, handle: RecordHandle) -> Result<Arc<MemoryRecord>> {
        match self.handles.get(&handle.0) {
            Some(Entry::Record(record)) => Ok(Arc::clone(record)),
            _ => Err(invalid_handle(handle.raw())),
        }
    }
}

fn invalid_handle(handle: RawHandle) -> WatchError {
    WatchError::provider(format!("the handle is invalid: {:?}", handle))
}

struct Inner {
    state: Mutex<State>,
    close_failures: AtomicU64,
    subscribe_calls: AtomicU64,
}

/// In-process [`Provider`].
///
/// Clones share the same channels and handles.
#[derive(Clone)]
pub struct MemoryProvider {
    inner: Arc<Inner>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                close_failures: AtomicU64::new(0),
                subscribe_calls: AtomicU64::new(0),
            }),
        }
    }

    /// Create an empty channel. No-op if it exists.
    pub fn create_channel(&self, channel: &str) {
        self.inner
            .state
            .lock()
            .channels
            .entry(channel.to_string())
            .or_default();
    }

    /// Append `record` to `channel`, creating the channel if needed, and
    /// queue it for every matching subscription. Returns the record id.
    pub fn append(&self, channel: &str, mut record: MemoryRecord) -> u64 {
        let mut state = self.inner.state.lock();
        let State {
            channels, handles, ..
        } = &mut *state;
        let log = channels.entry(channel.to_string()).or_default();

        log.next_id += 1;
        record.channel = channel.to_string();
        record.record_id = log.next_id;
        let record = Arc::new(record);
        log.records.push(Arc::clone(&record));

        for key in &log.subscribers {
            if let Some(Entry::Subscription(worker)) = handles.get(key) {
                if worker.filter.matches(&record) {
                    worker.push(Work::Record(Arc::clone(&record)));
                }
            }
        }
        record.record_id
    }

    /// Drop every record of `channel` with an id up to and including `up_to`.
    pub fn purge(&self, channel: &str, up_to: u64) {
        if let Some(log) = self.inner.state.lock().channels.get_mut(channel) {
            log.records.retain(|record| record.record_id > up_to);
        }
    }

    /// Make every subscription on `channel` report `message` as a failure.
    pub fn notify_error(&self, channel: &str, message: &str) {
        let state = self.inner.state.lock();
        let Some(log) = state.channels.get(channel) else {
            return;
        };
        for key in &log.subscribers {
            if let Some(Entry::Subscription(worker)) = state.handles.get(key) {
                worker.push(Work::Error(message.to_string()));
            }
        }
    }

    /// Open a handle to a stored record. The caller closes it.
    pub fn open_record(&self, channel: &str, record_id: u64) -> Result<RecordHandle> {
        let mut state = self.inner.state.lock();
        let record = state
            .channels
            .get(channel)
            .and_then(|log| log.records.iter().find(|r| r.record_id == record_id))
            .cloned()
            .ok_or_else(|| {
                WatchError::provider(format!("record {} not found in {:?}", record_id, channel))
            })?;
        Ok(RecordHandle(state.allocate(Entry::Record(record))))
    }

    /// Make `op` fail until turned off again.
    pub fn fail(&self, op: ProviderOp, failing: bool) {
        let mut state = self.inner.state.lock();
        if failing {
            state.failing.insert(op);
        } else {
            state.failing.remove(&op);
        }
    }

    /// Make formatting of `kind` fail until turned off again.
    pub fn fail_text(&self, kind: TextKind, failing: bool) {
        let mut state = self.inner.state.lock();
        if failing {
            state.failing_text.insert(kind);
        } else {
            state.failing_text.remove(&kind);
        }
    }

    /// Handles allocated and not yet closed, of every kind.
    pub fn live_handles(&self) -> usize {
        self.inner.state.lock().handles.len()
    }

    /// Closes of unknown or already-closed handles.
    pub fn close_failures(&self) -> u64 {
        self.inner.close_failures.load(Ordering::Relaxed)
    }

    /// Calls to `subscribe` that got past argument checks on the watcher side.
    pub fn subscribe_calls(&self) -> u64 {
        self.inner.subscribe_calls.load(Ordering::Relaxed)
    }

    fn spawn_worker(
        &self,
        channel: &str,
        notifier: Notifier,
        queue: Receiver<Work>,
        worker: &Arc<Worker>,
    ) -> Result<()> {
        let inner = Arc::downgrade(&self.inner);
        let cancel_view = Arc::downgrade(worker);
        let handle = thread::Builder::new()
            .name(format!("winlog-{}", channel))
            .spawn(move || deliver_loop(inner, cancel_view, notifier, queue))
            .map_err(|e| WatchError::provider(format!("failed to start delivery thread: {}", e)))?;
        *worker.thread.lock() = Some(handle);
        Ok(())
    }
}

fn deliver_loop(inner: Weak<Inner>, worker: Weak<Worker>, notifier: Notifier, queue: Receiver<Work>) {
    for work in queue {
        let cancelled = worker
            .upgrade()
            .map_or(true, |w| w.cancelled.load(Ordering::Acquire));
        if cancelled {
            break;
        }
        match work {
            Work::Record(record) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let handle = inner.state.lock().allocate(Entry::Record(record));
                notifier.deliver(RecordHandle(handle));
                inner.state.lock().handles.remove(&handle);
            }
            Work::Error(message) => {
                notifier.error(message);
            }
        }
    }
}

impl Provider for MemoryProvider {
    fn create_render_context(&self) -> Result<ContextHandle> {
        let mut state = self.inner.state.lock();
        state.check(ProviderOp::CreateRenderContext)?;
        Ok(ContextHandle(state.allocate(Entry::Context)))
    }

    fn create_bookmark(&self, token: Option<&str>) -> Result<BookmarkHandle> {
        let position = match token {
            Some(token) => parse_bookmark_xml(token)?,
            None => None,
        };
        let mut state = self.inner.state.lock();
        state.check(ProviderOp::CreateBookmark)?;
        Ok(BookmarkHandle(state.allocate(Entry::Bookmark(position))))
    }

    fn update_bookmark(&self, bookmark: BookmarkHandle, record: RecordHandle) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.check(ProviderOp::UpdateBookmark)?;
        let record = state.record(record)?;
        match state.handles.get_mut(&bookmark.0) {
            Some(Entry::Bookmark(position)) => {
                *position = Some((record.channel.clone(), record.record_id));
                Ok(())
            }
            _ => Err(invalid_handle(bookmark.raw())),
        }
    }

    fn render_bookmark(&self, bookmark: BookmarkHandle) -> Result<String> {
        let state = self.inner.state.lock();
        state.check(ProviderOp::RenderBookmark)?;
        match state.handles.get(&bookmark.0) {
            Some(Entry::Bookmark(position)) => Ok(render_bookmark_xml(position)),
            _ => Err(invalid_handle(bookmark.raw())),
        }
    }

    fn subscribe(
        &self,
        request: &SubscribeRequest<'_>,
        notifier: Notifier,
    ) -> Result<SubscriptionHandle> {
        self.inner.subscribe_calls.fetch_add(1, Ordering::Relaxed);
        let filter = Filter::parse(request.query)?;
        let (tx, rx) = unbounded();
        let worker = Arc::new(Worker {
            channel: request.channel.to_string(),
            filter,
            queue: Mutex::new(Some(tx)),
            cancelled: AtomicBool::new(false),
            thread: Mutex::new(None),
        });

        let key = {
            let mut state = self.inner.state.lock();
            state.check(ProviderOp::Subscribe)?;
            let after = match request.start {
                SubscribeStart::ToFutureEvents => None,
                SubscribeStart::AtOldestRecord => Some(0),
                SubscribeStart::AfterBookmark => {
                    let bookmark = request
                        .bookmark
                        .ok_or_else(|| WatchError::provider("start after bookmark without a bookmark"))?;
                    match state.handles.get(&bookmark.0) {
                        Some(Entry::Bookmark(Some((channel, id)))) if channel == request.channel => {
                            Some(*id)
                        }
                        Some(Entry::Bookmark(_)) => Some(0),
                        _ => return Err(invalid_handle(bookmark.raw())),
                    }
                }
            };

            let log = state.channels.get(request.channel).ok_or_else(|| {
                WatchError::provider(format!(
                    "the specified channel could not be found: {:?}",
                    request.channel
                ))
            })?;
            if let Some(after) = after {
                for record in log.records.iter().filter(|r| r.record_id > after) {
                    if filter.matches(record) {
                        worker.push(Work::Record(Arc::clone(record)));
                    }
                }
            }

            let key = state.allocate(Entry::Subscription(Arc::clone(&worker)));
            if let Some(log) = state.channels.get_mut(request.channel) {
                log.subscribers.push(key);
            }
            key
        };

        if let Err(e) = self.spawn_worker(request.channel, notifier, rx, &worker) {
            let mut state = self.inner.state.lock();
            state.handles.remove(&key);
            if let Some(log) = state.channels.get_mut(request.channel) {
                log.subscribers.retain(|k| *k != key);
            }
            return Err(e);
        }

        tracing::debug!(channel = request.channel, handle = key, "memory subscription started");
        Ok(SubscriptionHandle(key))
    }

    fn render_system_fields(
        &self,
        context: ContextHandle,
        record: RecordHandle,
    ) -> Result<FieldSet> {
        let state = self.inner.state.lock();
        state.check(ProviderOp::RenderSystemFields)?;
        if !matches!(state.handles.get(&context.0), Some(Entry::Context)) {
            return Err(invalid_handle(context.raw()));
        }
        Ok(state.record(record)?.fields())
    }

    fn render_xml(&self, record: RecordHandle) -> Result<String> {
        let state = self.inner.state.lock();
        state.check(ProviderOp::RenderXml)?;
        Ok(state.record(record)?.to_xml())
    }

    fn resolve_publisher(&self, fields: &FieldSet) -> Result<PublisherHandle> {
        let mut state = self.inner.state.lock();
        state.check(ProviderOp::ResolvePublisher)?;
        if fields.string(SystemProperty::ProviderName).is_none() {
            return Err(WatchError::provider(
                "the publisher metadata cannot be found in the resource",
            ));
        }
        Ok(PublisherHandle(state.allocate(Entry::Publisher)))
    }

    fn format_text(
        &self,
        publisher: PublisherHandle,
        record: RecordHandle,
        kind: TextKind,
    ) -> Result<String> {
        let state = self.inner.state.lock();
        if state.failing_text.contains(&kind) {
            return Err(WatchError::provider(format!(
                "injected failure formatting {:?}",
                kind
            )));
        }
        if !matches!(state.handles.get(&publisher.0), Some(Entry::Publisher)) {
            return Err(invalid_handle(publisher.raw()));
        }
        let record = state.record(record)?;
        let not_found = || {
            WatchError::provider(format!(
                "the message resource is present but the message was not found for event {}",
                record.event_id
            ))
        };
        match kind {
            TextKind::Message | TextKind::Id => record.message.clone().ok_or_else(not_found),
            TextKind::Level => Ok(level_name(record.level).to_string()),
            TextKind::Task if record.task == 0 => Ok("None".to_string()),
            TextKind::Task => Ok(format!("Task {}", record.task)),
            TextKind::Opcode => Ok(opcode_name(record.opcode)),
            TextKind::Keyword => Ok(format!("{:#x}", record.keywords)),
            TextKind::Channel => Ok(record.channel.clone()),
            TextKind::Provider => Ok(record.provider.clone()),
            TextKind::Xml => Ok(record.to_xml()),
        }
    }

    fn cancel(&self, handle: RawHandle) -> Result<()> {
        let state = self.inner.state.lock();
        state.check(ProviderOp::Cancel)?;
        match state.handles.get(&handle.0) {
            Some(Entry::Subscription(worker)) => {
                worker.cancelled.store(true, Ordering::Release);
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(invalid_handle(handle)),
        }
    }

    fn close(&self, handle: RawHandle) -> Result<()> {
        let entry = {
            let mut state = self.inner.state.lock();
            state.check(ProviderOp::Close)?;
            let entry = state.handles.remove(&handle.0);
            if let Some(Entry::Subscription(worker)) = &entry {
                if let Some(log) = state.channels.get_mut(&worker.channel) {
                    log.subscribers.retain(|k| *k != handle.0);
                }
            }
            entry
        };

        match entry {
            Some(Entry::Subscription(worker)) => {
                worker.cancelled.store(true, Ordering::Release);
                worker.queue.lock().take();
                let thread = worker.thread.lock().take();
                if let Some(thread) = thread {
                    // Closing from inside a notification must not wait on itself.
                    if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                        tracing::warn!(handle = ?handle, "delivery thread panicked");
                    }
                }
                Ok(())
            }
            Some(_) => Ok(()),
            None => {
                self.inner.close_failures.fetch_add(1, Ordering::Relaxed);
                Err(invalid_handle(handle))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Notification, NotificationSink};
    use crossbeam_channel::{bounded, RecvTimeoutError};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Harness {
        provider: MemoryProvider,
        context: ContextHandle,
        rx: Receiver<(String, Result<u64>)>,
        sink: Arc<dyn NotificationSink>,
    }

    fn harness() -> Harness {
        let provider = MemoryProvider::new();
        provider.create_channel("Application");
        let context = provider.create_render_context().unwrap();
        let (tx, rx) = bounded(1024);
        let sink: Arc<dyn NotificationSink> = Arc::new(ContextSink {
            tx,
            provider: provider.clone(),
            context,
        });
        Harness {
            provider,
            context,
            rx,
            sink,
        }
    }

    struct ContextSink {
        tx: Sender<(String, Result<u64>)>,
        provider: MemoryProvider,
        context: ContextHandle,
    }

    impl NotificationSink for ContextSink {
        fn notify(&self, channel: &str, notification: Notification) {
            let outcome = match notification {
                Notification::Deliver(record) => self
                    .provider
                    .render_system_fields(self.context, record)
                    .map(|fields| fields.unsigned(SystemProperty::EventRecordId).unwrap_or(0)),
                Notification::Error(message) => Err(WatchError::provider(message)),
            };
            let _ = self.tx.send((channel.to_string(), outcome));
        }
    }

    fn subscribe(h: &Harness, start: SubscribeStart, bookmark: Option<BookmarkHandle>) -> SubscriptionHandle {
        subscribe_query(h, "*", start, bookmark).unwrap()
    }

    fn subscribe_query(
        h: &Harness,
        query: &str,
        start: SubscribeStart,
        bookmark: Option<BookmarkHandle>,
    ) -> Result<SubscriptionHandle> {
        let notifier = Notifier::register(Arc::downgrade(&h.sink), "Application");
        let request = SubscribeRequest {
            channel: "Application",
            query,
            start,
            bookmark,
        };
        h.provider.subscribe(&request, notifier)
    }

    fn received(h: &Harness, count: usize) -> Vec<u64> {
        (0..count)
            .map(|_| h.rx.recv_timeout(TIMEOUT).unwrap().1.unwrap())
            .collect()
    }

    #[test]
    fn test_backlog_from_oldest() {
        let h = harness();
        for _ in 0..3 {
            h.provider.append("Application", MemoryRecord::new("Test", 1));
        }
        let sub = subscribe(&h, SubscribeStart::AtOldestRecord, None);

        assert_eq!(received(&h, 3), vec![1, 2, 3]);

        h.provider.append("Application", MemoryRecord::new("Test", 1));
        assert_eq!(received(&h, 1), vec![4]);
        h.provider.close(sub.raw()).unwrap();
    }

    #[test]
    fn test_future_only() {
        let h = harness();
        h.provider.append("Application", MemoryRecord::new("Test", 1));
        let sub = subscribe(&h, SubscribeStart::ToFutureEvents, None);
        h.provider.append("Application", MemoryRecord::new("Test", 1));

        assert_eq!(received(&h, 1), vec![2]);
        h.provider.close(sub.raw()).unwrap();
    }

    #[test]
    fn test_after_bookmark_skips_purged() {
        let h = harness();
        for _ in 0..6 {
            h.provider.append("Application", MemoryRecord::new("Test", 1));
        }
        let token = render_bookmark_xml(&Some(("Application".to_string(), 2)));
        let bookmark = h.provider.create_bookmark(Some(&token)).unwrap();
        h.provider.purge("Application", 4);

        let sub = subscribe(&h, SubscribeStart::AfterBookmark, Some(bookmark));

        assert_eq!(received(&h, 2), vec![5, 6]);
        h.provider.close(sub.raw()).unwrap();
        h.provider.close(bookmark.raw()).unwrap();
    }

    #[test]
    fn test_query_filters() {
        let h = harness();
        h.provider.append("Application", MemoryRecord::new("Test", 1).level(2));
        h.provider.append("Application", MemoryRecord::new("Test", 1).level(4));
        h.provider.append("Application", MemoryRecord::new("Test", 1).level(2));

        let sub = subscribe_query(&h, "*[System[(Level=2)]]", SubscribeStart::AtOldestRecord, None)
            .unwrap();

        assert_eq!(received(&h, 2), vec![1, 3]);
        assert!(matches!(
            h.rx.recv_timeout(Duration::from_millis(50)),
            Err(RecvTimeoutError::Timeout)
        ));
        h.provider.close(sub.raw()).unwrap();
    }

    #[test]
    fn test_bad_query_rejected() {
        let h = harness();
        let result = subscribe_query(&h, "Event[", SubscribeStart::ToFutureEvents, None);
        assert!(matches!(result, Err(WatchError::Provider(_))));
        assert_eq!(h.provider.live_handles(), 1);
    }

    #[test]
    fn test_unknown_channel_rejected() {
        let h = harness();
        let notifier = Notifier::register(Arc::downgrade(&h.sink), "Nope");
        let request = SubscribeRequest {
            channel: "Nope",
            query: "*",
            start: SubscribeStart::ToFutureEvents,
            bookmark: None,
        };
        assert!(h.provider.subscribe(&request, notifier).is_err());
        notifier.unregister();
    }

    #[test]
    fn test_error_notification() {
        let h = harness();
        let sub = subscribe(&h, SubscribeStart::ToFutureEvents, None);
        h.provider.notify_error("Application", "channel log was cleared");

        let (channel, outcome) = h.rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(channel, "Application");
        assert!(outcome.is_err());
        h.provider.close(sub.raw()).unwrap();
    }

    #[test]
    fn test_record_handle_scoped_to_notification() {
        let h = harness();
        let sub = subscribe(&h, SubscribeStart::ToFutureEvents, None);
        h.provider.append("Application", MemoryRecord::new("Test", 1));
        received(&h, 1);
        h.provider.close(sub.raw()).unwrap();

        // Only the render context is left.
        assert_eq!(h.provider.live_handles(), 1);
        let _ = h.context;
    }

    #[test]
    fn test_double_close_counts_failure() {
        let h = harness();
        let bookmark = h.provider.create_bookmark(None).unwrap();
        h.provider.close(bookmark.raw()).unwrap();

        assert!(h.provider.close(bookmark.raw()).is_err());
        assert_eq!(h.provider.close_failures(), 1);
    }

    #[test]
    fn test_bookmark_xml() {
        let empty = render_bookmark_xml(&None);
        assert_eq!(empty, "<BookmarkList>\r\n</BookmarkList>");
        assert_eq!(parse_bookmark_xml(&empty).unwrap(), None);

        let position = Some(("O'Brien & Co".to_string(), 17));
        let xml = render_bookmark_xml(&position);
        assert_eq!(parse_bookmark_xml(&xml).unwrap(), position);

        assert!(parse_bookmark_xml("<BookmarkList><Bookmark/></BookmarkList>").is_err());
        assert!(parse_bookmark_xml("<BookmarkList>").is_err());
    }

    #[test]
    fn test_xml_escapes_values() {
        let provider = MemoryProvider::new();
        provider.append("Application", MemoryRecord::new("A<B>", 7).message("x & y"));
        let record = provider.open_record("Application", 1).unwrap();

        let xml = provider.render_xml(record).unwrap();
        assert!(xml.contains("<Provider Name='A&lt;B&gt;'/>"));
        assert!(xml.contains("<Data>x &amp; y</Data>"));
        assert!(xml.contains("<EventID>7</EventID>"));
    }

    #[test]
    fn test_xml_optional_system_fields() {
        let provider = MemoryProvider::new();
        provider.append("Application", MemoryRecord::new("Test", 7));
        provider.append(
            "Application",
            MemoryRecord::new("Test", 7)
                .provider_guid("{AB}")
                .qualifiers(16384)
                .activity("{CD}")
                .user("S-1-5-18"),
        );

        let bare = provider
            .render_xml(provider.open_record("Application", 1).unwrap())
            .unwrap();
        assert!(bare.starts_with("<Event xmlns="));
        assert!(bare.contains("<Provider Name='Test'/>"));
        assert!(bare.contains("<Correlation/>"));
        assert!(bare.contains("<Security/>"));
        assert!(!bare.contains("<EventData>"));
        assert!(bare.ends_with("</System></Event>"));

        let full = provider
            .render_xml(provider.open_record("Application", 2).unwrap())
            .unwrap();
        assert!(full.contains("<Provider Name='Test' Guid='{AB}'/>"));
        assert!(full.contains("<EventID Qualifiers='16384'>7</EventID>"));
        assert!(full.contains("<Correlation ActivityID='{CD}'/>"));
        assert!(full.contains("<Security UserID='S-1-5-18'/>"));
        assert!(full.contains("<EventRecordID>2</EventRecordID>"));
    }

    #[test]
    fn test_level_names() {
        assert_eq!(level_name(0), "Information");
        assert_eq!(level_name(2), "Error");
        assert_eq!(level_name(3), "Warning");
    }
}
