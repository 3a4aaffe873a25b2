//! Core types for the watcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Untyped provider handle. Only this crosses into `Provider::cancel` and
/// `Provider::close`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(pub u64);

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawHandle({:#x})", self.0)
    }
}

macro_rules! provider_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub u64);

        impl $name {
            pub fn raw(self) -> RawHandle {
                RawHandle(self.0)
            }
        }

        impl From<$name> for RawHandle {
            fn from(handle: $name) -> Self {
                handle.raw()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0)
            }
        }
    };
}

provider_handle!(
    /// Render context describing which fields to extract from a record.
    ContextHandle
);
provider_handle!(
    /// Provider-side bookmark object.
    BookmarkHandle
);
provider_handle!(
    /// Live channel subscription.
    SubscriptionHandle
);
provider_handle!(
    /// A record; only valid for the duration of the notification that carried it.
    RecordHandle
);
provider_handle!(
    /// Publisher metadata used to resolve localized text.
    PublisherHandle
);

/// Where a new subscription starts reading.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartMode {
    /// Oldest record still available in the channel.
    Beginning,
    /// Only records that arrive after subscribing.
    Now,
    /// The record after a previously serialized bookmark. If that record has
    /// been purged the provider resumes at the closest available one.
    Bookmark(String),
}

impl StartMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartMode::Beginning => "beginning",
            StartMode::Now => "now",
            StartMode::Bookmark(_) => "bookmark",
        }
    }
}

/// Kinds of localized text a publisher can format for a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextKind {
    Message,
    Level,
    Task,
    Opcode,
    Keyword,
    Channel,
    Provider,
    Id,
    Xml,
}

/// Which localized-text fields to resolve per event.
///
/// Formatting localized text is the slowest part of converting a record, so
/// collectors that do not need a field can turn it off.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderOptions {
    pub message: bool,
    pub level: bool,
    pub task: bool,
    pub provider: bool,
    pub opcode: bool,
    pub channel: bool,
    pub id: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            message: true,
            level: true,
            task: true,
            provider: true,
            opcode: true,
            channel: true,
            id: true,
        }
    }
}

impl RenderOptions {
    /// Resolve no localized text at all.
    pub fn none() -> Self {
        Self {
            message: false,
            level: false,
            task: false,
            provider: false,
            opcode: false,
            channel: false,
            id: false,
        }
    }

    pub fn with_message(mut self, render: bool) -> Self {
        self.message = render;
        self
    }

    pub fn with_level(mut self, render: bool) -> Self {
        self.level = render;
        self
    }

    pub fn with_task(mut self, render: bool) -> Self {
        self.task = render;
        self
    }

    pub fn with_provider(mut self, render: bool) -> Self {
        self.provider = render;
        self
    }

    pub fn with_opcode(mut self, render: bool) -> Self {
        self.opcode = render;
        self
    }

    pub fn with_channel(mut self, render: bool) -> Self {
        self.channel = render;
        self
    }

    pub fn with_id(mut self, render: bool) -> Self {
        self.id = render;
        self
    }

    /// Whether text of `kind` should be resolved.
    pub fn enabled(&self, kind: TextKind) -> bool {
        match kind {
            TextKind::Message => self.message,
            TextKind::Level => self.level,
            TextKind::Task => self.task,
            TextKind::Provider => self.provider,
            TextKind::Opcode => self.opcode,
            TextKind::Channel => self.channel,
            TextKind::Id => self.id,
            TextKind::Keyword | TextKind::Xml => false,
        }
    }

    /// The toggleable kinds, in resolution order.
    pub const KINDS: [TextKind; 7] = [
        TextKind::Message,
        TextKind::Level,
        TextKind::Task,
        TextKind::Provider,
        TextKind::Opcode,
        TextKind::Channel,
        TextKind::Id,
    ];
}

/// A normalized snapshot of one log record.
///
/// System properties the provider left null (or rendered with an unexpected
/// type) are `None`. Failures that prevented a group of fields from being
/// produced are recorded in the `*_err` fields instead of failing the event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    // --- System properties ---
    pub provider_name: Option<String>,
    pub event_id: Option<u64>,
    pub qualifiers: Option<u64>,
    pub level: Option<u64>,
    pub task: Option<u64>,
    pub opcode: Option<u64>,
    pub keywords: Option<u64>,
    pub created: Option<DateTime<Utc>>,
    pub record_id: Option<u64>,
    pub activity_id: Option<String>,
    pub related_activity_id: Option<String>,
    pub process_id: Option<u64>,
    pub thread_id: Option<u64>,
    pub channel: Option<String>,
    pub computer_name: Option<String>,
    pub user_id: Option<String>,
    pub version: Option<u64>,
    /// Why the system properties could not be rendered.
    pub rendered_fields_err: Option<String>,

    // --- Localized text ---
    pub message: Option<String>,
    pub level_text: Option<String>,
    pub task_text: Option<String>,
    pub opcode_text: Option<String>,
    pub channel_text: Option<String>,
    pub provider_text: Option<String>,
    pub id_text: Option<String>,
    /// Why the publisher could not be resolved; no text was formatted.
    pub publisher_err: Option<String>,
    /// Per-kind formatting failures. A disabled kind never appears here.
    pub text_errors: BTreeMap<TextKind, String>,

    // --- Raw rendering ---
    pub xml: Option<String>,
    pub xml_err: Option<String>,

    /// Serialized bookmark positioned at this record.
    pub bookmark: String,

    /// Channel the subscription was made on, which may differ from `channel`.
    pub subscribed_channel: String,
}

impl Event {
    /// Localized text of `kind`, if it was resolved.
    pub fn text(&self, kind: TextKind) -> Option<&str> {
        let text = match kind {
            TextKind::Message => &self.message,
            TextKind::Level => &self.level_text,
            TextKind::Task => &self.task_text,
            TextKind::Opcode => &self.opcode_text,
            TextKind::Channel => &self.channel_text,
            TextKind::Provider => &self.provider_text,
            TextKind::Id => &self.id_text,
            TextKind::Keyword | TextKind::Xml => return None,
        };
        text.as_deref()
    }

    pub(crate) fn set_text(&mut self, kind: TextKind, value: String) {
        let slot = match kind {
            TextKind::Message => &mut self.message,
            TextKind::Level => &mut self.level_text,
            TextKind::Task => &mut self.task_text,
            TextKind::Opcode => &mut self.opcode_text,
            TextKind::Channel => &mut self.channel_text,
            TextKind::Provider => &mut self.provider_text,
            TextKind::Id => &mut self.id_text,
            TextKind::Keyword | TextKind::Xml => return,
        };
        *slot = Some(value);
    }

    /// Serialize to a JSON line for shipping.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
