//! Tagged values rendered by the provider.

use super::time::filetime_to_utc;

/// The fixed set of system properties common to every record, in the order
/// the system render context produces them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SystemProperty {
    ProviderName,
    ProviderGuid,
    EventId,
    Qualifiers,
    Level,
    Task,
    Opcode,
    Keywords,
    TimeCreated,
    EventRecordId,
    ActivityId,
    RelatedActivityId,
    ProcessId,
    ThreadId,
    Channel,
    Computer,
    UserId,
    Version,
}

impl SystemProperty {
    /// Number of system properties.
    pub const COUNT: usize = 18;

    /// All properties in render order.
    pub const ALL: [SystemProperty; Self::COUNT] = [
        SystemProperty::ProviderName,
        SystemProperty::ProviderGuid,
        SystemProperty::EventId,
        SystemProperty::Qualifiers,
        SystemProperty::Level,
        SystemProperty::Task,
        SystemProperty::Opcode,
        SystemProperty::Keywords,
        SystemProperty::TimeCreated,
        SystemProperty::EventRecordId,
        SystemProperty::ActivityId,
        SystemProperty::RelatedActivityId,
        SystemProperty::ProcessId,
        SystemProperty::ThreadId,
        SystemProperty::Channel,
        SystemProperty::Computer,
        SystemProperty::UserId,
        SystemProperty::Version,
    ];

    /// Index into a rendered `FieldSet`.
    pub fn index(self) -> usize {
        self as usize
    }
}

/// One rendered value. The provider leaves optional properties as `Null`.
#[derive(Clone, Debug, PartialEq)]
pub enum Variant {
    Null,
    String(String),
    AnsiString(String),
    SByte(i8),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Boolean(bool),
    Binary(Vec<u8>),
    Guid(String),
    /// 100-nanosecond ticks since 1601-01-01 UTC.
    FileTime(u64),
    Sid(String),
    HexInt32(u32),
    HexInt64(u64),
}

impl Variant {
    pub fn is_null(&self) -> bool {
        matches!(self, Variant::Null)
    }

    /// String value. Only `String` counts; everything else is absent.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::String(s) => Some(s),
            _ => None,
        }
    }

    /// Unsigned integer value of any unsigned width.
    pub fn as_unsigned(&self) -> Option<u64> {
        match *self {
            Variant::Byte(v) => Some(u64::from(v)),
            Variant::UInt16(v) => Some(u64::from(v)),
            Variant::UInt32(v) => Some(u64::from(v)),
            Variant::UInt64(v) => Some(v),
            Variant::HexInt32(v) => Some(u64::from(v)),
            Variant::HexInt64(v) => Some(v),
            _ => None,
        }
    }

    /// Signed integer value of any signed width.
    pub fn as_signed(&self) -> Option<i64> {
        match *self {
            Variant::SByte(v) => Some(i64::from(v)),
            Variant::Int16(v) => Some(i64::from(v)),
            Variant::Int32(v) => Some(i64::from(v)),
            Variant::Int64(v) => Some(v),
            _ => None,
        }
    }

    /// Raw FILETIME ticks.
    pub fn as_filetime(&self) -> Option<u64> {
        match *self {
            Variant::FileTime(ticks) => Some(ticks),
            _ => None,
        }
    }

    /// GUID in its braced string form.
    pub fn as_guid(&self) -> Option<&str> {
        match self {
            Variant::Guid(g) => Some(g),
            _ => None,
        }
    }

    /// Security identifier in its string form.
    pub fn as_sid(&self) -> Option<&str> {
        match self {
            Variant::Sid(s) => Some(s),
            _ => None,
        }
    }

    /// Render for display regardless of type. Types without a natural text
    /// form render as an empty string.
    pub fn to_display_string(&self) -> String {
        if let Some(v) = self.as_signed() {
            return v.to_string();
        }
        if let Some(v) = self.as_unsigned() {
            return v.to_string();
        }
        match self {
            Variant::String(s) | Variant::AnsiString(s) => s.clone(),
            Variant::Guid(s) | Variant::Sid(s) => s.clone(),
            Variant::Boolean(b) => b.to_string(),
            Variant::FileTime(ticks) => filetime_to_utc(*ticks)
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            _ => String::new(),
        }
    }
}

/// The rendered system properties of one record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FieldSet {
    values: Vec<Variant>,
}

static NULL: Variant = Variant::Null;

impl FieldSet {
    pub fn new(values: Vec<Variant>) -> Self {
        Self { values }
    }

    /// Build a set with every property null, then fill in `fields`.
    pub fn from_properties(fields: impl IntoIterator<Item = (SystemProperty, Variant)>) -> Self {
        let mut values = vec![Variant::Null; SystemProperty::COUNT];
        for (property, value) in fields {
            values[property.index()] = value;
        }
        Self { values }
    }

    /// Value of `property`; `Null` when the provider rendered fewer fields.
    pub fn get(&self, property: SystemProperty) -> &Variant {
        self.values.get(property.index()).unwrap_or(&NULL)
    }

    pub fn string(&self, property: SystemProperty) -> Option<String> {
        self.get(property).as_str().map(str::to_string)
    }

    pub fn unsigned(&self, property: SystemProperty) -> Option<u64> {
        self.get(property).as_unsigned()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Every field rendered as a display string, in order.
    pub fn to_strings(&self) -> Vec<String> {
        self.values.iter().map(Variant::to_display_string).collect()
    }
}
