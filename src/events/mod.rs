//! Conversion of provider records into [`Event`](crate::Event)s.
//!
//! Conversion renders the record's system properties and its XML, then
//! optionally resolves localized text through the record's publisher.
//! Partial failures are kept on the event; only a record that renders
//! neither way fails to convert.

mod converter;
mod time;
mod variant;

pub use converter::EventConverter;
pub use time::{
    filetime_to_utc, utc_to_filetime, FILETIME_TICKS_PER_SEC, FILETIME_UNIX_EPOCH_OFFSET_SECS,
};
pub use variant::{FieldSet, SystemProperty, Variant};
