//! Raw record to `Event` conversion.

use super::time::filetime_to_utc;
use super::variant::{FieldSet, SystemProperty};
use crate::error::{Result, WatchError};
use crate::provider::Provider;
use crate::types::{ContextHandle, Event, PublisherHandle, RecordHandle, RenderOptions};

/// Converts records into events using a shared render context.
pub struct EventConverter<'a, P: Provider> {
    provider: &'a P,
    context: ContextHandle,
    options: RenderOptions,
}

/// Closes the publisher handle on every exit path.
struct PublisherGuard<'a, P: Provider> {
    provider: &'a P,
    handle: PublisherHandle,
}

impl<P: Provider> Drop for PublisherGuard<'_, P> {
    fn drop(&mut self) {
        if let Err(e) = self.provider.close(self.handle.raw()) {
            tracing::warn!(handle = ?self.handle, error = %e, "failed to close publisher handle");
        }
    }
}

impl<'a, P: Provider> EventConverter<'a, P> {
    pub fn new(provider: &'a P, context: ContextHandle, options: RenderOptions) -> Self {
        Self {
            provider,
            context,
            options,
        }
    }

    /// Convert `record`, delivered on `subscribed_channel`.
    ///
    /// Fails only when neither the system properties nor the XML could be
    /// rendered. Any narrower failure is recorded on the event. The
    /// returned event has no bookmark yet.
    pub fn convert(&self, record: RecordHandle, subscribed_channel: &str) -> Result<Event> {
        let (xml, xml_err) = match self.provider.render_xml(record) {
            Ok(xml) => (Some(xml), None),
            Err(e) => (None, Some(e.to_string())),
        };

        let mut event = Event {
            xml,
            xml_err,
            subscribed_channel: subscribed_channel.to_string(),
            ..Default::default()
        };

        match self.provider.render_system_fields(self.context, record) {
            Ok(fields) => {
                fill_system_properties(&mut event, &fields);
                self.fill_localized_text(&mut event, &fields, record);
            }
            Err(fields_err) => {
                if let Some(xml_err) = event.xml_err.take() {
                    return Err(WatchError::EventRenderFailed {
                        fields: fields_err.to_string(),
                        xml: xml_err,
                    });
                }
                event.rendered_fields_err = Some(fields_err.to_string());
            }
        }

        Ok(event)
    }

    fn fill_localized_text(&self, event: &mut Event, fields: &FieldSet, record: RecordHandle) {
        let wanted: Vec<_> = RenderOptions::KINDS
            .into_iter()
            .filter(|kind| self.options.enabled(*kind))
            .collect();
        if wanted.is_empty() {
            return;
        }

        let publisher = match self.provider.resolve_publisher(fields) {
            Ok(handle) => PublisherGuard {
                provider: self.provider,
                handle,
            },
            Err(e) => {
                event.publisher_err = Some(e.to_string());
                return;
            }
        };

        for kind in wanted {
            match self.provider.format_text(publisher.handle, record, kind) {
                Ok(text) => event.set_text(kind, text),
                Err(e) => {
                    event.text_errors.insert(kind, e.to_string());
                }
            }
        }
    }
}

fn fill_system_properties(event: &mut Event, fields: &FieldSet) {
    use SystemProperty::*;

    event.provider_name = fields.string(ProviderName);
    event.event_id = fields.unsigned(EventId);
    event.qualifiers = fields.unsigned(Qualifiers);
    event.level = fields.unsigned(Level);
    event.task = fields.unsigned(Task);
    event.opcode = fields.unsigned(Opcode);
    event.keywords = fields.unsigned(Keywords);
    event.created = fields.get(TimeCreated).as_filetime().and_then(filetime_to_utc);
    event.record_id = fields.unsigned(EventRecordId);
    event.activity_id = fields.get(ActivityId).as_guid().map(str::to_string);
    event.related_activity_id = fields.get(RelatedActivityId).as_guid().map(str::to_string);
    event.process_id = fields.unsigned(ProcessId);
    event.thread_id = fields.unsigned(ThreadId);
    event.channel = fields.string(Channel);
    event.computer_name = fields.string(Computer);
    event.user_id = fields.get(UserId).as_sid().map(str::to_string);
    event.version = fields.unsigned(Version);
}
