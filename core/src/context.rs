//! The envelope that carries a payload and its correlation metadata through
//! publish and consume.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved header key carrying the W3C trace-parent id across the wire.
pub const HEADER_ACTIVITY_ID: &str = "ActivityId";
/// Reserved header key mirroring [`EventContext::id`] for transports whose
/// native metadata channel exposes it separately from the envelope.
pub const HEADER_ID: &str = "Id";
/// Reserved header key mirroring [`EventContext::correlation_id`].
pub const HEADER_CORRELATION_ID: &str = "CorrelationId";
/// Reserved header key carrying a broker-assigned sequence number.
pub const HEADER_SEQUENCE_NUMBER: &str = "SequenceNumber";
/// Reserved header key carrying the declared content type, for transports
/// without a native content-type channel.
pub const HEADER_CONTENT_TYPE: &str = "ContentType";

/// Opaque header value. Headers are transport-agnostic key/value pairs;
/// insertion order is not significant.
pub type Headers = HashMap<String, String>;

/// Host process metadata a serializer may embed alongside a message.
/// Readers must tolerate its absence.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostInfo {
    /// The publishing application's logical name.
    pub application_name: String,
    /// The publishing application's version string.
    pub application_version: String,
    /// The deployment environment name (e.g. "production").
    pub environment_name: String,
    /// The machine or pod hostname the process is running on.
    pub machine_name: String,
    /// The version of this library.
    pub library_version: String,
}

/// The envelope wrapping a typed payload with publish/consume metadata.
///
/// `Id` is assigned by the bus on publish if absent, and is non-empty once
/// the context has been published. `EventContext` is owned by exactly one
/// in-flight operation; it is never mutated by the consuming side except
/// through the bus's own publish finalization step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventContext<T> {
    /// Unique identifier for this specific publish, assigned as a UUID if
    /// absent at publish time.
    pub id: Option<String>,
    /// Correlates this event with others in the same logical operation.
    pub correlation_id: Option<String>,
    /// Identifies the originating request, if any.
    pub request_id: Option<String>,
    /// Identifies the broader conversation this event belongs to.
    pub conversation_id: Option<String>,
    /// Identifies the actor that initiated the operation.
    pub initiator_id: Option<String>,
    /// When this event should be considered expired, if ever.
    pub expires: Option<DateTime<Utc>>,
    /// When this event was sent, assigned by the bus if absent at publish
    /// time.
    pub sent: Option<DateTime<Utc>>,
    /// Transport-agnostic header bag.
    #[serde(default)]
    pub headers: Headers,
    /// The typed payload.
    pub event: T,
}

impl<T> EventContext<T> {
    /// Wrap a payload in a fresh context with no carried correlation.
    ///
    /// This is what [`crate::publisher::Publisher`] uses: a brand-new
    /// context has no inherited identifiers.
    pub fn new(event: T) -> Self {
        Self {
            id: None,
            correlation_id: None,
            request_id: None,
            conversation_id: None,
            initiator_id: None,
            expires: None,
            sent: None,
            headers: Headers::new(),
            event,
        }
    }

    /// Build a reply context for republishing a different payload from
    /// inside a consumer, linking the new context's `correlation_id` to this
    /// context's `id`.
    ///
    /// This never mutates `self` — republishing from a consume context must
    /// not alter the incoming context.
    #[must_use]
    pub fn reply<U>(&self, event: U) -> EventContext<U> {
        EventContext {
            id: None,
            correlation_id: self.id.clone(),
            request_id: self.request_id.clone(),
            conversation_id: self.conversation_id.clone(),
            initiator_id: self.initiator_id.clone(),
            expires: None,
            sent: None,
            headers: Headers::new(),
            event,
        }
    }

    /// Assign a fresh id and sent timestamp if not already set. Idempotent:
    /// does nothing if both are already set.
    pub fn finalize_for_publish(&mut self, id: impl FnOnce() -> String, now: impl FnOnce() -> DateTime<Utc>) {
        if self.id.is_none() {
            self.id = Some(id());
        }
        if self.sent.is_none() {
            self.sent = Some(now());
        }
    }

    /// Map the payload to a new type, keeping all metadata intact.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> EventContext<U> {
        EventContext {
            id: self.id,
            correlation_id: self.correlation_id,
            request_id: self.request_id,
            conversation_id: self.conversation_id,
            initiator_id: self.initiator_id,
            expires: self.expires,
            sent: self.sent,
            headers: self.headers,
            event: f(self.event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_links_correlation_to_source_id_without_mutating_source() {
        let mut source = EventContext::new("hello");
        source.id = Some("source-id".to_string());

        let reply = source.reply("world");

        assert_eq!(reply.correlation_id.as_deref(), Some("source-id"));
        assert_eq!(source.id.as_deref(), Some("source-id"));
        assert!(reply.id.is_none());
    }

    #[test]
    fn finalize_for_publish_is_idempotent() {
        let mut ctx = EventContext::new(42);
        ctx.finalize_for_publish(|| "id-1".to_string(), Utc::now);
        let id_after_first = ctx.id.clone();
        ctx.finalize_for_publish(|| "id-2".to_string(), Utc::now);
        assert_eq!(ctx.id, id_after_first);
    }
}
