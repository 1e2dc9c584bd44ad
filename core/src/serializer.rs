//! The serializer contract and its default JSON implementation.
//!
//! [`Serializer`] is kept dyn-compatible (no generic methods) by operating on
//! [`WireEnvelope`], a concrete, non-generic stand-in for `EventContext<T>`
//! whose payload is an already-erased [`serde_json::Value`]. The dispatch
//! pipeline in [`crate::transport`] is responsible for converting a typed
//! `EventContext<T>` to and from a `WireEnvelope` around each serializer
//! call: dyn compatibility at the trait boundary, generics restored one
//! layer up.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::{EventContext, HostInfo};

/// Errors raised while serializing or deserializing an envelope.
#[derive(Error, Debug)]
pub enum SerializerError {
    /// The payload could not be converted to or from the serializer's wire
    /// format.
    #[error("failed to encode payload: {0}")]
    Encode(String),
    /// The payload could not be decoded from the serializer's wire format.
    #[error("failed to decode payload: {0}")]
    Decode(String),
    /// The declared content type is not one this serializer understands.
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
}

/// A declared media type and charset, e.g. `application/json; charset=utf-8`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType(String);

impl ContentType {
    /// Build a content type from its wire representation.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The wire representation, e.g. for a transport's content-type header.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A non-generic, fully erased stand-in for `EventContext<T>` used at the
/// serializer boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEnvelope {
    /// See [`EventContext::id`].
    pub id: Option<String>,
    /// See [`EventContext::request_id`].
    pub request_id: Option<String>,
    /// See [`EventContext::correlation_id`].
    pub correlation_id: Option<String>,
    /// See [`EventContext::conversation_id`].
    pub conversation_id: Option<String>,
    /// See [`EventContext::initiator_id`].
    pub initiator_id: Option<String>,
    /// See [`EventContext::sent`].
    pub sent: Option<DateTime<Utc>>,
    /// See [`EventContext::expires`].
    pub expires: Option<DateTime<Utc>>,
    /// See [`EventContext::headers`].
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// The erased payload.
    pub event: serde_json::Value,
}

impl WireEnvelope {
    /// Erase a typed `EventContext<T>` into a `WireEnvelope`.
    ///
    /// # Errors
    ///
    /// Returns [`SerializerError::Encode`] if `T`'s `Serialize`
    /// implementation fails.
    pub fn from_context<T: Serialize>(context: &EventContext<T>) -> Result<Self, SerializerError> {
        let event = serde_json::to_value(&context.event)
            .map_err(|e| SerializerError::Encode(e.to_string()))?;
        Ok(Self {
            id: context.id.clone(),
            request_id: context.request_id.clone(),
            correlation_id: context.correlation_id.clone(),
            conversation_id: context.conversation_id.clone(),
            initiator_id: context.initiator_id.clone(),
            sent: context.sent,
            expires: context.expires,
            headers: context.headers.clone(),
            event,
        })
    }

    /// Reconstruct a typed `EventContext<T>` from a `WireEnvelope`.
    ///
    /// Missing fields decode to their absent/empty value.
    ///
    /// # Errors
    ///
    /// Returns [`SerializerError::Decode`] if the erased payload does not
    /// match `T`'s `Deserialize` implementation.
    pub fn into_context<T: for<'de> Deserialize<'de>>(
        self,
    ) -> Result<EventContext<T>, SerializerError> {
        let event =
            serde_json::from_value(self.event).map_err(|e| SerializerError::Decode(e.to_string()))?;
        Ok(EventContext {
            id: self.id,
            request_id: self.request_id,
            correlation_id: self.correlation_id,
            conversation_id: self.conversation_id,
            initiator_id: self.initiator_id,
            sent: self.sent,
            expires: self.expires,
            headers: self.headers,
            event,
        })
    }
}

/// Reserved header a serializer may embed [`HostInfo`] under. Readers must
/// tolerate its absence.
pub const HEADER_HOST_INFO: &str = "X-RelayBus-Host";

/// Converts between a [`WireEnvelope`] and a byte stream with a declared
/// content type. Implementations must write a self-describing payload.
pub trait Serializer: Send + Sync {
    /// Serialize `envelope` to bytes, returning the declared content type.
    ///
    /// # Errors
    ///
    /// Returns [`SerializerError::Encode`] if the envelope cannot be
    /// serialized.
    fn serialize(
        &self,
        envelope: &WireEnvelope,
        host_info: &HostInfo,
    ) -> Result<(Vec<u8>, ContentType), SerializerError>;

    /// Deserialize `bytes` (declared as `content_type`) back into an
    /// envelope.
    ///
    /// # Errors
    ///
    /// Returns [`SerializerError::Decode`] if the bytes cannot be parsed, or
    /// [`SerializerError::UnsupportedContentType`] if `content_type` is not
    /// recognized.
    fn deserialize(&self, bytes: &[u8], content_type: &str) -> Result<WireEnvelope, SerializerError>;
}

/// The default serializer: a JSON envelope
/// `{ Id, RequestId, CorrelationId, ConversationId, InitiatorId, Sent,
/// Expires, Headers, Event }`, declared as
/// `application/json; charset=utf-8`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    /// The content type this serializer always declares.
    pub const CONTENT_TYPE: &'static str = "application/json; charset=utf-8";
}

impl Serializer for JsonSerializer {
    fn serialize(
        &self,
        envelope: &WireEnvelope,
        host_info: &HostInfo,
    ) -> Result<(Vec<u8>, ContentType), SerializerError> {
        let mut envelope = envelope.clone();
        if let Ok(host_info_json) = serde_json::to_string(host_info) {
            envelope
                .headers
                .entry(HEADER_HOST_INFO.to_string())
                .or_insert(host_info_json);
        }

        let bytes =
            serde_json::to_vec(&envelope).map_err(|e| SerializerError::Encode(e.to_string()))?;
        Ok((bytes, ContentType::new(Self::CONTENT_TYPE)))
    }

    fn deserialize(&self, bytes: &[u8], content_type: &str) -> Result<WireEnvelope, SerializerError> {
        if !content_type.starts_with("application/json") {
            return Err(SerializerError::UnsupportedContentType(
                content_type.to_string(),
            ));
        }
        serde_json::from_slice(bytes).map_err(|e| SerializerError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct SampleEvent {
        make: String,
        year: u32,
    }

    #[test]
    fn round_trip_preserves_all_fields() {
        let mut context = EventContext::new(SampleEvent {
            make: "TESLA".to_string(),
            year: 2021,
        });
        context.id = Some("id-1".to_string());
        context.correlation_id = Some("corr-1".to_string());
        context.request_id = Some("req-1".to_string());
        context.conversation_id = Some("conv-1".to_string());
        context.initiator_id = Some("init-1".to_string());
        context.headers.insert("k".to_string(), "v".to_string());

        let envelope = WireEnvelope::from_context(&context).unwrap();
        let serializer = JsonSerializer;
        let host_info = HostInfo::default();

        let (bytes, content_type) = serializer.serialize(&envelope, &host_info).unwrap();
        assert_eq!(content_type.as_str(), JsonSerializer::CONTENT_TYPE);

        let decoded_envelope = serializer.deserialize(&bytes, content_type.as_str()).unwrap();
        let decoded: EventContext<SampleEvent> = decoded_envelope.into_context().unwrap();

        assert_eq!(decoded.event, context.event);
        assert_eq!(decoded.id, context.id);
        assert_eq!(decoded.correlation_id, context.correlation_id);
        assert_eq!(decoded.request_id, context.request_id);
        assert_eq!(decoded.conversation_id, context.conversation_id);
        assert_eq!(decoded.initiator_id, context.initiator_id);
        assert_eq!(decoded.headers.get("k"), Some(&"v".to_string()));
    }

    #[test]
    fn unsupported_content_type_is_rejected() {
        let serializer = JsonSerializer;
        let err = serializer.deserialize(b"{}", "application/xml").unwrap_err();
        assert!(matches!(err, SerializerError::UnsupportedContentType(_)));
    }
}
