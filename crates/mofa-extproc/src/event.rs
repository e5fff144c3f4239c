//! Transport-independent model of one inbound processing message.
//!
//! The gRPC layer converts Envoy's `ProcessingRequest` into a
//! [`ProcessingEvent`]; everything downstream of the session only sees these
//! types, which keeps the extraction and dispatch logic testable without a
//! proxy on the other end.

use bytes::Bytes;
use serde_json::{Map, Value};

// ─────────────────────────────────────────────────────────────────────────────
// Phase
// ─────────────────────────────────────────────────────────────────────────────

/// Point in the HTTP exchange at which the proxy consulted us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    RequestHeaders,
    RequestBody,
    RequestTrailers,
    ResponseHeaders,
    ResponseBody,
    ResponseTrailers,
}

impl Phase {
    /// Stable name used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::RequestHeaders => "request_headers",
            Phase::RequestBody => "request_body",
            Phase::RequestTrailers => "request_trailers",
            Phase::ResponseHeaders => "response_headers",
            Phase::ResponseBody => "response_body",
            Phase::ResponseTrailers => "response_trailers",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Headers
// ─────────────────────────────────────────────────────────────────────────────

/// A single header as delivered by the proxy.
///
/// Envoy may populate either the textual `value` or the `raw_value` bytes
/// depending on its configuration, so both are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderEntry {
    pub key: String,
    pub value: String,
    pub raw_value: Bytes,
}

impl HeaderEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            raw_value: Bytes::new(),
        }
    }

    /// Header carried only in raw byte form.
    pub fn raw(key: impl Into<String>, raw_value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: String::new(),
            raw_value: raw_value.into(),
        }
    }

    /// Textual value, falling back to the raw bytes decoded as UTF-8 when the
    /// textual form is empty. Invalid UTF-8 yields `None`.
    pub fn text(&self) -> Option<&str> {
        if !self.value.is_empty() {
            return Some(&self.value);
        }
        std::str::from_utf8(&self.raw_value).ok()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event
// ─────────────────────────────────────────────────────────────────────────────

/// Phase-specific content of an event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Headers(Vec<HeaderEntry>),
    Body(Bytes),
    Trailers(Vec<HeaderEntry>),
}

/// One inbound message on a processing stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingEvent {
    pub phase: Phase,
    /// Route-scoped attributes, keyed by namespace.
    pub attributes: Map<String, Value>,
    /// Filter metadata attached by earlier pipeline stages, keyed by filter name.
    pub upstream_filter_metadata: Map<String, Value>,
    pub payload: EventPayload,
}

impl ProcessingEvent {
    /// Response-headers event with no attributes or metadata.
    pub fn response_headers(headers: Vec<HeaderEntry>) -> Self {
        Self::new(Phase::ResponseHeaders, EventPayload::Headers(headers))
    }

    /// Response-body event with no attributes or metadata.
    pub fn response_body(body: impl Into<Bytes>) -> Self {
        Self::new(Phase::ResponseBody, EventPayload::Body(body.into()))
    }

    pub fn new(phase: Phase, payload: EventPayload) -> Self {
        Self {
            phase,
            attributes: Map::new(),
            upstream_filter_metadata: Map::new(),
            payload,
        }
    }

    /// Builder helper: attach a route attribute namespace.
    pub fn with_attribute(mut self, namespace: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(namespace.into(), value);
        self
    }

    /// Builder helper: attach filter metadata for one upstream filter.
    pub fn with_filter_metadata(mut self, filter: impl Into<String>, value: Value) -> Self {
        self.upstream_filter_metadata.insert(filter.into(), value);
        self
    }

    pub fn headers(&self) -> Option<&[HeaderEntry]> {
        match &self.payload {
            EventPayload::Headers(headers) => Some(headers),
            _ => None,
        }
    }

    pub fn body(&self) -> Option<&Bytes> {
        match &self.payload {
            EventPayload::Body(body) => Some(body),
            _ => None,
        }
    }
}
