//! Per-stream state and event routing.
//!
//! Each processing stream gets its own [`EventDispatcher`], which owns the
//! stream's [`StreamSession`]. Events arrive strictly in order and are
//! handled one at a time. Every event produces exactly one reply, and
//! accounting is handed to the shared [`RateLimitDispatcher`] without waiting.
//!
//! ```text
//! event ──► route metadata? ──► session
//!   │
//!   ├─ ResponseHeaders ──► header strategy ──────────────► hits ──► dispatcher
//!   ├─ ResponseBody ─────► decoder ──► body strategy ────► hits ──► dispatcher
//!   │                                        └──► usage metadata in reply
//!   └─ other phases ─────► passthrough reply
//! ```

use crate::decoder::BodyDecoder;
use crate::error::ExtractionError;
use crate::event::{Phase, ProcessingEvent};
use crate::metadata::{ExtractionConfig, RouteRateLimitConfig, TokenSource};
use crate::ratelimit::{RateLimitDispatcher, build_hits};
use crate::response::ProcessingReply;
use crate::usage::{Usage, UsageKeys, body, header};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, instrument, warn};

/// Settings that persist across the events of one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSession {
    pub backend_rate_limit_enabled: bool,
    pub backend_rate_limit_descriptor: Option<String>,
}

impl StreamSession {
    /// Replace the backend settings with those from the latest route metadata.
    pub fn apply(&mut self, route: RouteRateLimitConfig) {
        self.backend_rate_limit_enabled = route.enabled;
        self.backend_rate_limit_descriptor = route.descriptor;
    }
}

/// How a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The proxy closed its side.
    Completed,
    /// The inbound transport failed.
    TransportError,
    /// Nobody is reading replies any more.
    ReplyChannelClosed,
}

/// Routes the events of a single stream.
pub struct EventDispatcher {
    stream_id: u64,
    session: StreamSession,
    decoder: BodyDecoder,
    dispatcher: RateLimitDispatcher,
}

impl EventDispatcher {
    pub fn new(stream_id: u64, decoder: BodyDecoder, dispatcher: RateLimitDispatcher) -> Self {
        Self {
            stream_id,
            session: StreamSession::default(),
            decoder,
            dispatcher,
        }
    }

    pub fn session(&self) -> &StreamSession {
        &self.session
    }

    /// Handle one event and build its reply.
    pub fn handle(&mut self, event: &ProcessingEvent) -> ProcessingReply {
        if let Some(route) = RouteRateLimitConfig::from_attributes(&event.attributes) {
            debug!(
                stream_id = self.stream_id,
                enabled = route.enabled,
                descriptor = ?route.descriptor,
                "route rate-limit settings updated"
            );
            self.session.apply(route);
        }

        match event.phase {
            Phase::ResponseHeaders => self.on_response_headers(event),
            Phase::ResponseBody => self.on_response_body(event),
            other => {
                debug!(stream_id = self.stream_id, phase = %other, "passing through");
                ProcessingReply::passthrough(other)
            }
        }
    }

    fn on_response_headers(&mut self, event: &ProcessingEvent) -> ProcessingReply {
        let reply = ProcessingReply::headers_continue(Phase::ResponseHeaders);

        let Some(extraction) = ExtractionConfig::from_filter_metadata(&event.upstream_filter_metadata)
        else {
            return reply;
        };
        if !extraction.allows(TokenSource::Header) {
            return reply;
        }
        let Some(headers) = event.headers() else {
            warn!(stream_id = self.stream_id, "response headers event without headers");
            return reply;
        };

        match UsageKeys::from_config(&extraction).and_then(|keys| header::extract(headers, &keys)) {
            Ok(usage) => self.account(&usage, &extraction),
            Err(e) => self.extraction_failed(TokenSource::Header, &e, None),
        }
        reply
    }

    fn on_response_body(&mut self, event: &ProcessingEvent) -> ProcessingReply {
        let Some(extraction) = ExtractionConfig::from_filter_metadata(&event.upstream_filter_metadata)
        else {
            return ProcessingReply::body_continue();
        };
        if !extraction.allows(TokenSource::Body) {
            return ProcessingReply::body_continue();
        }
        let Some(raw) = event.body() else {
            warn!(stream_id = self.stream_id, "response body event without body");
            return ProcessingReply::body_continue();
        };

        let decoded = match self.decoder.decode(raw) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(
                    stream_id = self.stream_id,
                    body_len = raw.len(),
                    error = %e,
                    "could not decode response body"
                );
                return ProcessingReply::body_continue();
            }
        };

        let usage = match UsageKeys::from_config(&extraction)
            .and_then(|keys| body::extract(&decoded.document, &keys))
        {
            Ok(usage) => usage,
            Err(e) => {
                self.extraction_failed(TokenSource::Body, &e, Some(&decoded.text));
                return ProcessingReply::body_continue();
            }
        };

        self.account(&usage, &extraction);
        ProcessingReply::body_with_usage(&usage, &extraction)
    }

    fn account(&self, usage: &Usage, extraction: &ExtractionConfig) {
        debug!(
            stream_id = self.stream_id,
            prompt = usage.prompt_tokens,
            completion = usage.completion_tokens,
            total = usage.total_tokens,
            model = %usage.model,
            "token usage extracted"
        );
        let hits = build_hits(usage, &self.session, extraction);
        if hits.is_empty() {
            return;
        }
        // Queue-full rejections are logged by the dispatcher itself.
        if let Err(e) = self.dispatcher.submit(hits) {
            debug!(stream_id = self.stream_id, error = %e, "accounting batch not submitted");
        }
    }

    fn extraction_failed(&self, source: TokenSource, error: &ExtractionError, body: Option<&str>) {
        warn!(
            stream_id = self.stream_id,
            source = ?source,
            error = %error,
            body = body.unwrap_or_default(),
            "usage details not found"
        );
    }

    /// Drive the stream until the proxy closes it, it fails, or nobody reads
    /// the replies. Dropping `outbound` on return completes the reply stream.
    #[instrument(skip_all, fields(stream_id = self.stream_id))]
    pub async fn serve_stream<S, E>(
        mut self,
        mut inbound: S,
        outbound: mpsc::Sender<ProcessingReply>,
    ) -> StreamOutcome
    where
        S: Stream<Item = Result<ProcessingEvent, E>> + Unpin,
        E: std::fmt::Display,
    {
        loop {
            match inbound.next().await {
                Some(Ok(event)) => {
                    let reply = self.handle(&event);
                    if outbound.send(reply).await.is_err() {
                        debug!("reply receiver dropped, ending stream");
                        return StreamOutcome::ReplyChannelClosed;
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "error on external processing stream");
                    return StreamOutcome::TransportError;
                }
                None => {
                    debug!("external processing stream closed by peer");
                    return StreamOutcome::Completed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        EXT_AUTHZ_FILTER_NAME, EXT_PROC_METADATA_CONTEXT_KEY, ROUTE_METADATA_ATTRIBUTE,
    };
    use crate::ratelimit::{DispatcherConfig, LoggingRateLimitClient};
    use serde_json::json;
    use std::sync::Arc;

    fn dispatcher() -> EventDispatcher {
        let rl = RateLimitDispatcher::spawn(
            Arc::new(LoggingRateLimitClient::new()),
            DispatcherConfig::default(),
        );
        EventDispatcher::new(1, BodyDecoder::default(), rl)
    }

    fn route(enabled: &str, descriptor: &str) -> serde_json::Value {
        json!({ ROUTE_METADATA_ATTRIBUTE: {
            "EnableBackendBasedAIRatelimit": enabled,
            "BackendBasedAIRatelimitDescriptorValue": descriptor
        }})
    }

    #[tokio::test]
    async fn route_settings_persist_until_replaced() {
        let mut d = dispatcher();
        d.handle(
            &ProcessingEvent::response_headers(vec![])
                .with_attribute(EXT_PROC_METADATA_CONTEXT_KEY, route("true", "b1")),
        );
        assert!(d.session().backend_rate_limit_enabled);

        d.handle(&ProcessingEvent::response_body(&b"{}"[..]));
        assert_eq!(d.session().backend_rate_limit_descriptor.as_deref(), Some("b1"));

        d.handle(
            &ProcessingEvent::response_body(&b"{}"[..])
                .with_attribute(EXT_PROC_METADATA_CONTEXT_KEY, route("false", "b2")),
        );
        assert_eq!(
            d.session(),
            &StreamSession {
                backend_rate_limit_enabled: false,
                backend_rate_limit_descriptor: Some("b2".into()),
            }
        );
    }

    #[tokio::test]
    async fn headers_phase_never_attaches_metadata() {
        let mut d = dispatcher();
        let event = ProcessingEvent::response_headers(vec![
            crate::event::HeaderEntry::new("p", "1"),
            crate::event::HeaderEntry::new("c", "2"),
            crate::event::HeaderEntry::new("t", "3"),
        ])
        .with_filter_metadata(
            EXT_AUTHZ_FILTER_NAME,
            json!({"promptTokenID": "p", "completionTokenID": "c", "totalTokenID": "t"}),
        );
        let reply = d.handle(&event);
        assert_eq!(reply, ProcessingReply::headers_continue(Phase::ResponseHeaders));
    }

    #[tokio::test]
    async fn body_without_ext_authz_metadata_just_continues() {
        let mut d = dispatcher();
        let reply = d.handle(&ProcessingEvent::response_body(&br#"{"a":1}"#[..]));
        assert_eq!(reply, ProcessingReply::body_continue());
    }

    #[tokio::test]
    async fn undecodable_body_just_continues() {
        let mut d = dispatcher();
        let event = ProcessingEvent::response_body(&b"\x00\x01garbage"[..]).with_filter_metadata(
            EXT_AUTHZ_FILTER_NAME,
            json!({"promptTokenID": "a", "completionTokenID": "b", "totalTokenID": "c"}),
        );
        assert_eq!(d.handle(&event), ProcessingReply::body_continue());
    }

    #[tokio::test]
    async fn header_source_skips_body_extraction() {
        let mut d = dispatcher();
        let event = ProcessingEvent::response_body(&br#"{"p":1,"c":2,"t":3}"#[..]).with_filter_metadata(
            EXT_AUTHZ_FILTER_NAME,
            json!({"extractTokenFrom": "header", "promptTokenID": "p", "completionTokenID": "c", "totalTokenID": "t"}),
        );
        assert_eq!(d.handle(&event), ProcessingReply::body_continue());
    }

    #[tokio::test]
    async fn minimum_integer_header_still_gets_a_reply() {
        let mut d = dispatcher();
        let event = ProcessingEvent::response_headers(vec![
            crate::event::HeaderEntry::new("p", "-9223372036854775808"),
            crate::event::HeaderEntry::new("c", "-1"),
            crate::event::HeaderEntry::new("t", "0"),
        ])
        .with_attribute(EXT_PROC_METADATA_CONTEXT_KEY, route("true", "b1"))
        .with_filter_metadata(
            EXT_AUTHZ_FILTER_NAME,
            json!({"promptTokenID": "p", "completionTokenID": "c", "totalTokenID": "t"}),
        );
        assert_eq!(d.handle(&event), ProcessingReply::headers_continue(Phase::ResponseHeaders));
    }

    #[tokio::test]
    async fn text_format_route_metadata_enables_backend_accounting() {
        let mut d = dispatcher();
        let text = r#"filter_metadata {
  key: "envoy.filters.http.ext_proc"
  value {
    fields {
      key: "BackendBasedAIRatelimitDescriptorValue"
      value { string_value: "openai-east" }
    }
    fields {
      key: "EnableBackendBasedAIRatelimit"
      value { string_value: "true" }
    }
  }
}"#;
        d.handle(
            &ProcessingEvent::response_headers(vec![])
                .with_attribute(EXT_PROC_METADATA_CONTEXT_KEY, json!({ ROUTE_METADATA_ATTRIBUTE: text })),
        );
        assert_eq!(
            d.session(),
            &StreamSession {
                backend_rate_limit_enabled: true,
                backend_rate_limit_descriptor: Some("openai-east".into()),
            }
        );
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn body_extraction_failure_warns_with_body() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let mut d = dispatcher();
        let event = ProcessingEvent::response_body(&br#"{"usage":{"prompt_tokens":1}}"#[..])
            .with_filter_metadata(
                EXT_AUTHZ_FILTER_NAME,
                json!({
                    "promptTokenID": "usage.prompt_tokens",
                    "completionTokenID": "usage.completion_tokens",
                    "totalTokenID": "usage.total_tokens"
                }),
            );
        let reply = tracing::subscriber::with_default(subscriber, || d.handle(&event));
        assert_eq!(reply, ProcessingReply::body_continue());

        let out = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(out.contains("WARN"), "{out}");
        assert!(out.contains("usage details not found"), "{out}");
        assert!(out.contains("body="), "{out}");
        assert!(out.contains("prompt_tokens"), "{out}");
    }

    #[tokio::test]
    async fn other_phases_pass_through() {
        let mut d = dispatcher();
        let event = ProcessingEvent::new(
            Phase::RequestHeaders,
            crate::event::EventPayload::Headers(vec![]),
        );
        assert_eq!(d.handle(&event), ProcessingReply::passthrough(Phase::RequestHeaders));
    }
}
