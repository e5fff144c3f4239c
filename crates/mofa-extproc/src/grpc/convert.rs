//! Conversions between the generated protobuf types and the crate's model.

use super::envoy::config::core::v3 as envoy_core;
use super::envoy::service::ext_proc::v3 as pb;
use crate::event::{EventPayload, HeaderEntry, Phase, ProcessingEvent};
use crate::response::{BodyMutation, CommonResponse, HeaderMutation, ProcessingReply, ResponseStatus};
use bytes::Bytes;
use pb::processing_request::Request;
use pb::processing_response::Response;
use prost_types::value::Kind;
use serde_json::{Map, Number, Value};
use tonic::Status;

// ─────────────────────────────────────────────────────────────────────────────
// google.protobuf.Struct <-> serde_json
// ─────────────────────────────────────────────────────────────────────────────

pub fn struct_to_json(s: &prost_types::Struct) -> Map<String, Value> {
    s.fields
        .iter()
        .map(|(k, v)| (k.clone(), value_to_json(v)))
        .collect()
}

fn value_to_json(v: &prost_types::Value) -> Value {
    match &v.kind {
        None | Some(Kind::NullValue(_)) => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(*b),
        Some(Kind::NumberValue(n)) => number_to_json(*n),
        Some(Kind::StringValue(s)) => Value::String(s.clone()),
        Some(Kind::StructValue(s)) => Value::Object(struct_to_json(s)),
        Some(Kind::ListValue(l)) => Value::Array(l.values.iter().map(value_to_json).collect()),
    }
}

/// Struct numbers are doubles; whole values come back as integers.
fn number_to_json(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

pub fn json_to_struct(map: &Map<String, Value>) -> prost_types::Struct {
    prost_types::Struct {
        fields: map
            .iter()
            .map(|(k, v)| (k.clone(), json_to_value(v)))
            .collect(),
    }
}

fn json_to_value(v: &Value) -> prost_types::Value {
    let kind = match v {
        Value::Null => Kind::NullValue(prost_types::NullValue::NullValue as i32),
        Value::Bool(b) => Kind::BoolValue(*b),
        Value::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or_default()),
        Value::String(s) => Kind::StringValue(s.clone()),
        Value::Array(items) => Kind::ListValue(prost_types::ListValue {
            values: items.iter().map(json_to_value).collect(),
        }),
        Value::Object(map) => Kind::StructValue(json_to_struct(map)),
    };
    prost_types::Value { kind: Some(kind) }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────────────────

fn headers_from(map: Option<envoy_core::HeaderMap>) -> Vec<HeaderEntry> {
    map.map(|m| m.headers)
        .unwrap_or_default()
        .into_iter()
        .map(|h| HeaderEntry {
            key: h.key,
            value: h.value,
            raw_value: Bytes::from(h.raw_value),
        })
        .collect()
}

impl TryFrom<pb::ProcessingRequest> for ProcessingEvent {
    type Error = Status;

    fn try_from(req: pb::ProcessingRequest) -> Result<Self, Self::Error> {
        let (phase, payload) = match req.request {
            Some(Request::RequestHeaders(h)) => {
                (Phase::RequestHeaders, EventPayload::Headers(headers_from(h.headers)))
            }
            Some(Request::ResponseHeaders(h)) => {
                (Phase::ResponseHeaders, EventPayload::Headers(headers_from(h.headers)))
            }
            Some(Request::RequestBody(b)) => (Phase::RequestBody, EventPayload::Body(b.body.into())),
            Some(Request::ResponseBody(b)) => {
                (Phase::ResponseBody, EventPayload::Body(b.body.into()))
            }
            Some(Request::RequestTrailers(t)) => {
                (Phase::RequestTrailers, EventPayload::Trailers(headers_from(t.trailers)))
            }
            Some(Request::ResponseTrailers(t)) => {
                (Phase::ResponseTrailers, EventPayload::Trailers(headers_from(t.trailers)))
            }
            None => return Err(Status::invalid_argument("processing request carries no phase")),
        };

        let attributes = req
            .attributes
            .iter()
            .map(|(ns, s)| (ns.clone(), Value::Object(struct_to_json(s))))
            .collect();
        let upstream_filter_metadata = req
            .metadata_context
            .map(|md| {
                md.filter_metadata
                    .iter()
                    .map(|(filter, s)| (filter.clone(), Value::Object(struct_to_json(s))))
                    .collect()
            })
            .unwrap_or_default();

        Ok(ProcessingEvent {
            phase,
            attributes,
            upstream_filter_metadata,
            payload,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

impl From<HeaderMutation> for pb::HeaderMutation {
    fn from(m: HeaderMutation) -> Self {
        Self {
            set_headers: m
                .set_headers
                .into_iter()
                .map(|h| envoy_core::HeaderValueOption {
                    header: Some(envoy_core::HeaderValue {
                        key: h.key,
                        value: h.value,
                        raw_value: h.raw_value.to_vec(),
                    }),
                })
                .collect(),
            remove_headers: m.remove_headers,
        }
    }
}

impl From<BodyMutation> for pb::BodyMutation {
    fn from(m: BodyMutation) -> Self {
        use pb::body_mutation::Mutation;
        let mutation = match (m.body, m.clear_body) {
            (Some(body), _) => Some(Mutation::Body(body.to_vec())),
            (None, true) => Some(Mutation::ClearBody(true)),
            (None, false) => None,
        };
        Self { mutation }
    }
}

impl From<CommonResponse> for pb::CommonResponse {
    fn from(r: CommonResponse) -> Self {
        let status = match r.status {
            ResponseStatus::Continue => pb::common_response::ResponseStatus::Continue,
        };
        Self {
            status: status as i32,
            header_mutation: r.header_mutation.map(Into::into),
            body_mutation: r.body_mutation.map(Into::into),
        }
    }
}

impl From<ProcessingReply> for pb::ProcessingResponse {
    fn from(reply: ProcessingReply) -> Self {
        let trailer_mutation = reply.response.header_mutation.clone().map(Into::into);
        let common = Some(pb::CommonResponse::from(reply.response));
        let response = match reply.phase {
            Phase::RequestHeaders => Response::RequestHeaders(pb::HeadersResponse { response: common }),
            Phase::ResponseHeaders => {
                Response::ResponseHeaders(pb::HeadersResponse { response: common })
            }
            Phase::RequestBody => Response::RequestBody(pb::BodyResponse { response: common }),
            Phase::ResponseBody => Response::ResponseBody(pb::BodyResponse { response: common }),
            Phase::RequestTrailers => Response::RequestTrailers(pb::TrailersResponse {
                header_mutation: trailer_mutation,
            }),
            Phase::ResponseTrailers => Response::ResponseTrailers(pb::TrailersResponse {
                header_mutation: trailer_mutation,
            }),
        };

        Self {
            response: Some(response),
            dynamic_metadata: reply.dynamic_metadata.map(|md| prost_types::Struct {
                fields: [(
                    md.namespace,
                    prost_types::Value {
                        kind: Some(Kind::StructValue(json_to_struct(&md.fields))),
                    },
                )]
                .into_iter()
                .collect(),
            }),
        }
    }
}
