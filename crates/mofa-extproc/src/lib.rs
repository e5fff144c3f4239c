//! MoFA external-processing service.
//!
//! Sits beside an Envoy-style proxy on its `ext_proc` stream. For each
//! upstream response it reads AI token usage out of the headers or the
//! (possibly compressed) JSON body, hands token-weighted hits to an external
//! rate limiter off the reply path, and answers every event with "continue",
//! attaching the usage as dynamic metadata when it came from the body.
//!
//! # Layout
//!
//! | Module | Role |
//! |--------|------|
//! | [`event`] | transport-independent inbound events |
//! | [`metadata`] | route attributes and upstream filter metadata |
//! | [`decoder`] | JSON / gzip / deflate / zstd / brotli body decoding |
//! | [`usage`] | header and JSON-path extraction strategies |
//! | [`ratelimit`] | hit construction and the bounded dispatcher |
//! | [`response`] | reply and dynamic-metadata construction |
//! | [`session`] | per-stream state and event routing |
//! | [`config`] | layered service configuration |
//! | `grpc` | Envoy wire protocol and server (feature `grpc`) |

pub mod config;
pub mod decoder;
pub mod error;
pub mod event;
pub mod metadata;
pub mod ratelimit;
pub mod response;
pub mod session;
pub mod usage;

#[cfg(feature = "grpc")]
pub mod grpc;

pub use config::ExtProcConfig;
pub use error::{ExtProcError, ExtProcResult};
pub use event::{HeaderEntry, Phase, ProcessingEvent};
pub use response::ProcessingReply;
pub use session::{EventDispatcher, StreamOutcome, StreamSession};
