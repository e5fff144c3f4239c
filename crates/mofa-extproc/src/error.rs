//! Error types for the external-processing service.
//!
//! The per-event failure classes ([`DecodeError`], [`ExtractionError`],
//! [`DispatchError`]) are caught where they occur, logged, and degrade to
//! "no usage signal for this event". None of them ends a stream.
//! [`ExtProcError`] covers bootstrap failures that stop the process.

use thiserror::Error;

/// The response body is neither JSON nor a compressed JSON document.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// The body is empty.
    #[error("response body is empty")]
    Empty,

    /// The (possibly decompressed) bytes are not a JSON document.
    #[error("body is not valid JSON ({encoding}): {reason}")]
    NotJson {
        encoding: &'static str,
        reason: String,
    },

    /// A decompressor rejected the byte stream.
    #[error("{encoding} decompression failed: {source}")]
    Decompress {
        encoding: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The decompressed body exceeds the configured size cap.
    #[error("decompressed body exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// A required usage field could not be resolved or parsed.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExtractionError {
    /// The upstream metadata does not name where to find this field.
    #[error("no extraction key configured for '{0}'")]
    MissingConfig(&'static str),

    /// No header with the configured name was present.
    #[error("header '{header}' for '{field}' not found")]
    MissingHeader { field: &'static str, header: String },

    /// A header or leaf value is not a base-10 integer.
    #[error("value '{value}' for '{field}' is not an integer")]
    InvalidInteger { field: &'static str, value: String },

    /// A JSON path segment is absent from the document.
    #[error("path '{path}' for '{field}' not found at segment '{segment}'")]
    PathNotFound {
        field: &'static str,
        path: String,
        segment: String,
    },

    /// A JSON path has no segments after stripping the root marker.
    #[error("path for '{0}' is empty")]
    EmptyPath(&'static str),
}

/// Route metadata delivered as a string is neither JSON nor protobuf text.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TextFormatError {
    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("unexpected '{found}' at offset {offset}")]
    Unexpected { found: char, offset: usize },

    #[error("unterminated string starting at offset {0}")]
    UnterminatedString(usize),
}

/// Accounting could not be handed to, or completed by, the rate-limit client.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// The bounded dispatch queue is full; the batch was shed.
    #[error("dispatch queue is full ({capacity} batches pending)")]
    QueueFull { capacity: usize },

    /// The dispatcher has shut down.
    #[error("dispatcher is closed")]
    Closed,

    /// The rate-limit service call failed.
    #[error("rate-limit client error: {0}")]
    Client(String),
}

/// Configuration loading or validation failure.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("config parsing error: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("invalid config value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Process-level errors surfaced from bootstrap and serving.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExtProcError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "grpc")]
    #[error("grpc transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

pub type ExtProcResult<T> = Result<T, ExtProcError>;
