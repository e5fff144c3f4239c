//! Response-body decoding.
//!
//! The proxy forwards bodies exactly as the backend produced them, so they may
//! be plain JSON or compressed with whatever `content-encoding` the backend
//! chose. Plain JSON is tried first; otherwise the compression family is
//! sniffed from the leading bytes and the body is inflated and re-checked.

use crate::error::DecodeError;
use serde_json::Value;
use std::io::Read;

/// Default upper bound on the size of a decompressed body.
pub const DEFAULT_MAX_DECODED_BYTES: usize = 8 * 1024 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Compression families recognised by [`BodyDecoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Zlib,
    Zstd,
    Brotli,
}

impl Compression {
    /// Identify the compression family from the byte stream.
    ///
    /// Brotli has no magic number, so it is the fallback for anything that is
    /// not recognisably one of the other formats.
    pub fn sniff(bytes: &[u8]) -> Self {
        if bytes.starts_with(&GZIP_MAGIC) {
            Compression::Gzip
        } else if bytes.starts_with(&ZSTD_MAGIC) {
            Compression::Zstd
        } else if is_zlib_header(bytes) {
            Compression::Zlib
        } else {
            Compression::Brotli
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Zlib => "deflate",
            Compression::Zstd => "zstd",
            Compression::Brotli => "br",
        }
    }
}

/// RFC 1950: CM = 8 and the 16-bit header is a multiple of 31.
fn is_zlib_header(bytes: &[u8]) -> bool {
    match bytes {
        [cmf, flg, ..] => cmf & 0x0f == 8 && (u16::from(*cmf) << 8 | u16::from(*flg)) % 31 == 0,
        _ => false,
    }
}

/// A body confirmed to be UTF-8 JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBody {
    pub text: String,
    pub document: Value,
    /// `None` when the body arrived uncompressed.
    pub compression: Option<Compression>,
}

/// Normalises raw response-body bytes into JSON text.
#[derive(Debug, Clone)]
pub struct BodyDecoder {
    max_decoded_bytes: usize,
}

impl Default for BodyDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DECODED_BYTES)
    }
}

impl BodyDecoder {
    pub fn new(max_decoded_bytes: usize) -> Self {
        Self { max_decoded_bytes }
    }

    /// Decode `raw` into JSON text, decompressing if needed.
    pub fn decode(&self, raw: &[u8]) -> Result<DecodedBody, DecodeError> {
        if raw.is_empty() {
            return Err(DecodeError::Empty);
        }

        if let Some(body) = parse_plain(raw) {
            return Ok(body);
        }

        let compression = Compression::sniff(raw);
        let inflated = self.inflate(raw, compression)?;
        let text = String::from_utf8(inflated).map_err(|e| DecodeError::NotJson {
            encoding: compression.as_str(),
            reason: e.to_string(),
        })?;
        let document = serde_json::from_str(&text).map_err(|e| DecodeError::NotJson {
            encoding: compression.as_str(),
            reason: e.to_string(),
        })?;

        Ok(DecodedBody {
            text,
            document,
            compression: Some(compression),
        })
    }

    fn inflate(&self, raw: &[u8], compression: Compression) -> Result<Vec<u8>, DecodeError> {
        let decompress = |source| DecodeError::Decompress {
            encoding: compression.as_str(),
            source,
        };
        let inflated = match compression {
            Compression::Gzip => self.read_capped(flate2::read::MultiGzDecoder::new(raw)),
            Compression::Zlib => self.read_capped(flate2::read::ZlibDecoder::new(raw)),
            Compression::Zstd => {
                let decoder = zstd::stream::read::Decoder::new(raw).map_err(decompress)?;
                self.read_capped(decoder)
            }
            Compression::Brotli => self.read_capped(brotli::Decompressor::new(raw, 4096)),
        };
        inflated.map_err(|e| match e {
            ReadFailure::Io(source) => decompress(source),
            ReadFailure::TooLarge => DecodeError::TooLarge {
                limit: self.max_decoded_bytes,
            },
        })
    }

    /// Read the whole stream, refusing to grow past the configured cap.
    fn read_capped<R: Read>(&self, reader: R) -> Result<Vec<u8>, ReadFailure> {
        let limit = self.max_decoded_bytes as u64;
        let mut out = Vec::new();
        reader
            .take(limit.saturating_add(1))
            .read_to_end(&mut out)
            .map_err(ReadFailure::Io)?;
        if out.len() as u64 > limit {
            return Err(ReadFailure::TooLarge);
        }
        Ok(out)
    }
}

enum ReadFailure {
    Io(std::io::Error),
    TooLarge,
}

fn parse_plain(raw: &[u8]) -> Option<DecodedBody> {
    let text = std::str::from_utf8(raw).ok()?;
    let document = serde_json::from_str(text).ok()?;
    Some(DecodedBody {
        text: text.to_string(),
        document,
        compression: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const BODY: &str = r#"{"usage":{"prompt_tokens":3,"completion_tokens":4,"total_tokens":7}}"#;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn brotli(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut enc = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
            enc.write_all(data).unwrap();
        }
        out
    }

    #[test]
    fn plain_json_returned_unchanged() {
        let decoded = BodyDecoder::default().decode(BODY.as_bytes()).unwrap();
        assert_eq!(decoded.text, BODY);
        assert_eq!(decoded.compression, None);
    }

    #[test]
    fn gzip_body_is_inflated() {
        let decoded = BodyDecoder::default().decode(&gzip(BODY.as_bytes())).unwrap();
        assert_eq!(decoded.text, BODY);
        assert_eq!(decoded.compression, Some(Compression::Gzip));
    }

    #[test]
    fn zlib_body_is_inflated() {
        let decoded = BodyDecoder::default().decode(&zlib(BODY.as_bytes())).unwrap();
        assert_eq!(decoded.text, BODY);
        assert_eq!(decoded.compression, Some(Compression::Zlib));
    }

    #[test]
    fn zstd_body_is_inflated() {
        let compressed = zstd::stream::encode_all(BODY.as_bytes(), 3).unwrap();
        let decoded = BodyDecoder::default().decode(&compressed).unwrap();
        assert_eq!(decoded.text, BODY);
        assert_eq!(decoded.compression, Some(Compression::Zstd));
    }

    #[test]
    fn brotli_body_is_inflated() {
        let decoded = BodyDecoder::default().decode(&brotli(BODY.as_bytes())).unwrap();
        assert_eq!(decoded.text, BODY);
        assert_eq!(decoded.compression, Some(Compression::Brotli));
    }

    #[test]
    fn compressed_non_json_is_rejected() {
        let err = BodyDecoder::default().decode(&gzip(b"not json at all")).unwrap_err();
        assert!(matches!(err, DecodeError::NotJson { encoding: "gzip", .. }));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(BodyDecoder::default().decode(b"hello <html>").is_err());
    }

    #[test]
    fn empty_body_is_rejected() {
        assert!(matches!(BodyDecoder::default().decode(b""), Err(DecodeError::Empty)));
    }

    #[test]
    fn oversized_inflation_is_rejected() {
        let big = format!("{{\"pad\":\"{}\"}}", "a".repeat(4096));
        let err = BodyDecoder::new(1024).decode(&gzip(big.as_bytes())).unwrap_err();
        assert!(matches!(err, DecodeError::TooLarge { limit: 1024 }));
    }

    #[test]
    fn sniffing_recognises_magic_numbers() {
        assert_eq!(Compression::sniff(&[0x1f, 0x8b, 0x08]), Compression::Gzip);
        assert_eq!(Compression::sniff(&ZSTD_MAGIC), Compression::Zstd);
        assert_eq!(Compression::sniff(&[0x78, 0x9c]), Compression::Zlib);
        assert_eq!(Compression::sniff(b"{x"), Compression::Brotli);
    }
}
