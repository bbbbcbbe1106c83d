//! Report serialization
//!
//! Reports travel as JSON, gzip-compressed on the HTTP and TCP paths.
//! Decoding never panics on hostile input; the decompressed size is capped
//! at `MAX_REPORT_SIZE`.

use crate::buffer::BufferMut;
use crate::report::Report;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use thiserror::Error;
use tokio_util::codec::LengthDelimitedCodec;

/// Upper bound on a decoded report payload
pub const MAX_REPORT_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("gzip error: {0}")]
    Gzip(#[from] std::io::Error),

    #[error("report exceeds {limit} bytes once decompressed")]
    TooLarge { limit: u64 },

    #[error("unsupported content encoding: {0}")]
    UnsupportedEncoding(String),
}

/// Wire encoding of a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    Json,
    #[default]
    JsonGzip,
}

impl Encoding {
    /// Map an HTTP `Content-Encoding` header value
    pub fn from_content_encoding(header: Option<&str>) -> Result<Self, CodecError> {
        match header.map(str::trim) {
            None | Some("") | Some("identity") => Ok(Encoding::Json),
            Some(v) if v.eq_ignore_ascii_case("gzip") => Ok(Encoding::JsonGzip),
            Some(other) => Err(CodecError::UnsupportedEncoding(other.to_string())),
        }
    }

    /// Value for the HTTP `Content-Encoding` header, if any
    pub fn content_encoding(&self) -> Option<&'static str> {
        match self {
            Encoding::Json => None,
            Encoding::JsonGzip => Some("gzip"),
        }
    }
}

/// Encode a report into a fresh vector
pub fn encode(report: &Report, encoding: Encoding) -> Result<Vec<u8>, CodecError> {
    let mut buf = BufferMut::unpooled();
    encode_into(report, encoding, &mut buf)?;
    Ok(std::mem::take(buf.as_mut_vec()))
}

/// Encode a report, appending to `buf`
pub fn encode_into(
    report: &Report,
    encoding: Encoding,
    buf: &mut BufferMut,
) -> Result<(), CodecError> {
    match encoding {
        Encoding::Json => serde_json::to_writer(buf, report)?,
        Encoding::JsonGzip => {
            let mut encoder = GzEncoder::new(buf, Compression::default());
            serde_json::to_writer(&mut encoder, report)?;
            encoder.finish()?.flush()?;
        }
    }
    Ok(())
}

/// Framing for report streams over TCP: a 4-byte big-endian length prefix
/// followed by one encoded report
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_REPORT_SIZE as usize)
        .new_codec()
}

/// Decode a report
pub fn decode(data: &[u8], encoding: Encoding) -> Result<Report, CodecError> {
    match encoding {
        Encoding::Json => {
            if data.len() as u64 > MAX_REPORT_SIZE {
                return Err(CodecError::TooLarge {
                    limit: MAX_REPORT_SIZE,
                });
            }
            Ok(serde_json::from_slice(data)?)
        }
        Encoding::JsonGzip => {
            let mut plain = Vec::new();
            GzDecoder::new(data)
                .take(MAX_REPORT_SIZE + 1)
                .read_to_end(&mut plain)?;
            if plain.len() as u64 > MAX_REPORT_SIZE {
                return Err(CodecError::TooLarge {
                    limit: MAX_REPORT_SIZE,
                });
            }
            Ok(serde_json::from_slice(&plain)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::report::{topology, Node};
    use chrono::Utc;

    fn sample() -> Report {
        let mut rpt = Report::new();
        rpt.ts = Some(Utc::now());
        rpt.topology_mut(topology::HOST).add_node(
            Node::new("host-a")
                .with_latest("hostname", Utc::now(), "host-a")
                .with_set("local_networks", ["10.0.0.0/8"]),
        );
        rpt
    }

    #[test]
    fn test_roundtrip_gzip() {
        let rpt = sample();
        let data = encode(&rpt, Encoding::JsonGzip).expect("encode");
        // gzip magic
        assert_eq!(&data[..2], &[0x1f, 0x8b]);
        assert_eq!(decode(&data, Encoding::JsonGzip).expect("decode"), rpt);
    }

    #[test]
    fn test_roundtrip_into_pooled_buffer() {
        let pool = BufferPool::new(1);
        let rpt = sample();
        let mut buf = pool.acquire();
        encode_into(&rpt, Encoding::Json, &mut buf).expect("encode");
        let frozen = buf.freeze();
        assert_eq!(decode(&frozen, Encoding::Json).expect("decode"), rpt);
    }

    #[test]
    fn test_malformed_input_is_an_error() {
        assert!(decode(b"not json", Encoding::Json).is_err());
        assert!(decode(b"not gzip", Encoding::JsonGzip).is_err());
        assert!(decode(&[], Encoding::JsonGzip).is_err());
    }

    #[test]
    fn test_content_encoding_header() {
        assert_eq!(
            Encoding::from_content_encoding(None).expect("none"),
            Encoding::Json
        );
        assert_eq!(
            Encoding::from_content_encoding(Some("GZIP")).expect("gzip"),
            Encoding::JsonGzip
        );
        assert!(Encoding::from_content_encoding(Some("br")).is_err());
        assert_eq!(Encoding::JsonGzip.content_encoding(), Some("gzip"));
    }
}
