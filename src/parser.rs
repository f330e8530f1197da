//! Protobuf parser for GTFS Realtime feeds.

use flate2::read::GzDecoder;
use prost::Message;
use std::io::Read;

use crate::error::{PipelineError, Result};
use crate::gtfs_rt::FeedMessage;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`], transparently
/// gunzipping feeds that are served or stored compressed.
///
/// # Errors
///
/// Returns [`PipelineError::SourceUnavailable`] if the bytes are neither a
/// valid `FeedMessage` nor a gzip stream containing one.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedMessage> {
    let decoded;
    let raw = if bytes.starts_with(&GZIP_MAGIC) {
        let mut buf = Vec::new();
        GzDecoder::new(bytes)
            .read_to_end(&mut buf)
            .map_err(|e| PipelineError::source_unavailable("gtfs-realtime", "decompress", e))?;
        decoded = buf;
        decoded.as_slice()
    } else {
        bytes
    };
    FeedMessage::decode(raw)
        .map_err(|e| PipelineError::source_unavailable("gtfs-realtime", "decode", e))
}
