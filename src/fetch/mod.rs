//! Fetching feeds: HTTP transport seam, auth header injection, and static
//! archive download + extraction.

mod archive;
pub mod auth;
mod client;

pub use archive::{ArchiveSource, ZipArchiveSource, clear_static_files};
pub use auth::AuthHeaders;
pub use client::{BasicClient, HttpClient};

use bytes::Bytes;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{PipelineError, Result};

/// GETs `url` and returns the body. Statuses outside 2xx/3xx are errors.
pub async fn fetch_bytes<C: HttpClient + ?Sized>(client: &C, url: &str) -> Result<Bytes> {
    let parsed = url
        .parse()
        .map_err(|e| PipelineError::source_unavailable(url, "download", e))?;
    let req = reqwest::Request::new(reqwest::Method::GET, parsed);

    let resp = client
        .execute(req)
        .await
        .map_err(|e| PipelineError::source_unavailable(url, "download", e))?;
    let status = resp.status();
    if !(status.is_success() || status.is_redirection()) {
        return Err(PipelineError::source_unavailable(
            url,
            "download",
            format!("HTTP error ({status})"),
        ));
    }
    debug!(url, %status, "Downloading");
    resp.bytes()
        .await
        .map_err(|e| PipelineError::source_unavailable(url, "download", e))
}

/// Loads a feed from a local file path or over http(s) with the given
/// auth headers.
#[tracing::instrument(skip(headers), fields(source = %source))]
pub async fn load_source(source: &str, headers: &BTreeMap<String, String>) -> Result<Bytes> {
    if is_remote(source) {
        let basic = BasicClient::new().map_err(|e| PipelineError::source_unavailable(source, "download", e))?;
        let client = AuthHeaders::new(basic, headers)?;
        fetch_bytes(&client, source).await
    } else {
        let bytes = tokio::fs::read(source)
            .await
            .map_err(|e| PipelineError::source_unavailable(source, "read", e))?;
        Ok(Bytes::from(bytes))
    }
}

pub fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_remote() {
        assert!(is_remote("https://api.delijn.be/gtfs/v3/realtime"));
        assert!(is_remote("http://localhost/gtfs.zip"));
        assert!(!is_remote("./test/data/gtfs.zip"));
        assert!(!is_remote("ftp://host/gtfs.zip"));
    }

    #[tokio::test]
    async fn test_load_missing_local_file_is_source_unavailable() {
        let err = load_source("/definitely/not/here.pb", &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable { phase: "read", .. }));
    }

    #[tokio::test]
    async fn test_load_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.pb");
        std::fs::write(&path, b"abc").unwrap();
        let bytes = load_source(path.to_str().unwrap(), &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"abc");
    }
}
