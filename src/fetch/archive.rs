use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::info;
use zip::ZipArchive;

use super::load_source;
use crate::error::{PipelineError, Result};

/// Brings a fresh static GTFS feed into the data folder.
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    async fn fetch_and_extract(&self, data_dir: &Path) -> Result<()>;
}

/// Zipped GTFS feed from a URL or a local path.
pub struct ZipArchiveSource {
    source: String,
    headers: BTreeMap<String, String>,
}

impl ZipArchiveSource {
    pub fn new(source: impl Into<String>, headers: BTreeMap<String, String>) -> Self {
        Self {
            source: source.into(),
            headers,
        }
    }
}

#[async_trait]
impl ArchiveSource for ZipArchiveSource {
    #[tracing::instrument(skip(self), fields(source = %self.source))]
    async fn fetch_and_extract(&self, data_dir: &Path) -> Result<()> {
        let bytes = load_source(&self.source, &self.headers).await?;
        info!(bytes = bytes.len(), "Decompressing GTFS source");

        let source = self.source.clone();
        let dir: PathBuf = data_dir.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let extract_err = |e: &dyn std::fmt::Display| {
                PipelineError::source_unavailable(source.as_str(), "extract", e)
            };
            let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(|e| extract_err(&e))?;
            clear_static_files(&dir).map_err(|e| extract_err(&e))?;
            archive.extract(&dir).map_err(|e| extract_err(&e))?;
            info!(files = archive.len(), dir = %dir.display(), "GTFS source extracted");
            Ok(())
        })
        .await
        .map_err(|e| PipelineError::source_unavailable(self.source.as_str(), "extract", e))?
    }
}

/// Removes the extracted `*.txt` files of the previous feed; persistent
/// stores (`*.db`) in the same folder are kept.
pub fn clear_static_files(data_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(data_dir)?;
    for entry in std::fs::read_dir(data_dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("txt") {
            std::fs::remove_file(path)?;
        }
    }
    Ok(())
}
