//! The two passes the scheduler runs, wired to swappable collaborators.

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::config::{Config, FeedConfig};
use crate::delivery::{EventSink, HttpSink, ThrottledDeliveryEngine};
use crate::error::{PipelineError, Result};
use crate::fetch::{ArchiveSource, BasicClient, ZipArchiveSource, load_source};
use crate::gtfs::{
    ConnectionGenerator, GtfsConnectionGenerator, GtfsIndexBuilder, GtfsRealtimeParser,
    IndexBuild, IndexBuilder, IndexSet, RealtimeSource,
};
use crate::ldes::{ConnectionVersioner, LinkedDataContext};
use crate::pipeline::{PassReport, run_pass};
use crate::templates::IriTemplates;

/// The external pieces a pass is built from.
#[derive(Clone)]
pub struct Collaborators {
    pub archive: Arc<dyn ArchiveSource>,
    pub generator: Arc<dyn ConnectionGenerator>,
    pub index_builder: Arc<dyn IndexBuilder>,
    pub realtime: Arc<dyn RealtimeSource>,
    pub sink: Arc<dyn EventSink>,
}

impl Collaborators {
    /// HTTP/zip/GTFS implementations as configured.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = BasicClient::new()
            .map_err(|e| PipelineError::Config(format!("cannot build HTTP client: {e}")))?;
        let sink = HttpSink::new(
            client,
            &config.general.target_url,
            &config.general.content_type,
        )?;
        Ok(Self {
            archive: Arc::new(ZipArchiveSource::new(
                config.gtfs.source.clone(),
                config.gtfs.auth_headers.clone(),
            )),
            generator: Arc::new(GtfsConnectionGenerator),
            index_builder: Arc::new(GtfsIndexBuilder),
            realtime: Arc::new(GtfsRealtimeParser),
            sink: Arc::new(sink),
        })
    }
}

/// Per-process settings shared by every pass.
#[derive(Clone)]
pub struct JobSettings {
    pub data_dir: PathBuf,
    pub throttle_rate: usize,
    pub templates: Arc<IriTemplates>,
    pub context: Arc<LinkedDataContext>,
    pub realtime_feed: Option<FeedConfig>,
}

impl JobSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            data_dir: config.general.data_folder.clone(),
            throttle_rate: config.general.throttle_rate,
            templates: Arc::new(config.templates()?),
            context: Arc::new(config.linked_data_context()?),
            realtime_feed: config.gtfs_realtime.clone(),
        })
    }

    /// A fresh versioner: one run timestamp and stop-dedup set per pass.
    fn versioner(&self) -> ConnectionVersioner {
        ConnectionVersioner::new(self.templates.clone(), self.context.clone(), Utc::now())
    }
}

/// Fetches and extracts the static archive, then streams every new or
/// changed connection to the sink.
#[instrument(name = "full_refresh", skip_all, fields(data_dir = %settings.data_dir.display()))]
pub async fn full_refresh_pass(
    collaborators: &Collaborators,
    settings: &JobSettings,
) -> Result<PassReport> {
    collaborators
        .archive
        .fetch_and_extract(&settings.data_dir)
        .await?;
    info!("Static archive extracted");

    let engine = ThrottledDeliveryEngine::new(collaborators.sink.clone(), settings.throttle_rate)?;
    let generator = collaborators.generator.clone();
    let dir = settings.data_dir.clone();
    run_pass(move || generator.generate(&dir), settings.versioner(), &engine).await
}

/// Builds the index tables and opens the history store. `None` when the
/// static data has not been extracted yet.
#[instrument(skip_all)]
pub async fn build_index(
    collaborators: &Collaborators,
    settings: &JobSettings,
) -> Result<Option<IndexSet>> {
    let builder = collaborators.index_builder.clone();
    let dir = settings.data_dir.clone();
    tokio::task::spawn_blocking(move || match builder.build(&dir)? {
        IndexBuild::Ready(tables) => Ok(Some(IndexSet::open(tables, &dir)?)),
        IndexBuild::NotYetAvailable => Ok(None),
    })
    .await?
}

/// Fetches the realtime feed and streams the connections whose delays changed.
#[instrument(name = "incremental", skip_all)]
pub async fn incremental_pass(
    collaborators: &Collaborators,
    settings: &JobSettings,
    index: Arc<IndexSet>,
) -> Result<PassReport> {
    let feed = settings.realtime_feed.as_ref().ok_or_else(|| {
        PipelineError::Config("no gtfs_realtime feed configured".to_string())
    })?;
    let bytes = load_source(&feed.source, &feed.auth_headers).await?;
    info!(bytes = bytes.len(), "Realtime feed fetched");

    let engine = ThrottledDeliveryEngine::new(collaborators.sink.clone(), settings.throttle_rate)?;
    let realtime = collaborators.realtime.clone();
    run_pass(
        move || realtime.connections(bytes, index),
        settings.versioner(),
        &engine,
    )
    .await
}
