//! `config.json` model.
//!
//! ```json
//! {
//!   "general": { "data_folder": "./data", "target_url": "http://localhost:8080/connections",
//!                "throttle_rate": 5, "run_on_launch": true },
//!   "gtfs": { "source": "https://example.org/gtfs.zip", "cron": "0 0 3 * * *" },
//!   "gtfs_realtime": { "source": "https://example.org/rt.pb", "cron": "*/30 * * * * *",
//!                      "auth_headers": { "Ocp-Apim-Subscription-Key": "..." } },
//!   "@context": { ... },
//!   "uri_templates": { "stop": "...", "route": "...", "trip": "...", "connection": "...",
//!                      "resolve": { ... } }
//! }
//! ```

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::ldes::LinkedDataContext;
use crate::scheduler::{CronExpr, Schedule};
use crate::templates::{IriTemplates, UriTemplateConfig};

pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    pub gtfs: FeedConfig,
    #[serde(default)]
    pub gtfs_realtime: Option<FeedConfig>,
    #[serde(rename = "@context", default)]
    pub context: Option<Value>,
    pub uri_templates: UriTemplateConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    pub data_folder: PathBuf,
    pub target_url: String,
    #[serde(default = "default_throttle_rate")]
    pub throttle_rate: usize,
    #[serde(default)]
    pub run_on_launch: bool,
    #[serde(default)]
    pub launch_mode: LaunchMode,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_throttle_rate() -> usize {
    5
}

fn default_content_type() -> String {
    DEFAULT_CONTENT_TYPE.to_string()
}

/// What "run on launch" does before the periodic schedule takes over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    /// One full refresh.
    #[default]
    FullRefresh,
    /// Only start the incremental trigger.
    IncrementalOnly,
}

/// A feed location, its trigger cadence and the headers sent when fetching it.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub source: String,
    pub cron: String,
    #[serde(default)]
    pub auth_headers: BTreeMap<String, String>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config = Self::from_json(&raw)?;
        info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| PipelineError::Config(format!("invalid config: {e}")))
    }

    /// Everything that can be checked before the first tick.
    pub fn validate(&self) -> Result<()> {
        if self.general.throttle_rate == 0 {
            return Err(PipelineError::Config(
                "general.throttle_rate must be at least 1".to_string(),
            ));
        }
        let target = reqwest::Url::parse(&self.general.target_url).map_err(|e| {
            PipelineError::Config(format!(
                "general.target_url {:?} is not a URL: {e}",
                self.general.target_url
            ))
        })?;
        if !matches!(target.scheme(), "http" | "https") {
            return Err(PipelineError::Config(format!(
                "general.target_url must be http(s), got {}",
                target.scheme()
            )));
        }
        if self.gtfs.source.trim().is_empty() {
            return Err(PipelineError::Config("gtfs.source is empty".to_string()));
        }
        self.schedule()?;
        self.templates()?;
        self.linked_data_context()?;
        Ok(())
    }

    pub fn schedule(&self) -> Result<Schedule> {
        Ok(Schedule {
            full_refresh: CronExpr::parse(&self.gtfs.cron)?,
            incremental: self
                .gtfs_realtime
                .as_ref()
                .map(|rt| CronExpr::parse(&rt.cron))
                .transpose()?,
            run_on_launch: self.general.run_on_launch,
            launch_mode: self.general.launch_mode,
        })
    }

    pub fn templates(&self) -> Result<IriTemplates> {
        IriTemplates::compile(&self.uri_templates)
    }

    pub fn linked_data_context(&self) -> Result<LinkedDataContext> {
        LinkedDataContext::with_overrides(self.context.as_ref())
    }
}
