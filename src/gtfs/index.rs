//! In-memory lookup tables for realtime matching, plus the delay history
//! they are paired with.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::tables::{ScheduledStop, StaticTables, StopTimeRow, reader};
use crate::error::{PipelineError, Result};
use crate::history::HistoryStore;

pub const HISTORY_FILE: &str = "history.db";

const REQUIRED_FILES: [&str; 4] = ["trips.txt", "stops.txt", "routes.txt", "stop_times.txt"];

#[derive(Debug)]
pub struct IndexTables {
    pub tables: StaticTables,
    /// Timed stops per trip, ordered by stop sequence.
    pub stop_times: HashMap<String, Vec<ScheduledStop>>,
}

#[derive(Debug)]
pub enum IndexBuild {
    Ready(IndexTables),
    /// The static feed has not been extracted yet.
    NotYetAvailable,
}

/// Blocking; run it from `spawn_blocking`.
pub trait IndexBuilder: Send + Sync {
    fn build(&self, data_dir: &Path) -> Result<IndexBuild>;
}

#[derive(Debug, Clone, Default)]
pub struct GtfsIndexBuilder;

impl IndexBuilder for GtfsIndexBuilder {
    fn build(&self, data_dir: &Path) -> Result<IndexBuild> {
        if let Some(missing) = REQUIRED_FILES.iter().find(|f| !data_dir.join(f).exists()) {
            warn!(file = *missing, dir = %data_dir.display(), "Static GTFS not available yet");
            return Ok(IndexBuild::NotYetAvailable);
        }

        let tables = StaticTables::load(data_dir)?;
        let mut stop_times: HashMap<String, Vec<ScheduledStop>> = HashMap::new();
        let (mut untimed, mut invalid) = (0usize, 0usize);
        for record in reader(data_dir, "stop_times.txt")?.into_deserialize::<StopTimeRow>() {
            let parsed = record
                .map_err(|e| PipelineError::Transform(format!("stop_times.txt: {e}")))
                .and_then(|row| Ok((ScheduledStop::from_row(&row)?, row.trip_id)));
            match parsed {
                Ok((Some(stop), trip_id)) => stop_times.entry(trip_id).or_default().push(stop),
                Ok((None, _)) => untimed += 1,
                Err(e) => {
                    invalid += 1;
                    warn!(error = %e, "Skipping stop_times.txt row");
                }
            }
        }
        for stops in stop_times.values_mut() {
            stops.sort_by_key(|s| s.stop_sequence);
        }

        info!(
            trips = tables.trips.len(),
            stops = tables.stops.len(),
            timed_trips = stop_times.len(),
            untimed_rows = untimed,
            invalid_rows = invalid,
            "Index tables built"
        );
        Ok(IndexBuild::Ready(IndexTables { tables, stop_times }))
    }
}

/// Index tables together with the open delay history. Only ever
/// constructed once the store has been opened successfully.
#[derive(Debug)]
pub struct IndexSet {
    pub tables: IndexTables,
    pub history: Arc<HistoryStore>,
}

impl IndexSet {
    pub fn new(tables: IndexTables, history: HistoryStore) -> Self {
        Self {
            tables,
            history: Arc::new(history),
        }
    }

    /// Opens `history.db` in `data_dir` and pairs it with `tables`.
    pub fn open(tables: IndexTables, data_dir: &Path) -> Result<Self> {
        let history = HistoryStore::open(data_dir.join(HISTORY_FILE))?;
        Ok(Self::new(tables, history))
    }

    pub fn close(&self) -> Result<()> {
        self.history.close()
    }
}
