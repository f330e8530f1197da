use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::{ConnectionIter, PendingConnection};
use super::tables::{ScheduledStop, ServiceCalendar, StaticTables, StopTimeRow, TripDay, reader};
use crate::error::{PipelineError, Result};
use crate::history::{HistoryStore, PendingWrite};

pub const LEDGER_FILE: &str = "connections.db";

/// Produces the raw connections of a static GTFS feed extracted in `data_dir`.
///
/// Implementations block on file I/O and are driven from `spawn_blocking`.
pub trait ConnectionGenerator: Send + Sync {
    fn generate(&self, data_dir: &Path) -> Result<ConnectionIter>;
}

/// Streams `stop_times.txt` one trip at a time and expands each trip over its
/// service dates. A fingerprint per (trip, stop sequence, service date) is
/// kept in the `connections.db` ledger so that re-ingesting a feed only
/// yields connections that are new or changed. The fingerprint of a yielded
/// connection is written once its change event has been delivered.
#[derive(Debug, Clone, Default)]
pub struct GtfsConnectionGenerator;

impl ConnectionGenerator for GtfsConnectionGenerator {
    fn generate(&self, data_dir: &Path) -> Result<ConnectionIter> {
        let tables = StaticTables::load(data_dir)?;
        let calendar = ServiceCalendar::load(data_dir)?;
        let rows = reader(data_dir, "stop_times.txt")?.into_deserialize();
        let ledger = Arc::new(HistoryStore::open(data_dir.join(LEDGER_FILE))?);
        info!(
            trips = tables.trips.len(),
            stops = tables.stops.len(),
            "Static feed loaded"
        );
        Ok(Box::new(StaticConnections {
            tables,
            calendar,
            rows,
            lookahead: None,
            seen_trips: HashSet::new(),
            ledger,
            pending: VecDeque::new(),
            unchanged: 0,
            done: false,
        }))
    }
}

struct StaticConnections {
    tables: StaticTables,
    calendar: ServiceCalendar,
    rows: csv::DeserializeRecordsIntoIter<File, StopTimeRow>,
    lookahead: Option<StopTimeRow>,
    seen_trips: HashSet<String>,
    ledger: Arc<HistoryStore>,
    pending: VecDeque<Result<PendingConnection>>,
    unchanged: usize,
    done: bool,
}

impl Iterator for StaticConnections {
    type Item = Result<PendingConnection>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            if self.done {
                return None;
            }
            match self.next_trip() {
                Some((trip_id, rows)) => self.expand(&trip_id, rows),
                None => {
                    self.done = true;
                    info!(unchanged = self.unchanged, "Static connections exhausted");
                }
            }
        }
    }
}

impl StaticConnections {
    fn read_row(&mut self) -> Option<StopTimeRow> {
        loop {
            match self.rows.next()? {
                Ok(row) => return Some(row),
                Err(e) => self
                    .pending
                    .push_back(Err(PipelineError::Transform(format!("stop_times.txt: {e}")))),
            }
        }
    }

    /// Next run of rows sharing one `trip_id`.
    fn next_trip(&mut self) -> Option<(String, Vec<StopTimeRow>)> {
        let first = match self.lookahead.take() {
            Some(row) => row,
            None => self.read_row()?,
        };
        let trip_id = first.trip_id.clone();
        let mut rows = vec![first];
        while let Some(row) = self.read_row() {
            if row.trip_id == trip_id {
                rows.push(row);
            } else {
                self.lookahead = Some(row);
                break;
            }
        }
        Some((trip_id, rows))
    }

    fn expand(&mut self, trip_id: &str, rows: Vec<StopTimeRow>) {
        if !self.seen_trips.insert(trip_id.to_string()) {
            warn!(trip_id, "stop_times.txt is not grouped by trip, trip seen twice");
        }
        let mut stops = Vec::with_capacity(rows.len());
        for row in &rows {
            match ScheduledStop::from_row(row) {
                Ok(Some(stop)) => stops.push(stop),
                Ok(None) => {}
                Err(e) => self.pending.push_back(Err(PipelineError::Transform(e.to_string()))),
            }
        }
        stops.sort_by_key(|s| s.stop_sequence);
        if stops.len() < 2 {
            return;
        }

        let Some(trip) = self.tables.trips.get(trip_id) else {
            self.pending.push_back(Err(PipelineError::Transform(format!(
                "stop_times.txt references unknown trip {trip_id}"
            ))));
            return;
        };

        for date in self.calendar.dates(&trip.service_id) {
            let day = match TripDay::new(&self.tables, trip, date, &stops[0]) {
                Ok(day) => day,
                Err(e) => {
                    self.pending.push_back(Err(e));
                    continue;
                }
            };
            for pair in stops.windows(2) {
                let (from, to) = (&pair[0], &pair[1]);
                let key = format!("{trip_id}/{}/{}", from.stop_sequence, day.service_date());
                let print = fingerprint(&day, from, to);
                match self.ledger.get::<String>(&key) {
                    Ok(Some(prev)) if prev == print => {
                        self.unchanged += 1;
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.pending.push_back(Err(e));
                        continue;
                    }
                }
                let item = day.connection(from, to, None, false).map(|connection| PendingConnection {
                    connection,
                    on_delivered: Some(PendingWrite::fingerprint(self.ledger.clone(), key, print)),
                });
                self.pending.push_back(item);
            }
        }
    }
}

fn fingerprint(day: &TripDay<'_>, from: &ScheduledStop, to: &ScheduledStop) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}|{:?}|{:?}|{}",
        day.start.timestamp(),
        from.stop_id,
        to.stop_id,
        from.departure,
        to.arrival,
        day.trip.route_id,
        from.pickup_type,
        to.drop_off_type,
        day.trip.trip_headsign.as_deref().unwrap_or_default(),
    )
}
