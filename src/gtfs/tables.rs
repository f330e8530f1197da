//! Reading the static GTFS text files extracted into the data folder.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, TimeZone};
use chrono_tz::Tz;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::model::{RawConnection, RouteRef, StopRef, TemporalValue, TripRef};

#[derive(Debug, Clone, Deserialize)]
pub struct AgencyRow {
    #[serde(default)]
    pub agency_id: Option<String>,
    pub agency_timezone: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StopRow {
    pub stop_id: String,
    #[serde(default)]
    pub stop_code: Option<String>,
    #[serde(default)]
    pub stop_name: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub stop_lat: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub stop_lon: Option<f64>,
    #[serde(default)]
    pub platform_code: Option<String>,
    #[serde(default)]
    pub parent_station: Option<String>,
}

impl From<StopRow> for StopRef {
    fn from(r: StopRow) -> Self {
        StopRef {
            stop_id: r.stop_id,
            stop_code: r.stop_code,
            stop_name: r.stop_name,
            lat: r.stop_lat,
            lon: r.stop_lon,
            platform_code: r.platform_code,
            parent_station: r.parent_station,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteRow {
    pub route_id: String,
    #[serde(default)]
    pub agency_id: Option<String>,
    #[serde(default)]
    pub route_short_name: Option<String>,
    #[serde(default)]
    pub route_long_name: Option<String>,
    #[serde(default)]
    pub route_type: Option<String>,
}

impl From<RouteRow> for RouteRef {
    fn from(r: RouteRow) -> Self {
        RouteRef {
            route_id: r.route_id,
            agency_id: r.agency_id,
            short_name: r.route_short_name,
            long_name: r.route_long_name,
            route_type: r.route_type,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TripRow {
    pub route_id: String,
    pub service_id: String,
    pub trip_id: String,
    #[serde(default)]
    pub trip_headsign: Option<String>,
    #[serde(default)]
    pub trip_short_name: Option<String>,
    #[serde(default)]
    pub direction_id: Option<String>,
    #[serde(default)]
    pub block_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StopTimeRow {
    pub trip_id: String,
    #[serde(default)]
    pub arrival_time: Option<String>,
    #[serde(default)]
    pub departure_time: Option<String>,
    pub stop_id: String,
    pub stop_sequence: u32,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub pickup_type: Option<u8>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub drop_off_type: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
struct CalendarRow {
    service_id: String,
    monday: u8,
    tuesday: u8,
    wednesday: u8,
    thursday: u8,
    friday: u8,
    saturday: u8,
    sunday: u8,
    start_date: String,
    end_date: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CalendarDateRow {
    service_id: String,
    date: String,
    exception_type: u8,
}

/// A stop of a trip with its scheduled times in seconds since service-day start.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledStop {
    pub stop_id: String,
    pub stop_sequence: u32,
    pub arrival: u32,
    pub departure: u32,
    pub pickup_type: Option<u8>,
    pub drop_off_type: Option<u8>,
}

impl ScheduledStop {
    /// Builds the stop from a row; rows without any time (untimed stops) yield `None`.
    pub fn from_row(row: &StopTimeRow) -> Result<Option<Self>> {
        let arrival = row.arrival_time.as_deref().map(parse_gtfs_time).transpose()?;
        let departure = row.departure_time.as_deref().map(parse_gtfs_time).transpose()?;
        let (arrival, departure) = match (arrival, departure) {
            (Some(a), Some(d)) => (a, d),
            (Some(a), None) => (a, a),
            (None, Some(d)) => (d, d),
            (None, None) => return Ok(None),
        };
        Ok(Some(Self {
            stop_id: row.stop_id.clone(),
            stop_sequence: row.stop_sequence,
            arrival,
            departure,
            pickup_type: row.pickup_type,
            drop_off_type: row.drop_off_type,
        }))
    }
}

/// Service dates per `service_id`, from `calendar.txt` and `calendar_dates.txt`.
#[derive(Debug, Clone, Default)]
pub struct ServiceCalendar {
    dates: HashMap<String, BTreeSet<NaiveDate>>,
}

impl ServiceCalendar {
    pub fn load(dir: &Path) -> Result<Self> {
        let mut dates: HashMap<String, BTreeSet<NaiveDate>> = HashMap::new();

        if dir.join("calendar.txt").exists() {
            for row in read_all::<CalendarRow>(dir, "calendar.txt")? {
                let start = parse_gtfs_date(&row.start_date)?;
                let end = parse_gtfs_date(&row.end_date)?;
                let active = [
                    row.monday,
                    row.tuesday,
                    row.wednesday,
                    row.thursday,
                    row.friday,
                    row.saturday,
                    row.sunday,
                ];
                let set = dates.entry(row.service_id).or_default();
                let mut day = start;
                while day <= end {
                    if active[day.weekday().num_days_from_monday() as usize] == 1 {
                        set.insert(day);
                    }
                    day = match day.succ_opt() {
                        Some(d) => d,
                        None => break,
                    };
                }
            }
        }

        if dir.join("calendar_dates.txt").exists() {
            for row in read_all::<CalendarDateRow>(dir, "calendar_dates.txt")? {
                let date = parse_gtfs_date(&row.date)?;
                let set = dates.entry(row.service_id).or_default();
                match row.exception_type {
                    1 => {
                        set.insert(date);
                    }
                    2 => {
                        set.remove(&date);
                    }
                    other => debug!(exception_type = other, "Ignoring unknown calendar exception"),
                }
            }
        }

        Ok(Self { dates })
    }

    pub fn dates(&self, service_id: &str) -> Vec<NaiveDate> {
        self.dates
            .get(service_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Lookup tables shared by the static generator and the realtime index.
#[derive(Debug, Clone)]
pub struct StaticTables {
    pub stops: HashMap<String, StopRef>,
    pub routes: HashMap<String, RouteRef>,
    pub trips: HashMap<String, TripRow>,
    pub timezone: Tz,
}

impl StaticTables {
    pub fn load(dir: &Path) -> Result<Self> {
        let stops = read_all::<StopRow>(dir, "stops.txt")?
            .into_iter()
            .map(|r| (r.stop_id.clone(), StopRef::from(r)))
            .collect();
        let routes = read_all::<RouteRow>(dir, "routes.txt")?
            .into_iter()
            .map(|r| (r.route_id.clone(), RouteRef::from(r)))
            .collect();
        let trips = read_all::<TripRow>(dir, "trips.txt")?
            .into_iter()
            .map(|r| (r.trip_id.clone(), r))
            .collect();
        Ok(Self {
            stops,
            routes,
            trips,
            timezone: load_timezone(dir)?,
        })
    }
}

impl StaticTables {
    pub fn stop(&self, stop_id: &str) -> StopRef {
        self.stops.get(stop_id).cloned().unwrap_or_else(|| StopRef {
            stop_id: stop_id.to_string(),
            ..Default::default()
        })
    }

    pub fn route(&self, route_id: &str) -> RouteRef {
        self.routes.get(route_id).cloned().unwrap_or_else(|| RouteRef {
            route_id: route_id.to_string(),
            ..Default::default()
        })
    }
}

/// One trip on one service date, anchored at its first departure.
pub struct TripDay<'a> {
    pub tables: &'a StaticTables,
    pub trip: &'a TripRow,
    pub route: RouteRef,
    pub date: NaiveDate,
    pub start: DateTime<FixedOffset>,
    start_secs: u32,
}

impl<'a> TripDay<'a> {
    pub fn new(
        tables: &'a StaticTables,
        trip: &'a TripRow,
        date: NaiveDate,
        first: &ScheduledStop,
    ) -> Result<Self> {
        Ok(Self {
            tables,
            trip,
            route: tables.route(&trip.route_id),
            date,
            start: service_time(tables.timezone, date, first.departure)?,
            start_secs: first.departure,
        })
    }

    /// Scheduled first departure, in seconds since service-day start.
    pub fn trip_start_secs(&self) -> u32 {
        self.start_secs
    }

    pub fn service_date(&self) -> String {
        format_gtfs_date(self.date)
    }

    pub fn scheduled(&self, secs: u32) -> Result<DateTime<FixedOffset>> {
        service_time(self.tables.timezone, self.date, secs)
    }

    fn trip_ref(&self) -> TripRef {
        TripRef {
            trip_id: self.trip.trip_id.clone(),
            route_id: self.trip.route_id.clone(),
            service_id: self.trip.service_id.clone(),
            headsign: self.trip.trip_headsign.clone(),
            short_name: self.trip.trip_short_name.clone(),
            direction_id: self.trip.direction_id.clone(),
            block_id: self.trip.block_id.clone(),
            start_time: TemporalValue::At(self.start),
        }
    }

    /// Connection from `from` to `to`; delays are `(departure, arrival)` in seconds.
    pub fn connection(
        &self,
        from: &ScheduledStop,
        to: &ScheduledStop,
        delays: Option<(i32, i32)>,
        cancelled: bool,
    ) -> Result<RawConnection> {
        let (dep_delay, arr_delay) = delays.unwrap_or((0, 0));
        let departure = self.scheduled(from.departure)? + Duration::seconds(i64::from(dep_delay));
        let arrival = self.scheduled(to.arrival)? + Duration::seconds(i64::from(arr_delay));
        Ok(RawConnection {
            departure_stop: self.tables.stop(&from.stop_id),
            arrival_stop: self.tables.stop(&to.stop_id),
            departure_time: TemporalValue::At(departure),
            arrival_time: TemporalValue::At(arrival),
            departure_delay: delays.map(|d| d.0),
            arrival_delay: delays.map(|d| d.1),
            trip: self.trip_ref(),
            route: self.route.clone(),
            pickup_type: from.pickup_type,
            drop_off_type: to.drop_off_type,
            stop_sequence: from.stop_sequence,
            service_date: self.service_date(),
            cancelled,
        })
    }
}

fn load_timezone(dir: &Path) -> Result<Tz> {
    if !dir.join("agency.txt").exists() {
        warn!("agency.txt missing, assuming UTC service times");
        return Ok(Tz::UTC);
    }
    let agencies = read_all::<AgencyRow>(dir, "agency.txt")?;
    let Some(first) = agencies.first() else {
        return Ok(Tz::UTC);
    };
    first
        .agency_timezone
        .parse::<Tz>()
        .map_err(|e| PipelineError::Index(format!("invalid agency_timezone: {e}")))
}

pub fn reader(dir: &Path, file: &str) -> Result<csv::Reader<File>> {
    let path = dir.join(file);
    let f = File::open(&path)
        .map_err(|e| PipelineError::Index(format!("cannot open {}: {e}", path.display())))?;
    Ok(csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(f))
}

pub fn read_all<T: DeserializeOwned>(dir: &Path, file: &str) -> Result<Vec<T>> {
    let mut rows = Vec::new();
    for record in reader(dir, file)?.deserialize() {
        rows.push(record.map_err(|e| PipelineError::Index(format!("{file}: {e}")))?);
    }
    Ok(rows)
}

/// `HH:MM:SS` to seconds; hours may exceed 23 for trips running past midnight.
pub fn parse_gtfs_time(s: &str) -> Result<u32> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    let invalid = || PipelineError::Index(format!("invalid GTFS time {s:?}"));
    if parts.len() != 3 {
        return Err(invalid());
    }
    let mut secs = 0u32;
    for (part, unit) in parts.iter().zip([3600u32, 60, 1]) {
        let v: u32 = part.parse().map_err(|_| invalid())?;
        secs = v
            .checked_mul(unit)
            .and_then(|v| secs.checked_add(v))
            .ok_or_else(invalid)?;
    }
    Ok(secs)
}

pub fn parse_gtfs_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y%m%d")
        .map_err(|e| PipelineError::Index(format!("invalid GTFS date {s:?}: {e}")))
}

pub fn format_gtfs_date(d: NaiveDate) -> String {
    d.format("%Y%m%d").to_string()
}

/// Instant a GTFS time refers to: offsets count from noon minus twelve hours
/// on the service date, which keeps DST-change days correct.
pub fn service_time(tz: Tz, date: NaiveDate, secs: u32) -> Result<DateTime<FixedOffset>> {
    let noon = date
        .and_hms_opt(12, 0, 0)
        .ok_or_else(|| PipelineError::Index(format!("invalid service date {date}")))?;
    let noon = tz
        .from_local_datetime(&noon)
        .earliest()
        .ok_or_else(|| PipelineError::Index(format!("no local noon on {date} in {tz}")))?;
    let t = noon - Duration::hours(12) + Duration::seconds(i64::from(secs));
    Ok(t.fixed_offset())
}
