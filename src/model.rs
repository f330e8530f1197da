//! Records flowing through the pipeline: raw connections from the GTFS
//! collaborators and the versioned change events delivered to the sink.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{PipelineError, Result};

/// A date/time value as produced by a collaborator: either already typed or
/// still in its textual (RFC 3339) form.
#[derive(Debug, Clone, PartialEq)]
pub enum TemporalValue {
    Text(String),
    At(DateTime<FixedOffset>),
}

impl TemporalValue {
    pub fn normalize(&self) -> Result<DateTime<FixedOffset>> {
        match self {
            TemporalValue::At(t) => Ok(*t),
            TemporalValue::Text(s) => DateTime::parse_from_rfc3339(s.trim())
                .map_err(|e| PipelineError::Transform(format!("invalid timestamp {s:?}: {e}"))),
        }
    }
}

impl From<DateTime<FixedOffset>> for TemporalValue {
    fn from(t: DateTime<FixedOffset>) -> Self {
        TemporalValue::At(t)
    }
}

impl From<DateTime<Utc>> for TemporalValue {
    fn from(t: DateTime<Utc>) -> Self {
        TemporalValue::At(t.fixed_offset())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopRef {
    pub stop_id: String,
    pub stop_code: Option<String>,
    pub stop_name: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub platform_code: Option<String>,
    pub parent_station: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TripRef {
    pub trip_id: String,
    pub route_id: String,
    pub service_id: String,
    pub headsign: Option<String>,
    pub short_name: Option<String>,
    pub direction_id: Option<String>,
    pub block_id: Option<String>,
    /// Departure time at the first stop of the trip on this service date.
    pub start_time: TemporalValue,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteRef {
    pub route_id: String,
    pub agency_id: Option<String>,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    pub route_type: Option<String>,
}

/// One trip segment between two consecutive stops.
#[derive(Debug, Clone, PartialEq)]
pub struct RawConnection {
    pub departure_stop: StopRef,
    pub arrival_stop: StopRef,
    pub departure_time: TemporalValue,
    pub arrival_time: TemporalValue,
    pub departure_delay: Option<i32>,
    pub arrival_delay: Option<i32>,
    pub trip: TripRef,
    pub route: RouteRef,
    pub pickup_type: Option<u8>,
    pub drop_off_type: Option<u8>,
    /// Stop sequence of the departure stop within the trip.
    pub stop_sequence: u32,
    /// Service date as `YYYYMMDD`.
    pub service_date: String,
    pub cancelled: bool,
}

/// Canonical pickup / drop-off policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PickupDropOff {
    Regular,
    NotAvailable,
    MustPhone,
    MustCoordinateWithDriver,
}

impl PickupDropOff {
    pub fn from_code(code: Option<u8>) -> Self {
        match code {
            None | Some(0) => PickupDropOff::Regular,
            Some(1) => PickupDropOff::NotAvailable,
            Some(2) => PickupDropOff::MustPhone,
            Some(3) => PickupDropOff::MustCoordinateWithDriver,
            Some(other) => {
                debug!(code = other, "Unknown pickup/drop-off code, using Regular");
                PickupDropOff::Regular
            }
        }
    }

    /// Compact IRI in the GTFS vocabulary.
    pub fn as_compact_iri(&self) -> &'static str {
        match self {
            PickupDropOff::Regular => "gtfs:Regular",
            PickupDropOff::NotAvailable => "gtfs:NotAvailable",
            PickupDropOff::MustPhone => "gtfs:MustPhone",
            PickupDropOff::MustCoordinateWithDriver => "gtfs:MustCoordinateWithDriver",
        }
    }
}

/// Stop description embedded at most once per stop IRI per run.
#[derive(Debug, Clone, PartialEq)]
pub struct StopEntity {
    pub id: String,
    pub label: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

impl StopEntity {
    /// WKT point literal, longitude first.
    pub fn wkt(&self) -> Option<String> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some(format!("POINT ({lon} {lat})")),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Connection,
    CancelledConnection,
}

impl ConnectionKind {
    pub fn term(&self) -> &'static str {
        match self {
            ConnectionKind::Connection => "Connection",
            ConnectionKind::CancelledConnection => "CancelledConnection",
        }
    }
}

/// The unit delivered to the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedChangeEvent {
    /// Stable across versions of the same connection.
    pub subject: String,
    /// `subject#<run timestamp>`.
    pub version: String,
    pub generated_at: DateTime<Utc>,
    pub kind: ConnectionKind,
    pub departure_stop: String,
    pub arrival_stop: String,
    pub departure_time: DateTime<FixedOffset>,
    pub arrival_time: DateTime<FixedOffset>,
    pub departure_delay: Option<i32>,
    pub arrival_delay: Option<i32>,
    pub trip: String,
    pub route: String,
    pub headsign: Option<String>,
    pub pickup_type: PickupDropOff,
    pub drop_off_type: PickupDropOff,
    pub stops: Vec<StopEntity>,
}

/// Last known delays for one service date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayObservation {
    pub departure_delay: i32,
    pub arrival_delay: i32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

/// HistoryStore value: service date (`YYYYMMDD`) to last observation.
pub type HistoryRecord = BTreeMap<String, DelayObservation>;
