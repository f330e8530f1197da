//! Closed resolver table for IRI template variables.
//!
//! A resolver is a pure function over a typed [`ResolveContext`]. Resolvers
//! declared in configuration are a field reference followed by a fixed list
//! of string transforms; Rust callers can also register closures directly.

use chrono::{DateTime, FixedOffset};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::error::{PipelineError, Result};
use crate::model::{RawConnection, StopRef};

/// Everything a template variable may look at for one connection.
pub struct ResolveContext<'a> {
    pub connection: &'a RawConnection,
    /// Stop in the role being rendered; the departure stop outside stop templates.
    pub stop: &'a StopRef,
    pub start_time: DateTime<FixedOffset>,
    pub departure_time: DateTime<FixedOffset>,
    pub arrival_time: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Trips,
    Routes,
    Stops,
    Connection,
}

impl Source {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trips" => Some(Source::Trips),
            "routes" => Some(Source::Routes),
            "stops" => Some(Source::Stops),
            "connection" => Some(Source::Connection),
            _ => None,
        }
    }
}

/// `<source>.<attribute>[.<attribute>]`, checked against the known fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRef {
    pub source: Source,
    pub path: Vec<String>,
}

const TRIP_FIELDS: &[&str] = &[
    "trip_id",
    "route_id",
    "service_id",
    "trip_headsign",
    "trip_short_name",
    "direction_id",
    "block_id",
    "startTime",
];
const ROUTE_FIELDS: &[&str] = &[
    "route_id",
    "agency_id",
    "route_short_name",
    "route_long_name",
    "route_type",
];
const STOP_FIELDS: &[&str] = &[
    "stop_id",
    "stop_code",
    "stop_name",
    "stop_lat",
    "stop_lon",
    "platform_code",
    "parent_station",
];
const CONNECTION_FIELDS: &[&str] = &[
    "departureTime",
    "arrivalTime",
    "departureDelay",
    "arrivalDelay",
    "stopSequence",
    "serviceDate",
    "pickupType",
    "dropOffType",
];

impl FieldRef {
    pub fn parse(expr: &str) -> Result<Self> {
        let mut parts = expr.trim().split('.');
        let head = parts.next().unwrap_or_default();
        let source = Source::parse(head).ok_or_else(|| {
            PipelineError::Config(format!(
                "unknown source {head:?} in {expr:?}, expected trips, routes, stops or connection"
            ))
        })?;
        let path: Vec<String> = parts.map(str::to_string).collect();

        let known = match (source, path.as_slice()) {
            (Source::Trips, [attr]) => TRIP_FIELDS.contains(&attr.as_str()),
            (Source::Routes, [attr]) => ROUTE_FIELDS.contains(&attr.as_str()),
            (Source::Stops, [attr]) => STOP_FIELDS.contains(&attr.as_str()),
            (Source::Connection, [attr]) => CONNECTION_FIELDS.contains(&attr.as_str()),
            (Source::Connection, [role, attr]) => {
                (role == "departureStop" || role == "arrivalStop")
                    && STOP_FIELDS.contains(&attr.as_str())
            }
            _ => false,
        };
        if !known {
            return Err(PipelineError::Config(format!("unknown field reference {expr:?}")));
        }
        Ok(Self { source, path })
    }

    pub fn lookup(&self, ctx: &ResolveContext<'_>) -> Option<String> {
        let conn = ctx.connection;
        let attr = self.path.last()?.as_str();
        match self.source {
            Source::Trips => {
                let trip = &conn.trip;
                match attr {
                    "trip_id" => Some(trip.trip_id.clone()),
                    "route_id" => Some(trip.route_id.clone()),
                    "service_id" => Some(trip.service_id.clone()),
                    "trip_headsign" => trip.headsign.clone(),
                    "trip_short_name" => trip.short_name.clone(),
                    "direction_id" => trip.direction_id.clone(),
                    "block_id" => trip.block_id.clone(),
                    "startTime" => Some(ctx.start_time.to_rfc3339()),
                    _ => None,
                }
            }
            Source::Routes => {
                let route = &conn.route;
                match attr {
                    "route_id" => Some(route.route_id.clone()),
                    "agency_id" => route.agency_id.clone(),
                    "route_short_name" => route.short_name.clone(),
                    "route_long_name" => route.long_name.clone(),
                    "route_type" => route.route_type.clone(),
                    _ => None,
                }
            }
            Source::Stops => stop_field(ctx.stop, attr),
            Source::Connection => match self.path.as_slice() {
                [role, _] if role == "departureStop" => stop_field(&conn.departure_stop, attr),
                [role, _] if role == "arrivalStop" => stop_field(&conn.arrival_stop, attr),
                _ => match attr {
                    "departureTime" => Some(ctx.departure_time.to_rfc3339()),
                    "arrivalTime" => Some(ctx.arrival_time.to_rfc3339()),
                    "departureDelay" => conn.departure_delay.map(|d| d.to_string()),
                    "arrivalDelay" => conn.arrival_delay.map(|d| d.to_string()),
                    "stopSequence" => Some(conn.stop_sequence.to_string()),
                    "serviceDate" => Some(conn.service_date.clone()),
                    "pickupType" => Some(conn.pickup_type.unwrap_or(0).to_string()),
                    "dropOffType" => Some(conn.drop_off_type.unwrap_or(0).to_string()),
                    _ => None,
                },
            },
        }
    }
}

fn stop_field(stop: &StopRef, attr: &str) -> Option<String> {
    match attr {
        "stop_id" => Some(stop.stop_id.clone()),
        "stop_code" => stop.stop_code.clone(),
        "stop_name" => stop.stop_name.clone(),
        "stop_lat" => stop.lat.map(|v| v.to_string()),
        "stop_lon" => stop.lon.map(|v| v.to_string()),
        "platform_code" => stop.platform_code.clone(),
        "parent_station" => stop.parent_station.clone(),
        _ => None,
    }
}

/// String post-processing applied by configured resolvers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    WhitespaceToUnderscore,
    Lowercase,
    Uppercase,
    Trim,
    Replace { from: String, to: String },
}

impl Transform {
    pub fn apply(&self, value: String) -> String {
        match self {
            Transform::WhitespaceToUnderscore => value
                .chars()
                .map(|c| if c.is_whitespace() { '_' } else { c })
                .collect(),
            Transform::Lowercase => value.to_lowercase(),
            Transform::Uppercase => value.to_uppercase(),
            Transform::Trim => value.trim().to_string(),
            Transform::Replace { from, to } => value.replace(from.as_str(), to),
        }
    }
}

/// Resolver declaration as written in `uri_templates.resolve`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResolverSpec {
    pub field: String,
    #[serde(default)]
    pub transforms: Vec<Transform>,
}

pub type ResolverFn = Arc<dyn Fn(&ResolveContext<'_>) -> Option<String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ResolverTable {
    entries: HashMap<String, ResolverFn>,
}

impl fmt::Debug for ResolverTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("ResolverTable").field("names", &names).finish()
    }
}

impl ResolverTable {
    pub fn from_specs(specs: &BTreeMap<String, ResolverSpec>) -> Result<Self> {
        let mut table = Self::default();
        for (name, spec) in specs {
            let field = FieldRef::parse(&spec.field)?;
            let transforms = spec.transforms.clone();
            table.register(name, move |ctx| {
                let raw = field.lookup(ctx)?;
                Some(transforms.iter().fold(raw, |acc, t| t.apply(acc)))
            });
        }
        Ok(table)
    }

    pub fn register<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&ResolveContext<'_>) -> Option<String> + Send + Sync + 'static,
    {
        self.entries.insert(name.to_string(), Arc::new(f));
    }

    pub fn get(&self, name: &str) -> Option<&ResolverFn> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}
