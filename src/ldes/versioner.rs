//! Turns raw connections into versioned change events.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;

use super::context::LinkedDataContext;
use super::nquads::{format_timestamp, write_event};
use crate::error::Result;
use crate::model::{
    ConnectionKind, PickupDropOff, RawConnection, StopEntity, StopRef, VersionedChangeEvent,
};
use crate::templates::{IriTemplates, ResolveContext};

/// Run-scoped versioner. One instance per full-refresh or incremental pass:
/// the set of already described stops lives exactly as long as the run.
pub struct ConnectionVersioner {
    templates: Arc<IriTemplates>,
    context: Arc<LinkedDataContext>,
    run_timestamp: DateTime<Utc>,
    run_suffix: String,
    emitted_stops: HashSet<String>,
}

impl ConnectionVersioner {
    pub fn new(
        templates: Arc<IriTemplates>,
        context: Arc<LinkedDataContext>,
        run_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            templates,
            context,
            run_suffix: format_timestamp(&run_timestamp),
            run_timestamp,
            emitted_stops: HashSet::new(),
        }
    }

    pub fn run_timestamp(&self) -> DateTime<Utc> {
        self.run_timestamp
    }

    /// Number of distinct stops described so far in this run.
    pub fn described_stops(&self) -> usize {
        self.emitted_stops.len()
    }

    pub fn version(&mut self, conn: &RawConnection) -> Result<VersionedChangeEvent> {
        let start_time = conn.trip.start_time.normalize()?;
        let departure_time = conn.departure_time.normalize()?;
        let arrival_time = conn.arrival_time.normalize()?;

        let departure_ctx = ResolveContext {
            connection: conn,
            stop: &conn.departure_stop,
            start_time,
            departure_time,
            arrival_time,
        };
        let arrival_ctx = ResolveContext {
            stop: &conn.arrival_stop,
            ..departure_ctx
        };
        let t = &self.templates;

        let departure_stop = t.stop.fill(&departure_ctx, &t.resolvers)?;
        let arrival_stop = t.stop.fill(&arrival_ctx, &t.resolvers)?;
        let trip = t.trip.fill(&departure_ctx, &t.resolvers)?;
        let route = t.route.fill(&departure_ctx, &t.resolvers)?;
        let subject = t.connection.fill(&departure_ctx, &t.resolvers)?;

        // Only mark stops as described once the whole record has resolved,
        // so a failing record never swallows a stop description.
        let mut stops = Vec::new();
        for (iri, stop) in [
            (&departure_stop, &conn.departure_stop),
            (&arrival_stop, &conn.arrival_stop),
        ] {
            if self.emitted_stops.insert(iri.clone()) {
                stops.push(describe_stop(iri, stop));
            }
        }

        Ok(VersionedChangeEvent {
            version: format!("{subject}#{}", self.run_suffix),
            subject,
            generated_at: self.run_timestamp,
            kind: if conn.cancelled {
                ConnectionKind::CancelledConnection
            } else {
                ConnectionKind::Connection
            },
            departure_stop,
            arrival_stop,
            departure_time,
            arrival_time,
            departure_delay: conn.departure_delay,
            arrival_delay: conn.arrival_delay,
            trip,
            route,
            headsign: conn.trip.headsign.clone(),
            pickup_type: PickupDropOff::from_code(conn.pickup_type),
            drop_off_type: PickupDropOff::from_code(conn.drop_off_type),
            stops,
        })
    }

    pub fn serialize(&self, event: &VersionedChangeEvent) -> Result<Bytes> {
        Ok(Bytes::from(write_event(event, &self.context)?))
    }

    /// Versions and serializes one record.
    pub fn process(&mut self, conn: &RawConnection) -> Result<Bytes> {
        let event = self.version(conn)?;
        match self.serialize(&event) {
            Ok(payload) => Ok(payload),
            Err(e) => {
                // the stops never reached the sink, let a later record describe them
                for stop in &event.stops {
                    self.emitted_stops.remove(&stop.id);
                }
                Err(e)
            }
        }
    }
}

fn describe_stop(iri: &str, stop: &StopRef) -> StopEntity {
    StopEntity {
        id: iri.to_string(),
        label: stop.stop_name.clone(),
        lat: stop.lat,
        lon: stop.lon,
    }
}
