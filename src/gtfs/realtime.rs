//! Matching GTFS-Realtime trip updates against the static index.
//!
//! Delays are propagated forward: a stop without its own update inherits the
//! departure delay of the last updated stop before it. Only connections whose
//! delays for the service date differ from the last recorded observation are
//! produced. Each carries the history update to apply once it is delivered.

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use super::{ConnectionIter, PendingConnection};
use super::index::IndexSet;
use super::tables::{ScheduledStop, TripDay, parse_gtfs_date};
use crate::error::Result;
use crate::gtfs_rt::trip_descriptor::ScheduleRelationship as TripRelationship;
use crate::gtfs_rt::trip_update::stop_time_update::ScheduleRelationship as StopRelationship;
use crate::gtfs_rt::trip_update::{StopTimeEvent, StopTimeUpdate};
use crate::gtfs_rt::{TripDescriptor, TripUpdate};
use crate::history::{HistoryStore, PendingWrite};
use crate::model::{DelayObservation, HistoryRecord};
use crate::parser::parse_feed;

/// Turns a fetched realtime feed into the connections whose delays changed.
pub trait RealtimeSource: Send + Sync {
    fn connections(&self, feed: Bytes, index: Arc<IndexSet>) -> Result<ConnectionIter>;
}

#[derive(Debug, Clone, Default)]
pub struct GtfsRealtimeParser;

impl RealtimeSource for GtfsRealtimeParser {
    fn connections(&self, feed: Bytes, index: Arc<IndexSet>) -> Result<ConnectionIter> {
        let message = parse_feed(&feed)?;
        let feed_time = message
            .header
            .timestamp
            .and_then(|t| DateTime::from_timestamp(t as i64, 0))
            .unwrap_or_else(Utc::now);
        info!(
            entities = message.entity.len(),
            feed_time = %feed_time,
            "Realtime feed decoded"
        );

        Ok(Box::new(
            message
                .entity
                .into_iter()
                .filter(|e| !e.is_deleted())
                .filter_map(|e| e.trip_update)
                .flat_map(move |update| trip_connections(&index, &update, feed_time)),
        ))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct StopDelay {
    arrival: i32,
    departure: i32,
    skipped: bool,
}

fn trip_connections(
    index: &IndexSet,
    update: &TripUpdate,
    feed_time: DateTime<Utc>,
) -> Vec<Result<PendingConnection>> {
    let trip_id = update.trip.trip_id();
    let tables = &index.tables;
    let Some(trip) = tables.tables.trips.get(trip_id) else {
        debug!(trip_id, "Trip update for unknown trip");
        return Vec::new();
    };
    let Some(stops) = tables.stop_times.get(trip_id).filter(|s| s.len() >= 2) else {
        return Vec::new();
    };

    let date = match service_date(&update.trip, feed_time, &tables.tables.timezone) {
        Ok(d) => d,
        Err(e) => return vec![Err(e)],
    };
    let day = match TripDay::new(&tables.tables, trip, date, &stops[0]) {
        Ok(day) => day,
        Err(e) => return vec![Err(e)],
    };

    let trip_cancelled = matches!(
        update.trip.schedule_relationship(),
        TripRelationship::Canceled | TripRelationship::Deleted
    );
    let delays = if trip_cancelled {
        let none = StopDelay {
            arrival: 0,
            departure: 0,
            skipped: true,
        };
        vec![Some(none); stops.len()]
    } else {
        propagate(&day, stops, update)
    };

    let mut out = Vec::new();
    for (i, pair) in stops.windows(2).enumerate() {
        let (from, to) = (delays[i], delays[i + 1]);
        // A skipped end cancels the segment even when the other end has no delay yet.
        let skipped = from.is_some_and(|d| d.skipped) || to.is_some_and(|d| d.skipped);
        if !skipped && (from.is_none() || to.is_none()) {
            continue;
        }
        let (from, to) = (from.unwrap_or_default(), to.unwrap_or_default());
        let observation = DelayObservation {
            departure_delay: from.departure,
            arrival_delay: to.arrival,
            cancelled: from.skipped || to.skipped,
        };
        let connection = match day.connection(
            &pair[0],
            &pair[1],
            Some((observation.departure_delay, observation.arrival_delay)),
            observation.cancelled,
        ) {
            Ok(c) => c,
            Err(e) => {
                out.push(Err(e));
                continue;
            }
        };
        let key = history_key(&day, &pair[0], &pair[1]);
        let date = day.service_date();
        match is_recorded(&index.history, &key, &date, &observation) {
            Ok(true) => {}
            Ok(false) => out.push(Ok(PendingConnection {
                connection,
                on_delivered: Some(PendingWrite::observation(
                    index.history.clone(),
                    key,
                    date,
                    observation,
                )),
            })),
            Err(e) => out.push(Err(e)),
        }
    }
    out
}

/// Per-stop delays; `None` before the first stop with delay information.
fn propagate(day: &TripDay<'_>, stops: &[ScheduledStop], update: &TripUpdate) -> Vec<Option<StopDelay>> {
    let mut current = update.delay;
    let mut out = Vec::with_capacity(stops.len());
    for stop in stops {
        let stop_update = update.stop_time_update.iter().find(|u| match u.stop_sequence {
            Some(seq) => seq == stop.stop_sequence,
            None => u.stop_id() == stop.stop_id,
        });
        let delay = match stop_update {
            Some(u) if u.schedule_relationship() == StopRelationship::NoData => {
                current = None;
                None
            }
            Some(u) => Some(stop_delay(day, stop, u, current)),
            None => current.map(|d| StopDelay {
                arrival: d,
                departure: d,
                skipped: false,
            }),
        };
        if let Some(d) = delay {
            current = Some(d.departure);
        }
        out.push(delay);
    }
    out
}

fn stop_delay(
    day: &TripDay<'_>,
    stop: &ScheduledStop,
    update: &StopTimeUpdate,
    current: Option<i32>,
) -> StopDelay {
    let arrival = event_delay(day, update.arrival.as_ref(), stop.arrival)
        .or_else(|| event_delay(day, update.departure.as_ref(), stop.departure))
        .or(current)
        .unwrap_or(0);
    let departure = event_delay(day, update.departure.as_ref(), stop.departure).unwrap_or(arrival);
    StopDelay {
        arrival,
        departure,
        skipped: update.schedule_relationship() == StopRelationship::Skipped,
    }
}

/// Delay in seconds, given directly or derived from an absolute event time.
fn event_delay(day: &TripDay<'_>, event: Option<&StopTimeEvent>, scheduled: u32) -> Option<i32> {
    let event = event?;
    if let Some(delay) = event.delay {
        return Some(delay);
    }
    let time = event.time?;
    let scheduled = day.scheduled(scheduled).ok()?;
    i32::try_from(time - scheduled.timestamp()).ok()
}

fn service_date(
    trip: &TripDescriptor,
    feed_time: DateTime<Utc>,
    tz: &chrono_tz::Tz,
) -> Result<NaiveDate> {
    match trip.start_date.as_deref() {
        Some(d) if !d.is_empty() => parse_gtfs_date(d),
        _ => Ok(feed_time.with_timezone(tz).date_naive()),
    }
}

/// `route/direction/trip start/departure stop/arrival stop/stop sequence`.
fn history_key(day: &TripDay<'_>, from: &ScheduledStop, to: &ScheduledStop) -> String {
    let start = day.trip_start_secs();
    format!(
        "{}/{}/{:02}:{:02}:{:02}/{}/{}/{}",
        day.trip.route_id,
        day.trip.direction_id.as_deref().unwrap_or_default(),
        start / 3600,
        start % 3600 / 60,
        start % 60,
        from.stop_id,
        to.stop_id,
        from.stop_sequence,
    )
}

/// Whether `observation` is already the recorded one for `date` under `key`.
fn is_recorded(
    history: &HistoryStore,
    key: &str,
    date: &str,
    observation: &DelayObservation,
) -> Result<bool> {
    let record: Option<HistoryRecord> = history.get(key)?;
    Ok(record.is_some_and(|r| r.get(date) == Some(observation)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtfs::index::{GtfsIndexBuilder, IndexBuild, IndexBuilder};
    use crate::gtfs::testdata::write_feed;
    use crate::gtfs_rt::{FeedEntity, FeedHeader, FeedMessage};
    use crate::model::RawConnection;
    use prost::Message;

    fn index(dir: &std::path::Path) -> Arc<IndexSet> {
        write_feed(dir, 3, 4, 0);
        let IndexBuild::Ready(tables) = GtfsIndexBuilder.build(dir).unwrap() else {
            panic!("expected ready index");
        };
        Arc::new(IndexSet::open(tables, dir).unwrap())
    }

    fn event(delay: i32) -> Option<StopTimeEvent> {
        Some(StopTimeEvent {
            delay: Some(delay),
            time: None,
            uncertainty: None,
        })
    }

    fn stop_update(seq: u32, arrival: Option<StopTimeEvent>) -> StopTimeUpdate {
        StopTimeUpdate {
            stop_sequence: Some(seq),
            stop_id: None,
            arrival,
            departure: None,
            schedule_relationship: None,
        }
    }

    fn feed(trip_id: &str, relationship: Option<TripRelationship>, updates: Vec<StopTimeUpdate>) -> Bytes {
        FeedMessage {
            header: FeedHeader {
                gtfs_realtime_version: "2.0".into(),
                incrementality: None,
                timestamp: Some(1657195200),
                feed_version: None,
            },
            entity: vec![FeedEntity {
                id: "e1".into(),
                is_deleted: None,
                trip_update: Some(TripUpdate {
                    trip: TripDescriptor {
                        trip_id: Some(trip_id.into()),
                        route_id: None,
                        direction_id: None,
                        start_time: None,
                        start_date: Some("20220707".into()),
                        schedule_relationship: relationship.map(|r| r as i32),
                    },
                    vehicle: None,
                    stop_time_update: updates,
                    timestamp: None,
                    delay: None,
                }),
            }],
        }
        .encode_to_vec()
        .into()
    }

    /// Parses the feed and commits every history update, as a fully
    /// successful delivery would.
    fn collect(index: &Arc<IndexSet>, bytes: Bytes) -> Vec<RawConnection> {
        GtfsRealtimeParser
            .connections(bytes, index.clone())
            .unwrap()
            .map(|item| {
                let PendingConnection { connection, on_delivered } = item.unwrap();
                on_delivered.unwrap().commit().unwrap();
                connection
            })
            .collect()
    }

    #[test]
    fn test_delay_propagates_from_first_updated_stop() {
        let dir = tempfile::tempdir().unwrap();
        let index = index(dir.path());

        let out = collect(&index, feed("t0", None, vec![stop_update(3, event(713))]));
        assert_eq!(out.len(), 1);
        let c = &out[0];
        assert_eq!(c.departure_stop.stop_id, "s3");
        assert_eq!(c.arrival_stop.stop_id, "s4");
        assert_eq!(c.departure_delay, Some(713));
        assert_eq!(c.arrival_delay, Some(713));
        assert_eq!(
            c.departure_time.normalize().unwrap().to_rfc3339(),
            "2022-07-07T08:21:53+02:00"
        );
    }

    #[test]
    fn test_repeated_observation_is_suppressed_and_change_updates_history() {
        let dir = tempfile::tempdir().unwrap();
        let index = index(dir.path());

        assert_eq!(collect(&index, feed("t0", None, vec![stop_update(3, event(713))])).len(), 1);
        assert!(collect(&index, feed("t0", None, vec![stop_update(3, event(713))])).is_empty());

        let out = collect(&index, feed("t0", None, vec![stop_update(3, event(744))]));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].arrival_delay, Some(744));

        assert_eq!(index.history.len().unwrap(), 1);
        let record: HistoryRecord = index
            .history
            .get("r1/0/08:00:00/s3/s4/3")
            .unwrap()
            .unwrap();
        assert_eq!(record["20220707"].departure_delay, 744);
    }

    #[test]
    fn test_cancelled_trip_yields_cancelled_connections() {
        let dir = tempfile::tempdir().unwrap();
        let index = index(dir.path());
        let out = collect(&index, feed("t1", Some(TripRelationship::Canceled), vec![]));
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|c| c.cancelled));
    }

    #[test]
    fn test_skipped_stop_cancels_adjacent_segments() {
        let dir = tempfile::tempdir().unwrap();
        let index = index(dir.path());
        let mut skipped = stop_update(2, event(60));
        skipped.schedule_relationship = Some(StopRelationship::Skipped as i32);
        let out = collect(&index, feed("t2", None, vec![skipped]));
        let segments: Vec<_> = out
            .iter()
            .map(|c| (c.departure_stop.stop_id.as_str(), c.arrival_stop.stop_id.as_str(), c.cancelled))
            .collect();
        assert_eq!(
            segments,
            [("s1", "s2", true), ("s2", "s3", true), ("s3", "s4", false)]
        );
    }

    #[test]
    fn test_skipped_first_stop_cancels_only_outgoing_segment() {
        let dir = tempfile::tempdir().unwrap();
        let index = index(dir.path());
        let mut skipped = stop_update(1, None);
        skipped.schedule_relationship = Some(StopRelationship::Skipped as i32);
        let out = collect(&index, feed("t1", None, vec![skipped]));
        assert_eq!(out.len(), 3);
        assert!(out[0].cancelled);
        assert!(out[1..].iter().all(|c| !c.cancelled));
    }

    #[test]
    fn test_undelivered_observation_is_produced_again() {
        let dir = tempfile::tempdir().unwrap();
        let index = index(dir.path());
        let bytes = feed("t0", None, vec![stop_update(3, event(713))]);

        let dropped: Vec<_> = GtfsRealtimeParser
            .connections(bytes.clone(), index.clone())
            .unwrap()
            .collect();
        assert_eq!(dropped.len(), 1);
        drop(dropped);
        assert_eq!(index.history.len().unwrap(), 0);

        assert_eq!(collect(&index, bytes.clone()).len(), 1);
        assert!(collect(&index, bytes).is_empty());
    }

    #[test]
    fn test_absolute_event_time_becomes_delay() {
        let dir = tempfile::tempdir().unwrap();
        let index = index(dir.path());
        // t0 reaches s2 at 08:05 local, i.e. 06:05 UTC.
        let scheduled = DateTime::parse_from_rfc3339("2022-07-07T06:05:00Z").unwrap().timestamp();
        let arrival = Some(StopTimeEvent {
            delay: None,
            time: Some(scheduled + 120),
            uncertainty: None,
        });
        let out = collect(&index, feed("t0", None, vec![stop_update(2, arrival)]));
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|c| c.departure_delay == Some(120)));
    }

    #[test]
    fn test_unknown_trip_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let index = index(dir.path());
        assert!(collect(&index, feed("ghost", None, vec![stop_update(1, event(30))])).is_empty());
    }
}
