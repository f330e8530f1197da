//! Serializes versioned change events to N-Quads (default graph).

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use oxrdf::vocab::{rdf, xsd};
use oxrdf::{Literal, NamedNode, Term, Triple};
use std::fmt::Write as _;

use super::context::{Coercion, LinkedDataContext};
use crate::error::{PipelineError, Result};
use crate::model::{StopEntity, VersionedChangeEvent};

enum PropertyValue {
    Iri(String),
    Text(String),
    Integer(i64),
    Double(f64),
    DateTime(String),
}

/// Renders a timestamp the way it appears in version identities and literals.
pub fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn format_local(t: &DateTime<FixedOffset>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

struct TripleWriter<'a> {
    ctx: &'a LinkedDataContext,
    out: String,
}

impl<'a> TripleWriter<'a> {
    fn new(ctx: &'a LinkedDataContext) -> Self {
        Self {
            ctx,
            out: String::new(),
        }
    }

    fn push(&mut self, triple: Triple) {
        // writing into a String cannot fail
        let _ = writeln!(self.out, "{triple} .");
    }

    fn typed(&mut self, subject: &NamedNode, class_term: &str) {
        match self.ctx.class(class_term) {
            Some(class) => self.push(Triple::new(subject.clone(), rdf::TYPE, class)),
            None => tracing::debug!(class_term, "Dropping @type not mapped by @context"),
        }
    }

    fn property(&mut self, subject: &NamedNode, term: &str, value: PropertyValue) -> Result<()> {
        let Some((predicate, coercion)) = self.ctx.property(term) else {
            return Ok(());
        };
        let object: Term = match (coercion, value) {
            (Coercion::Id, PropertyValue::Iri(v) | PropertyValue::Text(v))
            | (Coercion::None, PropertyValue::Iri(v)) => {
                let iri = self.ctx.expand_iri(&v).unwrap_or(v);
                named(&iri)?.into()
            }
            (Coercion::Datatype(dt), v) => Literal::new_typed_literal(lexical(v), dt).into(),
            (_, PropertyValue::Text(v)) => Literal::new_simple_literal(v).into(),
            (_, PropertyValue::Integer(v)) => {
                Literal::new_typed_literal(v.to_string(), xsd::INTEGER).into()
            }
            (_, PropertyValue::Double(v)) => {
                Literal::new_typed_literal(v.to_string(), xsd::DOUBLE).into()
            }
            (_, PropertyValue::DateTime(v)) => Literal::new_typed_literal(v, xsd::DATE_TIME).into(),
        };
        self.push(Triple::new(subject.clone(), predicate, object));
        Ok(())
    }
}

fn lexical(v: PropertyValue) -> String {
    match v {
        PropertyValue::Iri(s) | PropertyValue::Text(s) | PropertyValue::DateTime(s) => s,
        PropertyValue::Integer(i) => i.to_string(),
        PropertyValue::Double(d) => d.to_string(),
    }
}

fn named(iri: &str) -> Result<NamedNode> {
    NamedNode::new(iri).map_err(|e| PipelineError::Transform(format!("invalid IRI {iri:?}: {e}")))
}

/// N-Quads lines for the event and any embedded stop descriptions.
pub fn write_event(event: &VersionedChangeEvent, ctx: &LinkedDataContext) -> Result<String> {
    let mut w = TripleWriter::new(ctx);
    let subject = named(&event.version)?;

    w.typed(&subject, event.kind.term());
    w.property(&subject, "isVersionOf", PropertyValue::Iri(event.subject.clone()))?;
    w.property(
        &subject,
        "generatedAtTime",
        PropertyValue::DateTime(format_timestamp(&event.generated_at)),
    )?;
    w.property(&subject, "departureStop", PropertyValue::Iri(event.departure_stop.clone()))?;
    w.property(&subject, "arrivalStop", PropertyValue::Iri(event.arrival_stop.clone()))?;
    w.property(
        &subject,
        "departureTime",
        PropertyValue::DateTime(format_local(&event.departure_time)),
    )?;
    w.property(
        &subject,
        "arrivalTime",
        PropertyValue::DateTime(format_local(&event.arrival_time)),
    )?;
    if let Some(d) = event.departure_delay {
        w.property(&subject, "departureDelay", PropertyValue::Integer(d.into()))?;
    }
    if let Some(d) = event.arrival_delay {
        w.property(&subject, "arrivalDelay", PropertyValue::Integer(d.into()))?;
    }
    w.property(&subject, "gtfs:trip", PropertyValue::Iri(event.trip.clone()))?;
    w.property(&subject, "gtfs:route", PropertyValue::Iri(event.route.clone()))?;
    if let Some(h) = &event.headsign {
        w.property(&subject, "direction", PropertyValue::Text(h.clone()))?;
    }
    w.property(
        &subject,
        "gtfs:pickupType",
        PropertyValue::Iri(event.pickup_type.as_compact_iri().to_string()),
    )?;
    w.property(
        &subject,
        "gtfs:dropOffType",
        PropertyValue::Iri(event.drop_off_type.as_compact_iri().to_string()),
    )?;

    for stop in &event.stops {
        write_stop(&mut w, stop)?;
    }

    Ok(w.out)
}

fn write_stop(w: &mut TripleWriter<'_>, stop: &StopEntity) -> Result<()> {
    let subject = named(&stop.id)?;
    w.typed(&subject, "gtfs:Stop");
    if let Some(label) = &stop.label {
        w.property(&subject, "rdfs:label", PropertyValue::Text(label.clone()))?;
    }
    if let Some(lat) = stop.lat {
        w.property(&subject, "geo:lat", PropertyValue::Double(lat))?;
    }
    if let Some(lon) = stop.lon {
        w.property(&subject, "geo:long", PropertyValue::Double(lon))?;
    }
    if let Some(wkt) = stop.wkt() {
        w.property(&subject, "asWKT", PropertyValue::Text(wkt))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConnectionKind, PickupDropOff};

    fn event() -> VersionedChangeEvent {
        let generated_at = DateTime::parse_from_rfc3339("2022-07-07T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        VersionedChangeEvent {
            subject: "https://ex.org/connections/a".into(),
            version: "https://ex.org/connections/a#2022-07-07T10:00:00.000Z".into(),
            generated_at,
            kind: ConnectionKind::Connection,
            departure_stop: "https://ex.org/stops/1".into(),
            arrival_stop: "https://ex.org/stops/2".into(),
            departure_time: DateTime::parse_from_rfc3339("2022-07-07T15:01:00+02:00").unwrap(),
            arrival_time: DateTime::parse_from_rfc3339("2022-07-07T15:03:00+02:00").unwrap(),
            departure_delay: Some(713),
            arrival_delay: None,
            trip: "https://ex.org/trips/t".into(),
            route: "https://ex.org/routes/r".into(),
            headsign: Some("Leuven \"Station\"".into()),
            pickup_type: PickupDropOff::Regular,
            drop_off_type: PickupDropOff::MustPhone,
            stops: vec![StopEntity {
                id: "https://ex.org/stops/1".into(),
                label: Some("Herentals".into()),
                lat: Some(51.18),
                lon: Some(4.83),
            }],
        }
    }

    #[test]
    fn test_event_lines() {
        let ctx = LinkedDataContext::with_overrides(None).unwrap();
        let out = write_event(&event(), &ctx).unwrap();
        let v = "<https://ex.org/connections/a#2022-07-07T10:00:00.000Z>";

        assert!(out.contains(&format!(
            "{v} <http://www.w3.org/1999/02/22-rdf-syntax-ns#type> <http://semweb.mmlab.be/ns/linkedconnections#Connection> ."
        )));
        assert!(out.contains(&format!(
            "{v} <http://purl.org/dc/terms/isVersionOf> <https://ex.org/connections/a> ."
        )));
        assert!(out.contains(
            "\"2022-07-07T15:01:00.000+02:00\"^^<http://www.w3.org/2001/XMLSchema#dateTime>"
        ));
        assert!(out.contains("\"713\"^^<http://www.w3.org/2001/XMLSchema#integer>"));
        assert!(!out.contains("arrivalDelay"));
        assert!(out.contains("<http://vocab.gtfs.org/terms#MustPhone>"));
        assert!(out.contains("\"Leuven \\\"Station\\\"\""));
        assert!(out.lines().all(|l| l.ends_with(" .")));
    }

    #[test]
    fn test_embedded_stop_lines() {
        let ctx = LinkedDataContext::with_overrides(None).unwrap();
        let out = write_event(&event(), &ctx).unwrap();
        assert!(out.contains(
            "<https://ex.org/stops/1> <http://www.w3.org/1999/02/22-rdf-syntax-ns#type> <http://vocab.gtfs.org/terms#Stop> ."
        ));
        assert!(out.contains("\"POINT (4.83 51.18)\"^^<http://www.opengis.net/ont/geosparql#wktLiteral>"));
        assert!(out.contains("<http://www.w3.org/2000/01/rdf-schema#label> \"Herentals\" ."));
    }

    #[test]
    fn test_invalid_iri_is_transform_error() {
        let ctx = LinkedDataContext::with_overrides(None).unwrap();
        let mut e = event();
        e.version = "not an iri".into();
        assert!(matches!(write_event(&e, &ctx), Err(PipelineError::Transform(_))));
    }
}
