//! The subset of a JSON-LD `@context` the event serializer needs: term and
//! prefix expansion plus `@type` coercion. Terms the context does not map
//! are dropped, as a JSON-LD processor would.

use oxrdf::NamedNode;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

use crate::error::{PipelineError, Result};

/// Context used when the configuration does not override a term.
pub fn default_context() -> Value {
    serde_json::json!({
        "xsd": "http://www.w3.org/2001/XMLSchema#",
        "rdfs": "http://www.w3.org/2000/01/rdf-schema#",
        "dct": "http://purl.org/dc/terms/",
        "prov": "http://www.w3.org/ns/prov#",
        "lc": "http://semweb.mmlab.be/ns/linkedconnections#",
        "gtfs": "http://vocab.gtfs.org/terms#",
        "geo": "http://www.w3.org/2003/01/geo/wgs84_pos#",
        "geosparql": "http://www.opengis.net/ont/geosparql#",
        "gtfs:trip": { "@type": "@id" },
        "gtfs:route": { "@type": "@id" },
        "gtfs:pickupType": { "@type": "@id" },
        "gtfs:dropOffType": { "@type": "@id" },
        "Connection": { "@id": "lc:Connection", "@type": "@id" },
        "CancelledConnection": { "@id": "lc:CancelledConnection", "@type": "@id" },
        "departureTime": { "@id": "lc:departureTime", "@type": "xsd:dateTime" },
        "arrivalTime": { "@id": "lc:arrivalTime", "@type": "xsd:dateTime" },
        "departureDelay": { "@id": "lc:departureDelay", "@type": "xsd:integer" },
        "arrivalDelay": { "@id": "lc:arrivalDelay", "@type": "xsd:integer" },
        "departureStop": { "@id": "lc:departureStop", "@type": "@id" },
        "arrivalStop": { "@id": "lc:arrivalStop", "@type": "@id" },
        "direction": { "@id": "gtfs:headsign", "@type": "xsd:string" },
        "isVersionOf": { "@id": "dct:isVersionOf", "@type": "@id" },
        "generatedAtTime": { "@id": "prov:generatedAtTime", "@type": "xsd:dateTime" },
        "asWKT": { "@id": "geosparql:asWKT", "@type": "geosparql:wktLiteral" }
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum Coercion {
    None,
    Id,
    Datatype(NamedNode),
}

#[derive(Debug, Clone, PartialEq)]
struct TermDefinition {
    iri: String,
    coercion: Coercion,
}

#[derive(Debug, Clone, Default)]
pub struct LinkedDataContext {
    prefixes: HashMap<String, String>,
    terms: HashMap<String, TermDefinition>,
}

impl LinkedDataContext {
    /// Builds a context from the default one overlaid with `overrides`.
    pub fn with_overrides(overrides: Option<&Value>) -> Result<Self> {
        let mut merged = match default_context() {
            Value::Object(m) => m,
            _ => Map::new(),
        };
        match overrides {
            None | Some(Value::Null) => {}
            Some(Value::Object(m)) => {
                for (k, v) in m {
                    merged.insert(k.clone(), v.clone());
                }
            }
            Some(other) => {
                return Err(PipelineError::Config(format!(
                    "@context must be a JSON object, got {other}"
                )));
            }
        }
        Self::from_map(&merged)
    }

    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        let mut ctx = LinkedDataContext::default();

        // prefixes first so term definitions can use them
        for (k, v) in map {
            if let Value::String(iri) = v {
                if !k.contains(':') {
                    ctx.prefixes.insert(k.clone(), iri.clone());
                }
            }
        }

        for (k, v) in map {
            let def = match v {
                Value::String(iri) => TermDefinition {
                    iri: ctx.expand_iri(iri).unwrap_or_else(|| iri.clone()),
                    coercion: Coercion::None,
                },
                Value::Object(obj) => {
                    let id = match obj.get("@id").and_then(Value::as_str) {
                        Some(id) => id.to_string(),
                        None => k.clone(),
                    };
                    let iri = ctx.expand_iri(&id).ok_or_else(|| {
                        PipelineError::Config(format!("cannot expand @id of context term {k:?}"))
                    })?;
                    let coercion = match obj.get("@type").and_then(Value::as_str) {
                        None => Coercion::None,
                        Some("@id") | Some("@vocab") => Coercion::Id,
                        Some(dt) => {
                            let dt_iri = ctx.expand_iri(dt).ok_or_else(|| {
                                PipelineError::Config(format!(
                                    "cannot expand @type {dt:?} of context term {k:?}"
                                ))
                            })?;
                            Coercion::Datatype(NamedNode::new(dt_iri).map_err(|e| {
                                PipelineError::Config(format!("invalid datatype for {k:?}: {e}"))
                            })?)
                        }
                    };
                    TermDefinition { iri, coercion }
                }
                _ => {
                    return Err(PipelineError::Config(format!(
                        "unsupported context entry for {k:?}"
                    )));
                }
            };
            ctx.terms.insert(k.clone(), def);
        }

        Ok(ctx)
    }

    /// Expands a compact IRI (`prefix:suffix`), a defined term, or passes an
    /// absolute IRI through.
    pub fn expand_iri(&self, value: &str) -> Option<String> {
        if let Some((prefix, suffix)) = value.split_once(':') {
            if !suffix.starts_with("//") {
                if let Some(base) = self.prefixes.get(prefix) {
                    return Some(format!("{base}{suffix}"));
                }
            }
            return Some(value.to_string());
        }
        self.terms.get(value).map(|t| t.iri.clone())
    }

    /// Predicate IRI and coercion for a property term, `None` when unmapped.
    pub fn property(&self, term: &str) -> Option<(NamedNode, Coercion)> {
        let (iri, coercion) = match self.terms.get(term) {
            Some(def) => (def.iri.clone(), def.coercion.clone()),
            None if term.contains(':') => (self.expand_iri(term)?, Coercion::None),
            None => {
                debug!(term, "Dropping property not mapped by @context");
                return None;
            }
        };
        NamedNode::new(iri).ok().map(|n| (n, coercion))
    }

    /// Class IRI for an `@type` value.
    pub fn class(&self, term: &str) -> Option<NamedNode> {
        NamedNode::new(self.expand_iri(term)?).ok()
    }
}
