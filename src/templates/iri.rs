//! IRI templates such as
//! `https://example.org/connections/{routeName}/{trips.startTime(yyyyMMdd'T'HHmm)}/{depStop}`.

use serde::Deserialize;
use std::collections::BTreeMap;

use super::datefmt::DatePattern;
use super::resolver::{FieldRef, ResolveContext, ResolverSpec, ResolverTable, Source};
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq)]
enum Variable {
    Resolved(String),
    Field(FieldRef),
    Formatted {
        attr: TemporalAttr,
        pattern: DatePattern,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TemporalAttr {
    StartTime,
    DepartureTime,
    ArrivalTime,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Var { name: String, var: Variable },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IriTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl IriTemplate {
    /// Parses `template`; variable names present in `resolvers` bind to them,
    /// anything else must follow the `<source>.<attribute>` convention.
    pub fn parse(template: &str, resolvers: &ResolverTable) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                PipelineError::Config(format!("unclosed variable in template {template:?}"))
            })?;
            let name = after[..close].trim();
            if name.is_empty() {
                return Err(PipelineError::Config(format!(
                    "empty variable in template {template:?}"
                )));
            }
            segments.push(Segment::Var {
                name: name.to_string(),
                var: parse_variable(name, resolvers)?,
            });
            rest = &after[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            raw: template.to_string(),
            segments,
        })
    }

    pub fn fill(&self, ctx: &ResolveContext<'_>, resolvers: &ResolverTable) -> Result<String> {
        let mut out = String::with_capacity(self.raw.len() + 32);
        for seg in &self.segments {
            match seg {
                Segment::Literal(s) => out.push_str(s),
                Segment::Var { name, var } => {
                    let value = match var {
                        Variable::Resolved(r) => resolvers.get(r).and_then(|f| f(ctx)),
                        Variable::Field(field) => field.lookup(ctx),
                        Variable::Formatted { attr, pattern } => {
                            let t = match attr {
                                TemporalAttr::StartTime => &ctx.start_time,
                                TemporalAttr::DepartureTime => &ctx.departure_time,
                                TemporalAttr::ArrivalTime => &ctx.arrival_time,
                            };
                            Some(pattern.format(t))
                        }
                    };
                    let value = value.ok_or_else(|| {
                        PipelineError::Transform(format!(
                            "template variable {{{name}}} has no value in {:?}",
                            self.raw
                        ))
                    })?;
                    out.push_str(&value);
                }
            }
        }
        Ok(out)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn parse_variable(name: &str, resolvers: &ResolverTable) -> Result<Variable> {
    if resolvers.contains(name) {
        return Ok(Variable::Resolved(name.to_string()));
    }

    if let Some(open) = name.find('(') {
        let Some(inner) = name[open + 1..].strip_suffix(')') else {
            return Err(PipelineError::Config(format!(
                "malformed date pattern call in {{{name}}}"
            )));
        };
        let head = &name[..open];
        let (source, attr) = head.split_once('.').ok_or_else(|| {
            PipelineError::Config(format!("expected <source>.<attribute>(pattern) in {{{name}}}"))
        })?;
        let source = Source::parse(source)
            .ok_or_else(|| PipelineError::Config(format!("unknown source in {{{name}}}")))?;
        let attr = match (source, attr) {
            (Source::Trips, "startTime") => TemporalAttr::StartTime,
            (Source::Connection, "departureTime") => TemporalAttr::DepartureTime,
            (Source::Connection, "arrivalTime") => TemporalAttr::ArrivalTime,
            _ => {
                return Err(PipelineError::Config(format!(
                    "{{{name}}}: only trips.startTime, connection.departureTime and connection.arrivalTime take a pattern"
                )));
            }
        };
        return Ok(Variable::Formatted {
            attr,
            pattern: DatePattern::parse(inner)?,
        });
    }

    if name.contains('.') {
        return Ok(Variable::Field(FieldRef::parse(name)?));
    }

    Err(PipelineError::Config(format!(
        "template variable {{{name}}} has no resolver and is not a <source>.<attribute> reference"
    )))
}

/// `uri_templates` section of the configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UriTemplateConfig {
    pub stop: String,
    pub route: String,
    pub trip: String,
    pub connection: String,
    #[serde(default)]
    pub resolve: BTreeMap<String, ResolverSpec>,
}

/// The four compiled identity templates plus the resolvers they bind to.
#[derive(Debug, Clone)]
pub struct IriTemplates {
    pub stop: IriTemplate,
    pub route: IriTemplate,
    pub trip: IriTemplate,
    pub connection: IriTemplate,
    pub resolvers: ResolverTable,
}

impl IriTemplates {
    pub fn compile(config: &UriTemplateConfig) -> Result<Self> {
        let resolvers = ResolverTable::from_specs(&config.resolve)?;
        Self::with_resolvers(config, resolvers)
    }

    /// Compiles with an explicit table, e.g. one extended with Rust closures.
    pub fn with_resolvers(config: &UriTemplateConfig, resolvers: ResolverTable) -> Result<Self> {
        Ok(Self {
            stop: IriTemplate::parse(&config.stop, &resolvers)?,
            route: IriTemplate::parse(&config.route, &resolvers)?,
            trip: IriTemplate::parse(&config.trip, &resolvers)?,
            connection: IriTemplate::parse(&config.connection, &resolvers)?,
            resolvers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::resolver::tests::sample_connection;
    use crate::templates::resolver::Transform;

    fn delijn_config() -> UriTemplateConfig {
        let mut resolve = BTreeMap::new();
        resolve.insert(
            "routeName".to_string(),
            ResolverSpec {
                field: "routes.route_long_name".into(),
                transforms: vec![Transform::WhitespaceToUnderscore],
            },
        );
        resolve.insert(
            "depStop".to_string(),
            ResolverSpec {
                field: "connection.departureStop.stop_code".into(),
                transforms: vec![],
            },
        );
        resolve.insert(
            "direction".to_string(),
            ResolverSpec {
                field: "trips.trip_headsign".into(),
                transforms: vec![Transform::WhitespaceToUnderscore],
            },
        );
        UriTemplateConfig {
            stop: "https://data.delijn.be/stops/{stops.stop_code}".into(),
            route: "https://data.delijn.be/routes/{routeName}".into(),
            trip: r"https://data.delijn.be/trips/{routeName}/{direction}/{trips.startTime(yyyyMMdd\'T\'HHmm)}".into(),
            connection: r"https://data.delijn.be/connections/{routeName}/{direction}/{trips.startTime(yyyyMMdd\'T\'HHmm)}/{depStop}/".into(),
            resolve,
        }
    }

    fn ctx(conn: &crate::model::RawConnection) -> ResolveContext<'_> {
        ResolveContext {
            connection: conn,
            stop: &conn.arrival_stop,
            start_time: conn.trip.start_time.normalize().unwrap(),
            departure_time: conn.departure_time.normalize().unwrap(),
            arrival_time: conn.arrival_time.normalize().unwrap(),
        }
    }

    #[test]
    fn test_fill_connection_template() {
        let t = IriTemplates::compile(&delijn_config()).unwrap();
        let conn = sample_connection();
        let iri = t.connection.fill(&ctx(&conn), &t.resolvers).unwrap();
        assert_eq!(
            iri,
            "https://data.delijn.be/connections/Turnhout_-_Herentals_-_Leuven/Leuven_Station/20220707T1310/2827/"
        );
    }

    #[test]
    fn test_stop_template_uses_role_stop() {
        let t = IriTemplates::compile(&delijn_config()).unwrap();
        let conn = sample_connection();
        let iri = t.stop.fill(&ctx(&conn), &t.resolvers).unwrap();
        assert_eq!(iri, "https://data.delijn.be/stops/6231");
    }

    #[test]
    fn test_unknown_variable_is_a_config_error() {
        let mut cfg = delijn_config();
        cfg.route = "https://x/{mystery}".into();
        assert!(matches!(
            IriTemplates::compile(&cfg),
            Err(PipelineError::Config(_))
        ));
        cfg.route = "https://x/{routes.route_id".into();
        assert!(IriTemplates::compile(&cfg).is_err());
        cfg.route = "https://x/{routes.route_id(yyyy)}".into();
        assert!(IriTemplates::compile(&cfg).is_err());
    }

    #[test]
    fn test_missing_value_is_a_transform_error() {
        let t = IriTemplates::compile(&delijn_config()).unwrap();
        let mut conn = sample_connection();
        conn.arrival_stop.stop_code = None;
        let err = t.stop.fill(&ctx(&conn), &t.resolvers).unwrap_err();
        assert!(matches!(err, PipelineError::Transform(_)));
    }

    #[test]
    fn test_connection_time_patterns() {
        let resolvers = ResolverTable::default();
        let t = IriTemplate::parse(
            "urn:c:{connection.departureTime(HHmm)}-{connection.arrivalTime(HHmm)}",
            &resolvers,
        )
        .unwrap();
        let conn = sample_connection();
        assert_eq!(t.fill(&ctx(&conn), &resolvers).unwrap(), "urn:c:1501-1503");
    }
}
