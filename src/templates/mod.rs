//! IRI materialization: templates, date patterns and resolvers.

pub mod datefmt;
pub mod iri;
pub mod resolver;

pub use iri::{IriTemplate, IriTemplates, UriTemplateConfig};
pub use resolver::{ResolveContext, ResolverSpec, ResolverTable, Transform};
