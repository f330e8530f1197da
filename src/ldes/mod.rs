//! Linked Data Event Stream side of the pipeline: versioning connections and
//! serializing them for the ingestion endpoint.

pub mod context;
pub mod nquads;
pub mod versioner;

pub use context::LinkedDataContext;
pub use versioner::ConnectionVersioner;
