//! Delivery of serialized change events to the ingestion endpoint.

mod engine;
mod sink;

pub use engine::{DeliveryReport, Outgoing, ThrottledDeliveryEngine};
pub use sink::{EventSink, HttpSink};
