pub mod config;
pub mod delivery;
pub mod error;
pub mod fetch;
pub mod gtfs;
pub mod history;
pub mod ldes;
pub mod model;
pub mod parser;
pub mod pipeline;
pub mod scheduler;
pub mod templates;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
