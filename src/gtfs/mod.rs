//! Static GTFS and GTFS-Realtime collaborators producing raw connections.

mod connections;
mod index;
mod realtime;
pub mod tables;

#[cfg(test)]
pub(crate) mod testdata;

use crate::error::Result;
use crate::history::PendingWrite;
use crate::model::RawConnection;

/// A produced connection and the ledger write that marks it as published.
/// The write is committed only once the change event has been delivered.
#[derive(Debug)]
pub struct PendingConnection {
    pub connection: RawConnection,
    pub on_delivered: Option<PendingWrite>,
}

impl From<RawConnection> for PendingConnection {
    fn from(connection: RawConnection) -> Self {
        Self {
            connection,
            on_delivered: None,
        }
    }
}

/// Lazily produced connections; per-item errors are skipped by the pipeline.
pub type ConnectionIter = Box<dyn Iterator<Item = Result<PendingConnection>> + Send>;

pub use connections::{ConnectionGenerator, GtfsConnectionGenerator, LEDGER_FILE};
pub use index::{GtfsIndexBuilder, HISTORY_FILE, IndexBuild, IndexBuilder, IndexSet, IndexTables};
pub use realtime::{GtfsRealtimeParser, RealtimeSource};
