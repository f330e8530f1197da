use std::sync::Arc;

use crate::gtfs::IndexSet;

/// Lifecycle of the realtime index generation.
#[derive(Debug, Clone, Default)]
pub enum IndexState {
    #[default]
    Absent,
    Building,
    Ready(Arc<IndexSet>),
}

impl IndexState {
    pub fn name(&self) -> &'static str {
        match self {
            IndexState::Absent => "absent",
            IndexState::Building => "building",
            IndexState::Ready(_) => "ready",
        }
    }
}

/// Shared scheduler state. Held behind one mutex; each transition is a
/// single short critical section and no lock is held across an await.
#[derive(Debug)]
pub struct PipelineState {
    pub index: IndexState,
    pub realtime_busy: bool,
    pub refreshing: bool,
    pub incremental_enabled: bool,
    /// Set once shutdown starts; no new tick runs after that.
    pub shutting_down: bool,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            index: IndexState::Absent,
            realtime_busy: false,
            refreshing: false,
            incremental_enabled: true,
            shutting_down: false,
        }
    }
}

/// What a trigger firing led to.
#[derive(Debug)]
pub enum TickOutcome<R> {
    Ran(R),
    Skipped(SkipReason),
    /// Static data was not extracted yet; the realtime tick does nothing.
    NotYetAvailable,
    Failed(crate::error::PipelineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A previous incremental pass is still running.
    RealtimeBusy,
    /// Incremental processing is suspended by a full refresh.
    IncrementalDisabled,
    /// Another full refresh is already running.
    RefreshInProgress,
    /// The scheduler is shutting down.
    ShuttingDown,
}

impl<R> TickOutcome<R> {
    pub fn is_ran(&self) -> bool {
        matches!(self, TickOutcome::Ran(_))
    }
}
