//! Two cron-driven triggers over one shared [`PipelineState`].
//!
//! The incremental trigger builds the index on demand and runs realtime
//! passes, never two at once. The full-refresh trigger suspends the
//! incremental one, waits for an in-flight realtime pass to settle, ingests
//! the static feed and then retires the index so the next incremental tick
//! rebuilds it.

mod cron;
pub mod jobs;
mod state;

pub use cron::CronExpr;
pub use jobs::{Collaborators, JobSettings};
pub use state::{IndexState, PipelineState, SkipReason, TickOutcome};

use chrono::Utc;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{error, info, instrument, warn};

use crate::config::LaunchMode;
use crate::error::Result;
use crate::pipeline::PassReport;

/// Trigger cadences and launch behaviour.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub full_refresh: CronExpr,
    /// `None` when no realtime feed is configured.
    pub incremental: Option<CronExpr>,
    pub run_on_launch: bool,
    pub launch_mode: LaunchMode,
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    FullRefresh,
    Incremental,
}

impl Trigger {
    fn name(self) -> &'static str {
        match self {
            Trigger::FullRefresh => "full_refresh",
            Trigger::Incremental => "incremental",
        }
    }
}

pub struct PipelineScheduler {
    state: Mutex<PipelineState>,
    realtime_settled: Notify,
    collaborators: Collaborators,
    settings: JobSettings,
}

/// Clears `realtime_busy` when the incremental tick ends, however it ends.
struct BusyGuard<'a>(&'a PipelineScheduler);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().realtime_busy = false;
        self.0.realtime_settled.notify_waiters();
    }
}

enum IncrementalStep {
    Build,
    Run(Arc<crate::gtfs::IndexSet>),
}

impl PipelineScheduler {
    pub fn new(collaborators: Collaborators, settings: JobSettings) -> Self {
        Self {
            state: Mutex::new(PipelineState::default()),
            realtime_settled: Notify::new(),
            collaborators,
            settings,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        // State stays consistent across a panic: every transition is a plain assignment.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Name of the current index state, for logs and tests.
    pub fn index_state(&self) -> &'static str {
        self.lock().index.name()
    }

    pub fn realtime_busy(&self) -> bool {
        self.lock().realtime_busy
    }

    #[instrument(name = "incremental_tick", skip_all)]
    pub async fn on_incremental_tick(&self) -> TickOutcome<PassReport> {
        let step = {
            let mut st = self.lock();
            if st.shutting_down {
                return TickOutcome::Skipped(SkipReason::ShuttingDown);
            }
            if !st.incremental_enabled {
                return TickOutcome::Skipped(SkipReason::IncrementalDisabled);
            }
            if st.realtime_busy {
                return TickOutcome::Skipped(SkipReason::RealtimeBusy);
            }
            let step = match &st.index {
                IndexState::Ready(index) => IncrementalStep::Run(index.clone()),
                IndexState::Absent => IncrementalStep::Build,
                IndexState::Building => return TickOutcome::Skipped(SkipReason::RealtimeBusy),
            };
            if matches!(step, IncrementalStep::Build) {
                st.index = IndexState::Building;
            }
            st.realtime_busy = true;
            step
        };
        let _busy = BusyGuard(self);

        let index = match step {
            IncrementalStep::Run(index) => index,
            IncrementalStep::Build => {
                match jobs::build_index(&self.collaborators, &self.settings).await {
                    Ok(Some(set)) => {
                        let index = Arc::new(set);
                        self.lock().index = IndexState::Ready(index.clone());
                        info!("Index ready");
                        index
                    }
                    Ok(None) => {
                        self.lock().index = IndexState::Absent;
                        return TickOutcome::NotYetAvailable;
                    }
                    Err(e) => {
                        self.lock().index = IndexState::Absent;
                        return TickOutcome::Failed(e);
                    }
                }
            }
        };

        match jobs::incremental_pass(&self.collaborators, &self.settings, index).await {
            Ok(report) => TickOutcome::Ran(report),
            Err(e) => TickOutcome::Failed(e),
        }
    }

    #[instrument(name = "full_refresh_tick", skip_all)]
    pub async fn on_full_refresh_tick(&self) -> TickOutcome<PassReport> {
        {
            let mut st = self.lock();
            if st.shutting_down {
                return TickOutcome::Skipped(SkipReason::ShuttingDown);
            }
            if st.refreshing {
                return TickOutcome::Skipped(SkipReason::RefreshInProgress);
            }
            st.refreshing = true;
            st.incremental_enabled = false;
        }

        loop {
            let settled = self.realtime_settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();
            if !self.lock().realtime_busy {
                break;
            }
            info!("Waiting for the running incremental pass to settle");
            settled.await;
        }

        let result = jobs::full_refresh_pass(&self.collaborators, &self.settings).await;

        let retiring = {
            let mut st = self.lock();
            st.refreshing = false;
            st.incremental_enabled = true;
            std::mem::take(&mut st.index)
        };
        if let IndexState::Ready(index) = retiring {
            if let Err(e) = index.close() {
                warn!(error = %e, "Failed to close retiring history store");
            }
        }

        match result {
            Ok(report) => TickOutcome::Ran(report),
            Err(e) => TickOutcome::Failed(e),
        }
    }

    /// Runs the triggers until `shutdown` resolves, then shuts down gracefully.
    pub async fn run<F>(self: Arc<Self>, schedule: Schedule, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        if schedule.run_on_launch {
            match schedule.launch_mode {
                LaunchMode::FullRefresh => {
                    info!("Running full refresh on launch");
                    tokio::select! {
                        outcome = self.on_full_refresh_tick() => log_outcome(Trigger::FullRefresh, &outcome),
                        _ = &mut shutdown => return self.shutdown().await,
                    }
                }
                LaunchMode::IncrementalOnly => {
                    info!("Launching with the incremental trigger only");
                }
            }
        }

        let mut loops = vec![tokio::spawn(trigger_loop(
            self.clone(),
            schedule.full_refresh.clone(),
            Trigger::FullRefresh,
        ))];
        match schedule.incremental.clone() {
            Some(cron) => loops.push(tokio::spawn(trigger_loop(
                self.clone(),
                cron,
                Trigger::Incremental,
            ))),
            None => warn!("No realtime feed configured, incremental updates disabled"),
        }
        info!(
            full_refresh = schedule.full_refresh.as_str(),
            incremental = schedule.incremental.as_ref().map(|c| c.as_str()),
            "Scheduler started"
        );

        shutdown.await;
        info!("Shutting down scheduler");
        for handle in loops {
            handle.abort();
        }
        self.shutdown().await
    }

    /// Stops new ticks, waits for a running incremental pass or index build
    /// to settle, then closes the history store.
    pub async fn shutdown(&self) -> Result<()> {
        self.lock().shutting_down = true;
        loop {
            let settled = self.realtime_settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();
            if !self.lock().realtime_busy {
                break;
            }
            info!("Waiting for the running incremental pass to settle before closing");
            settled.await;
        }
        self.close()
    }

    /// Closes the history store of the current index, if any.
    pub fn close(&self) -> Result<()> {
        let index = std::mem::take(&mut self.lock().index);
        match index {
            IndexState::Ready(index) => index.close(),
            _ => Ok(()),
        }
    }
}

/// Sleeps until each next cron time and spawns the tick, so a slow pass
/// never delays observing the following tick.
async fn trigger_loop(scheduler: Arc<PipelineScheduler>, cron: CronExpr, trigger: Trigger) {
    loop {
        let now = Utc::now();
        let next = match cron.next_after(now) {
            Ok(next) => next,
            Err(e) => {
                error!(trigger = trigger.name(), error = %e, "Trigger stopped");
                return;
            }
        };
        tokio::time::sleep((next - now).to_std().unwrap_or_default()).await;

        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let outcome = match trigger {
                Trigger::FullRefresh => scheduler.on_full_refresh_tick().await,
                Trigger::Incremental => scheduler.on_incremental_tick().await,
            };
            log_outcome(trigger, &outcome);
        });
    }
}

fn log_outcome(trigger: Trigger, outcome: &TickOutcome<PassReport>) {
    let trigger = trigger.name();
    match outcome {
        TickOutcome::Ran(report) => info!(
            trigger,
            produced = report.produced,
            transform_failed = report.transform_failed,
            attempted = report.delivery.attempted,
            failed = report.delivery.failed,
            "Tick completed"
        ),
        TickOutcome::Skipped(reason) => info!(trigger, reason = ?reason, "Tick skipped"),
        TickOutcome::NotYetAvailable => {
            warn!(trigger, "Static data not ingested yet, waiting for a full refresh")
        }
        TickOutcome::Failed(e) => error!(trigger, error = %e, "Tick failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeedConfig;
    use crate::delivery::EventSink;
    use crate::error::PipelineError;
    use crate::fetch::ArchiveSource;
    use crate::gtfs::testdata::write_feed;
    use crate::gtfs::{
        ConnectionIter, GtfsConnectionGenerator, GtfsIndexBuilder, IndexSet, RealtimeSource,
    };
    use crate::ldes::LinkedDataContext;
    use crate::templates::{IriTemplates, UriTemplateConfig};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Writes the test feed into the data folder instead of downloading.
    #[derive(Default)]
    struct LocalArchive {
        fail: AtomicBool,
    }

    #[async_trait]
    impl ArchiveSource for LocalArchive {
        async fn fetch_and_extract(&self, data_dir: &Path) -> crate::error::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(PipelineError::source_unavailable("test", "download", "offline"));
            }
            write_feed(data_dir, 2, 3, 0);
            Ok(())
        }
    }

    /// Realtime source that holds each pass open for a while.
    struct SlowRealtime {
        passes: AtomicUsize,
        delay: Duration,
        /// Set when a pass found the history store closed under it.
        saw_closed: AtomicBool,
    }

    impl RealtimeSource for SlowRealtime {
        fn connections(&self, _feed: Bytes, index: Arc<IndexSet>) -> crate::error::Result<ConnectionIter> {
            self.passes.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if !index.history.is_open() {
                self.saw_closed.store(true, Ordering::SeqCst);
            }
            Ok(Box::new(std::iter::empty()))
        }
    }

    struct NullSink;

    #[async_trait]
    impl EventSink for NullSink {
        async fn post(&self, _payload: Bytes) -> crate::error::Result<()> {
            Ok(())
        }

        fn target(&self) -> &str {
            "null"
        }
    }

    fn scheduler(
        dir: &Path,
        archive: Arc<LocalArchive>,
        realtime: Arc<SlowRealtime>,
    ) -> PipelineScheduler {
        std::fs::write(dir.join("rt.pb"), b"").unwrap();
        let templates = UriTemplateConfig {
            stop: "https://ex.org/stops/{stops.stop_id}".into(),
            route: "https://ex.org/routes/{routes.route_id}".into(),
            trip: "https://ex.org/trips/{trips.trip_id}".into(),
            connection: "https://ex.org/connections/{trips.trip_id}/{trips.startTime(yyyyMMdd)}/{connection.stopSequence}".into(),
            resolve: BTreeMap::new(),
        };
        let settings = JobSettings {
            data_dir: dir.to_path_buf(),
            throttle_rate: 2,
            templates: Arc::new(IriTemplates::compile(&templates).unwrap()),
            context: Arc::new(LinkedDataContext::with_overrides(None).unwrap()),
            realtime_feed: Some(FeedConfig {
                source: dir.join("rt.pb").display().to_string(),
                cron: "* * * * *".into(),
                auth_headers: BTreeMap::new(),
            }),
        };
        let collaborators = Collaborators {
            archive,
            generator: Arc::new(GtfsConnectionGenerator),
            index_builder: Arc::new(GtfsIndexBuilder),
            realtime,
            sink: Arc::new(NullSink),
        };
        PipelineScheduler::new(collaborators, settings)
    }

    fn slow(ms: u64) -> Arc<SlowRealtime> {
        Arc::new(SlowRealtime {
            passes: AtomicUsize::new(0),
            delay: Duration::from_millis(ms),
            saw_closed: AtomicBool::new(false),
        })
    }

    #[tokio::test]
    async fn test_incremental_before_any_refresh_is_not_yet_available() {
        let dir = tempfile::tempdir().unwrap();
        let s = scheduler(dir.path(), Arc::default(), slow(0));
        assert!(matches!(s.on_incremental_tick().await, TickOutcome::NotYetAvailable));
        assert_eq!(s.index_state(), "absent");
        assert!(!s.realtime_busy());
    }

    #[tokio::test]
    async fn test_refresh_then_incremental_builds_index() {
        let dir = tempfile::tempdir().unwrap();
        let s = scheduler(dir.path(), Arc::default(), slow(0));

        let TickOutcome::Ran(report) = s.on_full_refresh_tick().await else {
            panic!("full refresh should run");
        };
        assert_eq!(report.produced, 4);
        assert_eq!(report.delivery.succeeded, 4);
        assert_eq!(s.index_state(), "absent");

        assert!(s.on_incremental_tick().await.is_ran());
        assert_eq!(s.index_state(), "ready");
        assert!(s.on_incremental_tick().await.is_ran());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overlapping_incremental_tick_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let realtime = slow(300);
        let s = Arc::new(scheduler(dir.path(), Arc::default(), realtime.clone()));
        assert!(s.on_full_refresh_tick().await.is_ran());

        let first = tokio::spawn({
            let s = s.clone();
            async move { s.on_incremental_tick().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            s.on_incremental_tick().await,
            TickOutcome::Skipped(SkipReason::RealtimeBusy)
        ));
        assert!(first.await.unwrap().is_ran());
        assert_eq!(realtime.passes.load(Ordering::SeqCst), 1);
        assert!(!s.realtime_busy());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_refresh_waits_for_incremental_and_retires_index() {
        let dir = tempfile::tempdir().unwrap();
        let realtime = slow(300);
        let s = Arc::new(scheduler(dir.path(), Arc::default(), realtime.clone()));
        assert!(s.on_full_refresh_tick().await.is_ran());
        assert!(s.on_incremental_tick().await.is_ran());
        assert_eq!(s.index_state(), "ready");

        let pass = tokio::spawn({
            let s = s.clone();
            async move { s.on_incremental_tick().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(s.on_full_refresh_tick().await.is_ran());
        assert!(pass.await.unwrap().is_ran());
        assert_eq!(s.index_state(), "absent");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_waits_for_running_incremental_pass() {
        let dir = tempfile::tempdir().unwrap();
        let realtime = slow(300);
        let s = Arc::new(scheduler(dir.path(), Arc::default(), realtime.clone()));
        assert!(s.on_full_refresh_tick().await.is_ran());
        assert!(s.on_incremental_tick().await.is_ran());

        let pass = tokio::spawn({
            let s = s.clone();
            async move { s.on_incremental_tick().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        s.shutdown().await.unwrap();

        assert!(!s.realtime_busy());
        assert!(pass.await.unwrap().is_ran());
        assert!(!realtime.saw_closed.load(Ordering::SeqCst));
        assert_eq!(s.index_state(), "absent");
        assert!(matches!(
            s.on_incremental_tick().await,
            TickOutcome::Skipped(SkipReason::ShuttingDown)
        ));
        assert!(matches!(
            s.on_full_refresh_tick().await,
            TickOutcome::Skipped(SkipReason::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_failed_refresh_still_forces_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Arc::new(LocalArchive::default());
        let s = scheduler(dir.path(), archive.clone(), slow(0));
        assert!(s.on_full_refresh_tick().await.is_ran());
        assert!(s.on_incremental_tick().await.is_ran());
        assert_eq!(s.index_state(), "ready");

        archive.fail.store(true, Ordering::SeqCst);
        assert!(matches!(s.on_full_refresh_tick().await, TickOutcome::Failed(_)));
        assert_eq!(s.index_state(), "absent");

        // The old data folder is still usable: the next tick rebuilds from it.
        assert!(s.on_incremental_tick().await.is_ran());
        assert_eq!(s.index_state(), "ready");
    }

    #[tokio::test]
    async fn test_failed_incremental_keeps_index_ready() {
        let dir = tempfile::tempdir().unwrap();
        let s = scheduler(dir.path(), Arc::default(), slow(0));
        assert!(s.on_full_refresh_tick().await.is_ran());
        assert!(s.on_incremental_tick().await.is_ran());

        std::fs::remove_file(dir.path().join("rt.pb")).unwrap();
        assert!(matches!(s.on_incremental_tick().await, TickOutcome::Failed(_)));
        assert_eq!(s.index_state(), "ready");
        assert!(!s.realtime_busy());
    }
}
