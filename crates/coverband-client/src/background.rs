use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ReportSchedule;
use crate::payload::CoverageReport;
use crate::store::{CoverageStore, ServiceStore};
use crate::views::ViewTracker;

/// Where the background loop pulls deltas from: whatever the instrumentation
/// engine accumulated since the last call.
pub trait DeltaSource: Send + Sync {
    fn take_delta(&self) -> CoverageReport;
}

impl<F> DeltaSource for F
where
    F: Fn() -> CoverageReport + Send + Sync,
{
    fn take_delta(&self) -> CoverageReport {
        (self)()
    }
}

pub struct BackgroundReporter;

impl BackgroundReporter {
    /// Starts the loop for `store` as its configuration allows. Returns `None`
    /// when the service is disabled for this environment or the environment
    /// has no schedule. `views` is dropped when view tracking is off.
    pub fn start(
        store: Arc<ServiceStore>,
        source: Arc<dyn DeltaSource>,
        views: Option<Arc<ViewTracker>>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let config = store.config();
        if config.service_disabled() {
            info!(
                target = "coverband.background",
                runtime_env = %config.runtime_env,
                "coverband disabled for this environment; not reporting"
            );
            return None;
        }
        let schedule = config.schedule()?;
        let views = views.filter(|_| config.track_views());
        Some(Self::spawn(store, source, views, schedule, cancel))
    }

    /// Reports every `interval` plus a random wiggle of up to `wiggle`, so a
    /// fleet restarted together does not report in lockstep. Cancelling the
    /// token triggers one last report before the task exits.
    pub fn spawn(
        store: Arc<dyn CoverageStore>,
        source: Arc<dyn DeltaSource>,
        views: Option<Arc<ViewTracker>>,
        schedule: ReportSchedule,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                target = "coverband.background",
                interval_secs = schedule.interval.as_secs(),
                wiggle_secs = schedule.wiggle.as_secs(),
                "background reporting started"
            );
            loop {
                let pause = schedule.interval + jitter(schedule.wiggle);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        report_once(store.as_ref(), source.as_ref(), views.as_deref()).await;
                        break;
                    }
                    _ = tokio::time::sleep(pause) => {
                        report_once(store.as_ref(), source.as_ref(), views.as_deref()).await;
                    }
                }
            }
            info!(target = "coverband.background", "background reporting stopped");
        })
    }
}

async fn report_once(
    store: &dyn CoverageStore,
    source: &dyn DeltaSource,
    views: Option<&ViewTracker>,
) {
    let delta = source.take_delta();
    let outcome = store.save_report(delta).await;
    debug!(target = "coverband.background", outcome = ?outcome, "coverage tick");
    if let Some(views) = views {
        views.report_views_tracked().await;
    }
}

fn jitter(wiggle: Duration) -> Duration {
    let max = wiggle.as_millis() as u64;
    if max == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max))
}
