use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::payload::{CollectionData, Envelope, PayloadBuilder};
use crate::store::{log_failure, SaveOutcome};
use crate::transport::Transport;

/// Accumulates rendered view paths and ships them as a separate stream.
///
/// Delivery is at-most-once: the accumulator is emptied when a flush starts,
/// whether or not the send succeeds.
pub struct ViewTracker {
    builder: PayloadBuilder,
    transport: Arc<dyn Transport>,
    views: Mutex<Vec<String>>,
}

impl ViewTracker {
    pub fn new(builder: PayloadBuilder, transport: Arc<dyn Transport>) -> Self {
        Self {
            builder,
            transport,
            views: Mutex::new(Vec::new()),
        }
    }

    /// Records a view; returns `false` if it was already pending.
    pub fn track(&self, view: impl Into<String>) -> bool {
        let view = view.into();
        let mut views = self.views.lock();
        if views.contains(&view) {
            return false;
        }
        views.push(view);
        true
    }

    pub fn pending(&self) -> Vec<String> {
        self.views.lock().clone()
    }

    pub async fn report_views_tracked(&self) -> SaveOutcome {
        let views = std::mem::take(&mut *self.views.lock());
        let Some(package) = self.builder.build_tracked_views(&views) else {
            return SaveOutcome::Skipped;
        };
        let count = package.tracked_views.len();
        let envelope = Envelope::new(CollectionData::ViewTrackerDelta(package));
        match self.transport.send(&envelope).await {
            Ok(()) => {
                debug!(target = "coverband.views", count, "tracked views saved");
                SaveOutcome::Sent
            }
            Err(err) => {
                log_failure("report_views_tracked", &err);
                SaveOutcome::Dropped
            }
        }
    }
}
