//! The store the instrumentation engine reports into.
//!
//! [`CoverageStore`] is the narrow capability the engine depends on;
//! [`ServiceStore`] implements it by shipping deltas to the collector. Nothing
//! here returns an error to the caller: failures are logged and dropped.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{ReportError, ReportResult};
use crate::identity::ClientIdentity;
use crate::payload::{CollectionData, CoverageReport, CoverageType, Envelope, PayloadBuilder};
use crate::timing::TimingSink;
use crate::transport::{
    CoverageQuery, PersistentTransport, SimpleTransport, Transport, TransportKind,
};
use crate::views::ViewTracker;

/// What happened to a report handed to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Nothing to send.
    Skipped,
    Sent,
    /// Attempted and lost; already logged.
    Dropped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageOptions {
    pub override_type: Option<CoverageType>,
    pub env_filter: Option<String>,
}

#[async_trait]
pub trait CoverageStore: Send + Sync {
    async fn save_report(&self, report: CoverageReport) -> SaveOutcome;

    async fn coverage(
        &self,
        coverage_type: Option<CoverageType>,
        opts: CoverageOptions,
    ) -> Option<Value>;

    /// Clearing is owned by the server.
    fn clear(&self) {}

    fn clear_file(&self, _path: &str) {}

    /// Local size is not tracked.
    fn size(&self) -> usize {
        0
    }
}

pub struct ServiceStore {
    config: Arc<ClientConfig>,
    builder: PayloadBuilder,
    transport: Arc<dyn Transport>,
    timing: Arc<TimingSink>,
    coverage_type: RwLock<CoverageType>,
    permits: Arc<Semaphore>,
}

impl ServiceStore {
    /// Store over a keep-alive connection with stats when configured. This is
    /// the one long-running hosts should use.
    pub fn persistent(config: ClientConfig) -> Self {
        let config = Arc::new(config);
        let transport = Arc::new(PersistentTransport::new(Arc::clone(&config)));
        Self::assemble(config, transport)
    }

    /// Store that opens a connection per report.
    pub fn simple(config: ClientConfig) -> Self {
        let config = Arc::new(config);
        let transport = Arc::new(SimpleTransport::new(Arc::clone(&config)));
        Self::assemble(config, transport)
    }

    fn assemble(config: Arc<ClientConfig>, transport: Arc<dyn Transport>) -> Self {
        let identity = Arc::new(ClientIdentity::new(config.process_type.clone()));
        let timing = TimingSink::from_config(&config, &identity, transport.kind());
        Self::new(config, identity, transport, timing)
    }

    pub fn new(
        config: Arc<ClientConfig>,
        identity: Arc<ClientIdentity>,
        transport: Arc<dyn Transport>,
        timing: TimingSink,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_reports.max(1)));
        Self {
            builder: PayloadBuilder::new(Arc::clone(&config), identity),
            config,
            transport,
            timing: Arc::new(timing),
            coverage_type: RwLock::new(CoverageType::Runtime),
            permits,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn identity(&self) -> &ClientIdentity {
        self.builder.identity()
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn coverage_type(&self) -> CoverageType {
        *self.coverage_type.read()
    }

    /// The engine flips this to `EagerLoading` while the app boots and back to
    /// `Runtime` afterwards.
    pub fn set_type(&self, coverage_type: CoverageType) {
        *self.coverage_type.write() = coverage_type;
    }

    /// Access to the underlying store is only offered by the persistent
    /// variant.
    pub fn raw_store(&self) -> ReportResult<&Self> {
        match self.transport.kind() {
            TransportKind::Persistent => Ok(self),
            TransportKind::Simple => Err(ReportError::Unsupported("raw_store")),
        }
    }

    /// A view tracker sharing this store's transport and roots.
    pub fn view_tracker(&self) -> ViewTracker {
        ViewTracker::new(self.builder.clone(), Arc::clone(&self.transport))
    }

    pub async fn save_report(&self, report: CoverageReport) -> SaveOutcome {
        if report.is_empty() {
            return SaveOutcome::Skipped;
        }
        self.builder.identity().bind_pid();

        let coverage_type = self.coverage_type();
        let builder = self.builder.clone();
        let transport = Arc::clone(&self.transport);
        let timing = Arc::clone(&self.timing);
        let permits = Arc::clone(&self.permits);
        let files = report.len();
        let deadline = self.config.report_deadline();

        // The deadline covers the send and its timing only. Waiting for a
        // permit is bounded by the deadlines of the reports holding them.
        let task = tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|err| ReportError::Join(err.to_string()))?;
            let package =
                tokio::task::spawn_blocking(move || builder.build_delta(&report, coverage_type))
                    .await
                    .map_err(|err| ReportError::Join(err.to_string()))?;
            let Some(package) = package else {
                return Ok(());
            };
            let envelope = Envelope::new(CollectionData::CoverageDelta(package));
            tokio::time::timeout(deadline, send_timed(transport.as_ref(), &timing, &envelope))
                .await
                .map_err(|_| ReportError::TimedOut(deadline))?
        });

        let result = match task.await {
            Ok(result) => result,
            Err(err) => Err(ReportError::Join(err.to_string())),
        };

        match result {
            Ok(()) => {
                debug!(
                    target = "coverband.store",
                    files,
                    coverage_type = %coverage_type,
                    "coverage delta saved"
                );
                SaveOutcome::Sent
            }
            Err(err) => {
                log_failure("save_report", &err);
                SaveOutcome::Dropped
            }
        }
    }

    pub async fn coverage(
        &self,
        coverage_type: Option<CoverageType>,
        opts: CoverageOptions,
    ) -> Option<Value> {
        let query = CoverageQuery {
            coverage_type: coverage_type
                .or(opts.override_type)
                .unwrap_or_else(|| self.coverage_type()),
            env_filter: opts.env_filter,
        };
        let deadline = self.config.report_deadline();
        let fetch = self.transport.fetch_coverage(&query);
        let result = match tokio::time::timeout(deadline, fetch).await {
            Ok(result) => result,
            Err(_) => Err(ReportError::TimedOut(deadline)),
        };
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                log_failure("coverage", &err);
                None
            }
        }
    }
}

#[async_trait]
impl CoverageStore for ServiceStore {
    async fn save_report(&self, report: CoverageReport) -> SaveOutcome {
        ServiceStore::save_report(self, report).await
    }

    async fn coverage(
        &self,
        coverage_type: Option<CoverageType>,
        opts: CoverageOptions,
    ) -> Option<Value> {
        ServiceStore::coverage(self, coverage_type, opts).await
    }
}

/// Sends and feeds the elapsed time to the timing sink. Nothing is timed when
/// the send was abandoned before touching the network.
async fn send_timed(
    transport: &dyn Transport,
    timing: &TimingSink,
    envelope: &Envelope,
) -> ReportResult<()> {
    let started = Instant::now();
    let result = transport.send(envelope).await;
    if !matches!(result, Err(ReportError::MissingApiKey)) {
        timing.report_timing(started.elapsed()).await;
    }
    result
}

pub(crate) fn log_failure(operation: &'static str, err: &ReportError) {
    match err {
        ReportError::MissingApiKey => warn!(
            target = "coverband.store",
            operation,
            "no Coverband API key was found; set COVERBAND_API_KEY"
        ),
        other => warn!(
            target = "coverband.store",
            operation,
            error = %other,
            "Coverband request failed"
        ),
    }
}
