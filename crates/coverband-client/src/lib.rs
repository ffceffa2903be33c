//! Coverband service client: ships in-process coverage deltas and tracked
//! views to the Coverband collector.
//!
//! Responsibilities:
//! - building tagged delta packages from raw coverage reports
//! - posting them over a one-shot or a persistent, retry-once connection
//! - emitting save timings to a stats backend when one is configured
//! - a parallel, at-most-once stream for tracked views
//! - an optional background loop that reports on a fixed, wiggled interval
//!
//! Reporting must never take the host application down, so the public entry
//! points log failures and return instead of propagating them.

pub mod background;
pub mod config;
pub mod error;
pub mod identity;
pub mod payload;
pub mod store;
pub mod timing;
pub mod transport;
pub mod views;

pub use background::{BackgroundReporter, DeltaSource};
pub use config::{ClientConfig, ReportSchedule};
pub use error::{ReportError, ReportResult};
pub use identity::ClientIdentity;
pub use payload::{
    CollectionData, CoverageReport, CoverageType, DeltaPackage, Envelope, PayloadBuilder,
    TrackedViewsPackage,
};
pub use store::{CoverageOptions, CoverageStore, SaveOutcome, ServiceStore};
pub use timing::TimingSink;
pub use transport::{
    Connection, Connector, CoverageQuery, HttpConnector, PersistentTransport, SimpleTransport,
    Transport, TransportKind,
};
pub use views::ViewTracker;
