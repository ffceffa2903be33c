//! Outbound payload shapes and the builder that produces them.
//!
//! Everything sent to the collector is wrapped the same way:
//!
//! ```text
//! { "remote_uuid": "<uuid v4>",
//!   "data": { "collection_type": "coverage_delta" | "view_tracker_delta",
//!             "collection_data": { ... } } }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{ReportError, ReportResult};
use crate::identity::ClientIdentity;

/// File path to hit counters, exactly as the instrumentation engine produced
/// them. Counters are forwarded verbatim.
pub type CoverageReport = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageType {
    EagerLoading,
    #[default]
    Runtime,
}

impl CoverageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoverageType::EagerLoading => "eager_loading",
            CoverageType::Runtime => "runtime",
        }
    }
}

impl fmt::Display for CoverageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CoverageType {
    type Err = ReportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "eager_loading" | "eager" => Ok(CoverageType::EagerLoading),
            "runtime" => Ok(CoverageType::Runtime),
            other => Err(ReportError::InvalidConfig(format!(
                "unknown coverage type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaTags {
    pub process_type: String,
    pub runtime_env: String,
    pub app_loading: bool,
    pub pid: u32,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileCoverage {
    pub first_updated_at: u64,
    pub last_updated_at: Option<u64>,
    pub file_hash: Option<String>,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaPackage {
    pub tags: DeltaTags,
    pub file_coverage: BTreeMap<String, FileCoverage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewTags {
    pub runtime_env: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedViewsPackage {
    pub tags: ViewTags,
    pub collection_time: u64,
    pub tracked_views: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "collection_type",
    content = "collection_data",
    rename_all = "snake_case"
)]
pub enum CollectionData {
    CoverageDelta(DeltaPackage),
    ViewTrackerDelta(TrackedViewsPackage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub remote_uuid: Uuid,
    pub data: CollectionData,
}

impl Envelope {
    /// Wraps `data` with a freshly minted `remote_uuid`. Every envelope gets
    /// its own id, even for identical content.
    pub fn new(data: CollectionData) -> Self {
        Self {
            remote_uuid: Uuid::new_v4(),
            data,
        }
    }

    pub fn to_body(&self) -> ReportResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|err| ReportError::Serialize(err.to_string()))
    }
}

/// Turns raw reports into tagged packages using the process identity and the
/// configured roots. Clones share the file hash cache.
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    config: Arc<ClientConfig>,
    identity: Arc<ClientIdentity>,
    hashes: Arc<Mutex<HashMap<String, Option<String>>>>,
}

impl PayloadBuilder {
    pub fn new(config: Arc<ClientConfig>, identity: Arc<ClientIdentity>) -> Self {
        Self {
            config,
            identity,
            hashes: Arc::default(),
        }
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn build_delta(
        &self,
        report: &CoverageReport,
        coverage_type: CoverageType,
    ) -> Option<DeltaPackage> {
        self.build_delta_at(report, coverage_type, unix_now())
    }

    /// Returns `None` for an empty report; callers skip sending entirely.
    pub fn build_delta_at(
        &self,
        report: &CoverageReport,
        coverage_type: CoverageType,
        report_time: u64,
    ) -> Option<DeltaPackage> {
        if report.is_empty() {
            return None;
        }
        let app_loading = coverage_type == CoverageType::EagerLoading;
        let last_updated_at = if app_loading { None } else { Some(report_time) };

        let file_coverage = report
            .iter()
            .map(|(path, counters)| {
                let entry = FileCoverage {
                    first_updated_at: report_time,
                    last_updated_at,
                    file_hash: self.file_hash(path),
                    data: counters.clone(),
                };
                (relative_path(path, &self.config.roots), entry)
            })
            .collect();

        Some(DeltaPackage {
            tags: DeltaTags {
                process_type: self.identity.process_type().to_string(),
                runtime_env: self.config.runtime_env.clone(),
                app_loading,
                pid: self.identity.bind_pid(),
                hostname: self.identity.hostname().to_string(),
            },
            file_coverage,
        })
    }

    /// MD5 hex of the file contents, computed once per path for the life of
    /// the process. Unreadable files hash to `None`.
    fn file_hash(&self, path: &str) -> Option<String> {
        if let Some(hash) = self.hashes.lock().get(path) {
            return hash.clone();
        }
        let hash = std::fs::read(path)
            .ok()
            .map(|contents| hex::encode(Md5::digest(&contents)));
        self.hashes.lock().insert(path.to_string(), hash.clone());
        hash
    }

    pub fn build_tracked_views(&self, views: &[String]) -> Option<TrackedViewsPackage> {
        self.build_tracked_views_at(views, unix_now())
    }

    pub fn build_tracked_views_at(
        &self,
        views: &[String],
        collection_time: u64,
    ) -> Option<TrackedViewsPackage> {
        if views.is_empty() {
            return None;
        }
        Some(TrackedViewsPackage {
            tags: ViewTags {
                runtime_env: self.config.runtime_env.clone(),
            },
            collection_time,
            tracked_views: views
                .iter()
                .map(|view| relative_path(view, &self.config.roots))
                .collect(),
        })
    }
}

/// Strips the first matching root prefix and any leading slash left behind.
pub fn relative_path(path: &str, roots: &[String]) -> String {
    for root in roots.iter().filter(|r| !r.is_empty()) {
        if let Some(rest) = path.strip_prefix(root.as_str()) {
            return rest.trim_start_matches('/').to_string();
        }
    }
    path.to_string()
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
