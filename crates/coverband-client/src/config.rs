use std::env;
use std::time::Duration;

use url::Url;

use crate::error::{ReportError, ReportResult};
use crate::payload::CoverageType;

pub const DEFAULT_SERVICE_URL: &str = "https://coverband.io";
pub const DEFAULT_STATS_URL: &str = "https://api.datadoghq.com";
pub const DEFAULT_REPORT_PERIOD_SECS: u64 = 600;
pub const DEFAULT_MAX_CONCURRENT_REPORTS: usize = 2;

/// Immutable client configuration, built once at startup and shared by
/// reference with the transports, the payload builder and the store.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: Url,
    pub api_key: Option<String>,
    pub runtime_env: String,
    pub process_type: String,
    pub coverband_id: Option<String>,
    pub timeout: Duration,
    pub enable_dev_mode: bool,
    pub enable_test_mode: bool,
    pub disable_view_tracker: bool,
    pub report_period: Duration,
    pub stats_api_key: Option<String>,
    pub stats_url: Url,
    pub roots: Vec<String>,
    pub max_concurrent_reports: usize,
}

/// How often the background reporter wakes up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportSchedule {
    pub interval: Duration,
    pub wiggle: Duration,
}

impl ClientConfig {
    pub fn from_env() -> ReportResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. `from_env` is
    /// this with `std::env::var`.
    pub fn from_lookup<F>(lookup: F) -> ReportResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| normalize_opt(lookup(key));

        let runtime_env = get("RACK_ENV")
            .or_else(|| get("RAILS_ENV"))
            .unwrap_or_else(|| "unknown".to_string());
        let base_url = parse_base_url(
            get("COVERBAND_URL")
                .as_deref()
                .unwrap_or(DEFAULT_SERVICE_URL),
        )?;
        let stats_url = parse_base_url(
            get("COVERBAND_STATS_URL")
                .as_deref()
                .unwrap_or(DEFAULT_STATS_URL),
        )?;
        let timeout = get("COVERBAND_TIMEOUT")
            .and_then(|val| val.parse::<f64>().ok())
            .filter(|secs| *secs > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or_else(|| default_timeout(&runtime_env));
        let report_period = get("COVERBAND_REPORT_PERIOD")
            .and_then(|val| val.parse().ok())
            .unwrap_or(DEFAULT_REPORT_PERIOD_SECS);
        let roots = match get("COVERBAND_ROOT_PATHS") {
            Some(paths) => paths
                .split(',')
                .filter_map(|p| normalize_opt(Some(p.to_string())))
                .collect(),
            None => default_roots(),
        };

        Ok(Self {
            base_url,
            api_key: get("COVERBAND_API_KEY"),
            process_type: get("PROCESS_TYPE").unwrap_or_else(|| "unknown".to_string()),
            coverband_id: get("COVERBAND_ID"),
            timeout,
            enable_dev_mode: truthy(get("COVERBAND_ENABLE_DEV_MODE")),
            enable_test_mode: truthy(get("COVERBAND_ENABLE_TEST_MODE")),
            disable_view_tracker: truthy(get("COVERBAND_DISABLE_VIEW_TRACKER")),
            report_period: Duration::from_secs(report_period),
            stats_api_key: get("DATADOG_API_KEY"),
            stats_url,
            roots,
            max_concurrent_reports: DEFAULT_MAX_CONCURRENT_REPORTS,
            runtime_env,
        })
    }

    /// Configuration pointed at `base_url` with everything else defaulted;
    /// used by tests and embedders that wire things up by hand.
    pub fn new(base_url: &str, api_key: Option<&str>) -> ReportResult<Self> {
        Ok(Self::from_lookup(|_| None)?
            .with_base_url(base_url)?
            .with_api_key(api_key.map(str::to_string)))
    }

    pub fn with_base_url(mut self, base_url: &str) -> ReportResult<Self> {
        self.base_url = parse_base_url(base_url)?;
        Ok(self)
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn with_runtime_env(mut self, runtime_env: impl Into<String>) -> Self {
        self.runtime_env = runtime_env.into();
        self
    }

    pub fn with_process_type(mut self, process_type: impl Into<String>) -> Self {
        self.process_type = process_type.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_roots(mut self, roots: Vec<String>) -> Self {
        self.roots = roots;
        self
    }

    pub fn with_stats(mut self, api_key: Option<String>, url: Url) -> Self {
        self.stats_api_key = api_key;
        self.stats_url = url;
        self
    }

    pub fn with_coverband_id(mut self, coverband_id: Option<String>) -> Self {
        self.coverband_id = coverband_id;
        self
    }

    pub fn is_development(&self) -> bool {
        self.runtime_env == "development"
    }

    pub fn is_production(&self) -> bool {
        self.runtime_env == "production"
    }

    pub fn is_test(&self) -> bool {
        self.runtime_env == "test"
    }

    /// Reporting is off by default in development and test unless the
    /// matching opt-in flag is set.
    pub fn service_disabled(&self) -> bool {
        (self.is_test() && !self.enable_test_mode)
            || (self.is_development() && !self.enable_dev_mode)
    }

    pub fn track_views(&self) -> bool {
        !self.disable_view_tracker && !self.service_disabled()
    }

    /// Background reporting cadence, or `None` when the loop must not run.
    pub fn schedule(&self) -> Option<ReportSchedule> {
        if self.is_test() {
            return None;
        }
        if self.is_production() {
            Some(ReportSchedule {
                interval: self.report_period,
                wiggle: Duration::from_secs(90),
            })
        } else {
            Some(ReportSchedule {
                interval: Duration::from_secs(60),
                wiggle: Duration::from_secs(6),
            })
        }
    }

    /// Upper bound on a whole save-and-time sequence: two transport attempts
    /// plus the timing emit, each bounded by `timeout`.
    pub fn report_deadline(&self) -> Duration {
        self.timeout * 4
    }

    pub fn collector_url(&self) -> ReportResult<Url> {
        Ok(self.base_url.join("api/collector")?)
    }

    pub fn coverage_url(
        &self,
        coverage_type: CoverageType,
        env_filter: Option<&str>,
    ) -> ReportResult<Url> {
        let mut url = match &self.coverband_id {
            Some(id) => self.base_url.join(&format!("api/coverage/{id}"))?,
            None => self.base_url.join("api/coverage")?,
        };
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("type", coverage_type.as_str());
            if self.coverband_id.is_none() {
                if let Some(filter) = env_filter {
                    query.append_pair("env_filter", filter);
                }
            }
        }
        Ok(url)
    }

    pub fn stats_series_url(&self) -> ReportResult<Url> {
        Ok(self.stats_url.join("api/v1/series")?)
    }
}

fn parse_base_url(raw: &str) -> ReportResult<Url> {
    // Url::join replaces the last segment unless the base ends with a slash.
    let with_slash = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    Url::parse(&with_slash)
        .map_err(|err| ReportError::InvalidConfig(format!("invalid base url '{raw}': {err}")))
}

fn default_timeout(runtime_env: &str) -> Duration {
    if runtime_env == "development" {
        Duration::from_secs(5)
    } else {
        Duration::from_secs(1)
    }
}

fn default_roots() -> Vec<String> {
    env::current_dir()
        .ok()
        .and_then(|dir| dir.to_str().map(|s| format!("{}/", s.trim_end_matches('/'))))
        .into_iter()
        .collect()
}

fn truthy(value: Option<String>) -> bool {
    match value {
        Some(val) => matches!(
            val.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => false,
    }
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
