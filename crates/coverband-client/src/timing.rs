//! Save-duration side channel.
//!
//! Nothing is emitted unless a stats backend was configured when the sink was
//! built; that is the common case and stays silent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::config::ClientConfig;
use crate::error::{ReportError, ReportResult};
use crate::identity::ClientIdentity;
use crate::payload::unix_now;
use crate::transport::TransportKind;

pub const SAVE_TIME_METRIC: &str = "coverband.save.time";
const STATS_HEADER: &str = "DD-API-KEY";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricPoint {
    pub metric: &'static str,
    pub points: Vec<(u64, f64)>,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub host: String,
    pub tags: Vec<String>,
}

#[async_trait]
pub trait StatsBackend: Send + Sync {
    async fn emit(&self, point: &MetricPoint) -> ReportResult<()>;
}

/// Posts points to the Datadog series API.
pub struct DatadogBackend {
    client: reqwest::Client,
    url: Url,
    api_key: String,
}

impl DatadogBackend {
    pub fn new(url: Url, api_key: impl Into<String>, timeout: Duration) -> ReportResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|err| {
                ReportError::InvalidConfig(format!("failed to build stats client: {err}"))
            })?;
        Ok(Self {
            client,
            url,
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl StatsBackend for DatadogBackend {
    async fn emit(&self, point: &MetricPoint) -> ReportResult<()> {
        #[derive(Serialize)]
        struct Series<'a> {
            series: [&'a MetricPoint; 1],
        }

        self.client
            .post(self.url.clone())
            .header(STATS_HEADER, &self.api_key)
            .json(&Series { series: [point] })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

pub struct TimingSink {
    backend: Option<Arc<dyn StatsBackend>>,
    host: String,
    device: &'static str,
    runtime_env: String,
}

impl TimingSink {
    pub fn disabled() -> Self {
        Self {
            backend: None,
            host: String::new(),
            device: TransportKind::Simple.label(),
            runtime_env: String::new(),
        }
    }

    /// Datadog-backed sink when `DATADOG_API_KEY` was configured, otherwise a
    /// silent one. A backend that cannot be built is logged and treated as
    /// absent.
    pub fn from_config(
        config: &ClientConfig,
        identity: &ClientIdentity,
        kind: TransportKind,
    ) -> Self {
        let backend = config.stats_api_key.as_ref().and_then(|api_key| {
            let built = config
                .stats_series_url()
                .and_then(|url| DatadogBackend::new(url, api_key.clone(), config.timeout));
            match built {
                Ok(backend) => Some(Arc::new(backend) as Arc<dyn StatsBackend>),
                Err(err) => {
                    debug!(target = "coverband.timing", error = %err, "stats backend disabled");
                    None
                }
            }
        });
        Self::with_backend(backend, config, identity, kind)
    }

    pub fn with_backend(
        backend: Option<Arc<dyn StatsBackend>>,
        config: &ClientConfig,
        identity: &ClientIdentity,
        kind: TransportKind,
    ) -> Self {
        Self {
            backend,
            host: identity.hostname().to_string(),
            device: kind.label(),
            runtime_env: config.runtime_env.clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn point(&self, duration: Duration) -> MetricPoint {
        MetricPoint {
            metric: SAVE_TIME_METRIC,
            points: vec![(unix_now(), duration.as_secs_f64())],
            kind: "gauge",
            host: self.host.clone(),
            tags: vec![
                format!("host:{}", self.host),
                format!("device:{}", self.device),
                format!("env:{}", self.runtime_env),
            ],
        }
    }

    pub async fn report_timing(&self, duration: Duration) {
        let Some(backend) = &self.backend else {
            return;
        };
        if let Err(err) = backend.emit(&self.point(duration)).await {
            debug!(
                target = "coverband.timing",
                error = %err,
                "failed to emit save timing"
            );
        }
    }
}
