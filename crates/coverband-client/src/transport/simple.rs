use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{
    get_coverage, post_body, require_api_key, Connector, CoverageQuery, HttpConnector,
    Transport, TransportKind,
};
use crate::config::ClientConfig;
use crate::error::ReportResult;
use crate::payload::Envelope;

/// Opens a fresh connection for every call. Suited to short-lived processes
/// and tests where connection reuse buys nothing.
pub struct SimpleTransport {
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
}

impl SimpleTransport {
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self::with_connector(config, Arc::new(HttpConnector))
    }

    pub fn with_connector(config: Arc<ClientConfig>, connector: Arc<dyn Connector>) -> Self {
        Self { config, connector }
    }
}

#[async_trait]
impl Transport for SimpleTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Simple
    }

    async fn send(&self, envelope: &Envelope) -> ReportResult<()> {
        let api_key = require_api_key(&self.config)?;
        let url = self.config.collector_url()?;
        let body = envelope.to_body()?;
        debug!(
            target = "coverband.transport",
            url = %url,
            remote_uuid = %envelope.remote_uuid,
            bytes = body.len(),
            "posting envelope"
        );
        let connection = self.connector.connect(self.config.timeout, false)?;
        post_body(connection.as_ref(), &url, api_key, body).await
    }

    async fn fetch_coverage(&self, query: &CoverageQuery) -> ReportResult<Value> {
        let api_key = require_api_key(&self.config)?;
        let url = self
            .config
            .coverage_url(query.coverage_type, query.env_filter.as_deref())?;
        let connection = self.connector.connect(self.config.timeout, false)?;
        get_coverage(connection.as_ref(), &url, api_key).await
    }
}
