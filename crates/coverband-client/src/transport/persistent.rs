use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    get_coverage, post_body, require_api_key, Connection, Connector, CoverageQuery,
    HttpConnector, Transport, TransportKind,
};
use crate::config::ClientConfig;
use crate::error::ReportResult;
use crate::payload::Envelope;

/// Observable state of the shared connection. Reinitialization runs entirely
/// under the handle lock, so callers only ever see these two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Uninitialized,
    Ready,
}

enum Slot {
    Uninitialized,
    Ready(Arc<dyn Connection>),
}

struct Handle {
    slot: Slot,
    /// Bumped every time a connection is published, so a caller holding a
    /// failed connection can tell whether someone already replaced it.
    generation: u64,
}

/// Reuses one keep-alive connection across calls. A connection-level failure
/// tears the connection down, builds a fresh one and retries the same body
/// exactly once.
pub struct PersistentTransport {
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
    handle: Mutex<Handle>,
}

impl PersistentTransport {
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self::with_connector(config, Arc::new(HttpConnector))
    }

    pub fn with_connector(config: Arc<ClientConfig>, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            handle: Mutex::new(Handle {
                slot: Slot::Uninitialized,
                generation: 0,
            }),
        }
    }

    /// Opens the shared connection if it is not open yet.
    pub async fn initiate(&self) -> ReportResult<()> {
        self.current().await.map(|_| ())
    }

    pub async fn phase(&self) -> ConnectionPhase {
        match self.handle.lock().await.slot {
            Slot::Uninitialized => ConnectionPhase::Uninitialized,
            Slot::Ready(_) => ConnectionPhase::Ready,
        }
    }

    async fn current(&self) -> ReportResult<(Arc<dyn Connection>, u64)> {
        let mut handle = self.handle.lock().await;
        if let Slot::Ready(connection) = &handle.slot {
            return Ok((Arc::clone(connection), handle.generation));
        }
        let connection = self.connector.connect(self.config.timeout, true)?;
        handle.slot = Slot::Ready(Arc::clone(&connection));
        handle.generation += 1;
        debug!(
            target = "coverband.transport",
            generation = handle.generation,
            "persistent connection initiated"
        );
        Ok((connection, handle.generation))
    }

    /// Replaces the connection that failed at `failed_generation`. The old
    /// connection is shut down before the new one is published; concurrent
    /// callers that lose the race pick up the replacement instead of building
    /// another.
    async fn reinitialize(
        &self,
        failed_generation: u64,
    ) -> ReportResult<(Arc<dyn Connection>, u64)> {
        let mut handle = self.handle.lock().await;
        if handle.generation != failed_generation {
            if let Slot::Ready(connection) = &handle.slot {
                return Ok((Arc::clone(connection), handle.generation));
            }
        }

        // A failed rebuild leaves the slot empty; the next call initiates.
        if let Slot::Ready(old) = std::mem::replace(&mut handle.slot, Slot::Uninitialized) {
            old.shutdown().await;
        }
        let connection = self.connector.connect(self.config.timeout, true)?;
        handle.slot = Slot::Ready(Arc::clone(&connection));
        handle.generation += 1;
        info!(
            target = "coverband.transport",
            generation = handle.generation,
            "persistent connection reinitialized"
        );
        Ok((connection, handle.generation))
    }

    async fn with_retry<T, F, Fut>(&self, op: F) -> ReportResult<T>
    where
        F: Fn(Arc<dyn Connection>) -> Fut + Send + Sync,
        Fut: Future<Output = ReportResult<T>> + Send,
    {
        let (connection, generation) = self.current().await?;
        match op(connection).await {
            Err(err) if err.is_transport() => {
                warn!(
                    target = "coverband.transport",
                    error = %err,
                    "persistent connection failed; reconnecting and retrying once"
                );
                let (connection, _) = self.reinitialize(generation).await?;
                op(connection).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl Transport for PersistentTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Persistent
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
        let url = &url;
        self.with_retry(move |connection| {
            let body = body.clone();
            async move { post_body(connection.as_ref(), url, api_key, body).await }
        })
        .await
    }

    async fn fetch_coverage(&self, query: &CoverageQuery) -> ReportResult<Value> {
        let api_key = require_api_key(&self.config)?;
        let url = self
            .config
            .coverage_url(query.coverage_type, query.env_filter.as_deref())?;
        let url = &url;
        self.with_retry(move |connection| async move {
            get_coverage(connection.as_ref(), url, api_key).await
        })
        .await
    }
}
