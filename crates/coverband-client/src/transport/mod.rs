//! Getting envelopes to the collector.
//!
//! [`Transport`] is what the store talks to. Both shipped transports sit on top
//! of a [`Connector`], which hands out [`Connection`]s; the reqwest-backed
//! [`HttpConnector`] is the real one, tests substitute their own.

mod http;
mod persistent;
mod simple;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use serde_json::Value;
use url::Url;

use crate::config::ClientConfig;
use crate::error::{ReportError, ReportResult};
use crate::payload::{CoverageType, Envelope};

pub use http::HttpConnector;
pub use persistent::{ConnectionPhase, PersistentTransport};
pub use simple::SimpleTransport;

pub const TOKEN_HEADER: &str = "Coverband-Token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Simple,
    Persistent,
}

impl TransportKind {
    /// Device label attached to timing metrics.
    pub fn label(&self) -> &'static str {
        match self {
            TransportKind::Simple => "coverband_service",
            TransportKind::Persistent => "coverband_persistent_service",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Parameters of a coverage read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageQuery {
    pub coverage_type: CoverageType,
    pub env_filter: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl HttpResponse {
    fn into_success(self) -> ReportResult<Bytes> {
        if self.status.is_success() {
            Ok(self.body)
        } else {
            Err(ReportError::Status {
                status: self.status,
                body: String::from_utf8_lossy(&self.body).into_owned(),
            })
        }
    }
}

/// One HTTP connection (or pool) to the collector.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn post_json(&self, url: &Url, api_key: &str, body: Bytes)
        -> ReportResult<HttpResponse>;

    async fn get(&self, url: &Url, api_key: &str) -> ReportResult<HttpResponse>;

    /// Releases whatever the connection holds. Called before a replacement is
    /// published.
    async fn shutdown(&self) {}
}

/// Builds connections with the given timeout applied to connect, TLS and
/// read alike.
pub trait Connector: Send + Sync {
    fn connect(&self, timeout: Duration, keep_alive: bool) -> ReportResult<Arc<dyn Connection>>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn send(&self, envelope: &Envelope) -> ReportResult<()>;

    async fn fetch_coverage(&self, query: &CoverageQuery) -> ReportResult<Value>;
}

fn require_api_key(config: &ClientConfig) -> ReportResult<&str> {
    config.api_key.as_deref().ok_or(ReportError::MissingApiKey)
}

async fn post_body(
    connection: &dyn Connection,
    url: &Url,
    api_key: &str,
    body: Bytes,
) -> ReportResult<()> {
    connection
        .post_json(url, api_key, body)
        .await?
        .into_success()
        .map(|_| ())
}

async fn get_coverage(
    connection: &dyn Connection,
    url: &Url,
    api_key: &str,
) -> ReportResult<Value> {
    let body = connection.get(url, api_key).await?.into_success()?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted connector shared by the transport and store tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone)]
    pub enum Scripted {
        Respond(u16, &'static str),
        Fail(&'static str),
    }

    #[derive(Debug, Clone)]
    pub struct RecordedRequest {
        pub method: &'static str,
        pub url: String,
        pub api_key: String,
        pub body: Bytes,
        pub connection_id: usize,
    }

    #[derive(Default)]
    pub struct MockConnector {
        script: Mutex<VecDeque<Scripted>>,
        requests: Mutex<Vec<RecordedRequest>>,
        connects: AtomicUsize,
        shutdowns: AtomicUsize,
        failing_connects: AtomicUsize,
        keep_alive_flags: Mutex<Vec<bool>>,
    }

    impl MockConnector {
        pub fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Self::default()
            })
        }

        pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
            Arc::new(SharedMockConnector(Arc::clone(self)))
        }

        pub fn requests(&self) -> Vec<RecordedRequest> {
            self.requests.lock().clone()
        }

        pub fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        pub fn shutdowns(&self) -> usize {
            self.shutdowns.load(Ordering::SeqCst)
        }

        /// The next `count` connect attempts fail with a transport error.
        pub fn fail_next_connects(&self, count: usize) {
            self.failing_connects.store(count, Ordering::SeqCst);
        }

        pub fn keep_alive_flags(&self) -> Vec<bool> {
            self.keep_alive_flags.lock().clone()
        }

        fn next(&self) -> Scripted {
            self.script
                .lock()
                .pop_front()
                .unwrap_or(Scripted::Respond(200, "{}"))
        }
    }

    struct MockConnection {
        id: usize,
        connector: Arc<MockConnector>,
    }

    impl MockConnection {
        fn record(
            &self,
            method: &'static str,
            url: &Url,
            api_key: &str,
            body: Bytes,
        ) -> ReportResult<HttpResponse> {
            self.connector.requests.lock().push(RecordedRequest {
                method,
                url: url.to_string(),
                api_key: api_key.to_string(),
                body,
                connection_id: self.id,
            });
            match self.connector.next() {
                Scripted::Respond(status, body) => Ok(HttpResponse {
                    status: StatusCode::from_u16(status).expect("valid status"),
                    body: Bytes::from_static(body.as_bytes()),
                }),
                Scripted::Fail(reason) => Err(ReportError::Transport(reason.to_string())),
            }
        }
    }

    #[async_trait]
    impl Connection for MockConnection {
        async fn post_json(
            &self,
            url: &Url,
            api_key: &str,
            body: Bytes,
        ) -> ReportResult<HttpResponse> {
            self.record("POST", url, api_key, body)
        }

        async fn get(&self, url: &Url, api_key: &str) -> ReportResult<HttpResponse> {
            self.record("GET", url, api_key, Bytes::new())
        }

        async fn shutdown(&self) {
            self.connector.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Connections point back at the shared script through this handle.
    struct SharedMockConnector(Arc<MockConnector>);

    impl Connector for SharedMockConnector {
        fn connect(
            &self,
            _timeout: Duration,
            keep_alive: bool,
        ) -> ReportResult<Arc<dyn Connection>> {
            let failing = &self.0.failing_connects;
            if failing
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ReportError::Transport("connection refused".into()));
            }
            let id = self.0.connects.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.keep_alive_flags.lock().push(keep_alive);
            Ok(Arc::new(MockConnection {
                id,
                connector: Arc::clone(&self.0),
            }))
        }
    }

    pub fn test_config(api_key: Option<&str>) -> Arc<ClientConfig> {
        Arc::new(
            ClientConfig::new("http://collector.test", api_key)
                .expect("config")
                .with_runtime_env("production")
                .with_roots(vec!["/app/".into()]),
        )
    }
}
