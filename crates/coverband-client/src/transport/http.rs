use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder};
use url::Url;

use super::{Connection, Connector, HttpResponse, TOKEN_HEADER};
use crate::error::{ReportError, ReportResult};

const USER_AGENT: &str = concat!("coverband-client/", env!("CARGO_PKG_VERSION"));

/// Connector backed by `reqwest`. Keep-alive connections hold one idle socket
/// per host; one-shot connections hold none.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpConnector;

impl Connector for HttpConnector {
    fn connect(&self, timeout: Duration, keep_alive: bool) -> ReportResult<Arc<dyn Connection>> {
        let builder = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .user_agent(USER_AGENT);
        let builder = if keep_alive {
            builder
                .pool_max_idle_per_host(1)
                .tcp_keepalive(Some(Duration::from_secs(60)))
        } else {
            builder.pool_max_idle_per_host(0)
        };
        let client = builder.build().map_err(|err| {
            ReportError::InvalidConfig(format!("failed to build http client: {err}"))
        })?;
        Ok(Arc::new(ReqwestConnection { client }))
    }
}

struct ReqwestConnection {
    client: Client,
}

impl ReqwestConnection {
    async fn execute(&self, request: RequestBuilder, api_key: &str) -> ReportResult<HttpResponse> {
        let response = request
            .header(CONTENT_TYPE, "application/json")
            .header(TOKEN_HEADER, api_key)
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;
        Ok(HttpResponse { status, body })
    }
}

#[async_trait]
impl Connection for ReqwestConnection {
    async fn post_json(&self, url: &Url, api_key: &str, body: Bytes) -> ReportResult<HttpResponse> {
        self.execute(self.client.post(url.clone()).body(body), api_key)
            .await
    }

    async fn get(&self, url: &Url, api_key: &str) -> ReportResult<HttpResponse> {
        self.execute(self.client.get(url.clone()), api_key).await
    }
}
