//! Configuration source backed by the cluster's management REST API.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use keyroute_core::config::{BucketRef, PoolDetails, PoolsResponse};
use keyroute_core::TopologyError;
use reqwest::{Client, Response, Url};
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::ListenerError;
use crate::traits::{ConfigChunks, ConfigSource};

/// Talks to `/pools` style endpoints over HTTP.
///
/// Requests authenticate with HTTP basic auth, user = bucket name and
/// password = bucket password.
#[derive(Debug, Clone)]
pub struct HttpConfigSource {
    client: Client,
    bucket: String,
    password: Option<String>,
    probe_timeout: Duration,
}

impl HttpConfigSource {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self, ListenerError> {
        let connect_timeout = Duration::from_millis(config.http_connect_timeout_ms);
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            password: config.bucket_password.clone(),
            probe_timeout: connect_timeout,
        })
    }

    async fn get(&self, url: Url, timeout: Option<Duration>) -> Result<Response, ListenerError> {
        let mut request = self
            .client
            .get(url.clone())
            .basic_auth(&self.bucket, self.password.as_deref());
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ListenerError::Status {
                uri: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn get_text(&self, url: Url) -> Result<String, ListenerError> {
        Ok(self.get(url, None).await?.text().await?)
    }
}

fn parse_url(uri: &str) -> Result<Url, ListenerError> {
    Url::parse(uri).map_err(|e| ListenerError::InvalidUri(format!("{uri}: {e}")))
}

fn join(base: &Url, path: &str) -> Result<Url, ListenerError> {
    base.join(path)
        .map_err(|e| ListenerError::InvalidUri(format!("{path}: {e}")))
}

#[async_trait]
impl ConfigSource for HttpConfigSource {
    /// pools → first pool → its buckets list → this bucket's streaming URI.
    async fn resolve(&self, bootstrap_uri: &str) -> Result<String, ListenerError> {
        let base = parse_url(bootstrap_uri)?;

        let pool = PoolsResponse::first_pool(&self.get_text(base.clone()).await?)?;
        let details: PoolDetails = serde_json::from_str(&self.get_text(join(&base, &pool.uri)?).await?)
            .map_err(TopologyError::from)?;
        let buckets = self.get_text(join(&base, &details.buckets.uri)?).await?;
        let streaming = BucketRef::find_streaming_uri(&buckets, &self.bucket)?;

        let resolved = join(&base, &streaming)?.to_string();
        debug!(bootstrap = bootstrap_uri, streaming = %resolved, "resolved streaming uri");
        Ok(resolved)
    }

    async fn open_stream(&self, streaming_uri: &str) -> Result<ConfigChunks, ListenerError> {
        let response = self.get(parse_url(streaming_uri)?, None).await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ListenerError::from))
            .boxed())
    }

    async fn probe(&self, uri: &str) -> Result<(), ListenerError> {
        self.get(parse_url(uri)?, Some(self.probe_timeout))
            .await
            .map(drop)
            .map_err(|e| {
                debug!(uri, error = %e, "probe failed");
                ListenerError::HeartbeatFailed(uri.to_string())
            })
    }
}
