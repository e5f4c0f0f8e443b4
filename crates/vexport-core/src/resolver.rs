//! Export-link resolution
//!
//! The engine never talks to the export-link API directly. It hands a
//! [`LinkRequest`] to a caller-supplied [`LinkResolver`] and surfaces any
//! failure as [`ExportError::LinkRequestFailed`]. There is no retry here.

use crate::error::ExportError;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use vexport_types::{Chunk, ExportFormat, ExportItem, LinkRequest, LinkResponse};

/// Maps a chunk request to a download URL
#[async_trait]
pub trait LinkResolver: Send + Sync {
    async fn request_link(&self, request: LinkRequest) -> anyhow::Result<LinkResponse>;
}

/// Resolver backed by an async closure
pub struct FnResolver<F>(pub F);

#[async_trait]
impl<F, Fut> LinkResolver for FnResolver<F>
where
    F: Fn(LinkRequest) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<LinkResponse>> + Send,
{
    async fn request_link(&self, request: LinkRequest) -> anyhow::Result<LinkResponse> {
        (self.0)(request).await
    }
}

/// Resolver that POSTs the request as JSON to an export-link endpoint
#[derive(Debug, Clone)]
pub struct HttpLinkResolver {
    client: reqwest::Client,
    endpoint: url::Url,
    token: Option<String>,
}

impl HttpLinkResolver {
    pub fn new(endpoint: &str) -> Result<Self, ExportError> {
        let endpoint = url::Url::parse(endpoint)
            .map_err(|e| ExportError::InvalidConfig(format!("invalid resolver endpoint {}: {}", endpoint, e)))?;
        let client = reqwest::Client::builder()
            .user_agent("VExport/0.1.0")
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ExportError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            token: None,
        })
    }

    /// Send `Authorization: Bearer <token>` with every request
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[async_trait]
impl LinkResolver for HttpLinkResolver {
    async fn request_link(&self, request: LinkRequest) -> anyhow::Result<LinkResponse> {
        let mut builder = self.client.post(self.endpoint.clone()).json(&request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("export link endpoint returned {}: {}", status, body.trim());
        }

        Ok(response.json::<LinkResponse>().await?)
    }
}

/// Typed boundary between the scheduler and the caller's resolver
#[derive(Clone)]
pub struct LinkResolverAdapter {
    inner: Arc<dyn LinkResolver>,
    format: ExportFormat,
}

impl LinkResolverAdapter {
    pub fn new(inner: Arc<dyn LinkResolver>, format: ExportFormat) -> Self {
        Self { inner, format }
    }

    pub fn request_for(&self, item: &ExportItem, chunk: &Chunk) -> LinkRequest {
        LinkRequest {
            stream_uuid: item.stream_uuid.clone(),
            format: self.format,
            start_date: chunk.start_time,
            end_date: chunk.end_time,
            with_audio: item.with_audio,
        }
    }

    /// Resolve the download URL for one chunk
    pub async fn resolve(&self, item: &ExportItem, chunk: &Chunk) -> Result<url::Url, ExportError> {
        let request = self.request_for(item, chunk);
        debug!(
            "Requesting export link for chunk {} ({} - {})",
            chunk.id, request.start_date, request.end_date
        );

        let response = self
            .inner
            .request_link(request)
            .await
            .map_err(|e| ExportError::LinkRequestFailed(format!("{:#}", e)))?;

        let link = response.link.trim();
        if link.is_empty() {
            return Err(ExportError::LinkRequestFailed("resolver returned an empty link".to_string()));
        }
        url::Url::parse(link)
            .map_err(|e| ExportError::LinkRequestFailed(format!("resolver returned an invalid link {}: {}", link, e)))
    }
}
