//! Item feeds: a JSON file on disk or an HTTP endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use sync_client::{RateLimiter, RemoteItemSource};
use sync_types::{Item, ProviderId, RemoteError, Timestamp};

use crate::config::SourceConfig;

/// One item as a feed reports it; the provider id comes from the source.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedItem {
    url: String,
    title: String,
    #[serde(default)]
    last_modified: Option<Timestamp>,
    #[serde(default)]
    metadata: Value,
}

impl FeedItem {
    fn into_item(self, provider: &ProviderId) -> Item {
        Item {
            url: self.url,
            title: self.title,
            provider_id: provider.clone(),
            last_modified: self.last_modified,
            metadata: self.metadata,
        }
    }
}

fn parse_feed(provider: &ProviderId, body: &str) -> Result<Vec<Item>, RemoteError> {
    let feed: Vec<FeedItem> =
        serde_json::from_str(body).map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
    Ok(feed.into_iter().map(|i| i.into_item(provider)).collect())
}

/// Build the source described by `config`.
pub fn build(
    provider: &ProviderId,
    config: &SourceConfig,
    limiter: &RateLimiter,
) -> Arc<dyn RemoteItemSource> {
    match config {
        SourceConfig::File { path } => Arc::new(FileSource::new(provider.clone(), path.clone())),
        SourceConfig::Http { url } => Arc::new(HttpSource::new(
            provider.clone(),
            url.clone(),
            limiter.clone(),
        )),
    }
}

/// Items read from a JSON array on disk.
#[derive(Debug, Clone)]
pub struct FileSource {
    provider: ProviderId,
    path: PathBuf,
}

impl FileSource {
    /// Source reading `path` for `provider`.
    pub fn new(provider: ProviderId, path: PathBuf) -> Self {
        Self { provider, path }
    }
}

#[async_trait]
impl RemoteItemSource for FileSource {
    async fn fetch_items(&self, _token: Option<&str>) -> Result<Vec<Item>, RemoteError> {
        let body = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            RemoteError::Other(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        parse_feed(&self.provider, &body)
    }
}

/// Items fetched with `GET` from an HTTP endpoint.
///
/// Sends the access token as a bearer credential when one is available and
/// feeds the response's rate-limit headers back into the limiter.
#[derive(Debug, Clone)]
pub struct HttpSource {
    provider: ProviderId,
    url: String,
    client: reqwest::Client,
    limiter: RateLimiter,
}

impl HttpSource {
    /// Source fetching `url` for `provider`.
    pub fn new(provider: ProviderId, url: String, limiter: RateLimiter) -> Self {
        Self {
            provider,
            url,
            client: reqwest::Client::new(),
            limiter,
        }
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Network(e.to_string())
    }
}

#[async_trait]
impl RemoteItemSource for HttpSource {
    async fn fetch_items(&self, token: Option<&str>) -> Result<Vec<Item>, RemoteError> {
        let mut request = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(transport_error)?;

        let headers: Vec<(&str, &str)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
            .collect();
        if self.limiter.update_from_header_pairs(&self.provider, headers) {
            tracing::debug!("Adopted upstream rate-limit state for {}", self.provider);
        }

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .ok()
                .filter(|body| !body.trim().is_empty())
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("").to_string());
            return Err(RemoteError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.text().await.map_err(transport_error)?;
        parse_feed(&self.provider, &body)
    }
}
