//! Fetching remote plugin sources.
//!
//! A remote source is a base URL serving the manifest JSON at
//! `<source>/manifest` and the plugin code at `<source>/code`.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::PluginError;
use crate::manifest::PluginManifest;

#[async_trait]
pub trait SourceFetcher: Send + Sync + 'static {
    async fn fetch_manifest(&self, source: &str) -> Result<PluginManifest, PluginError>;

    async fn fetch_code(&self, source: &str) -> Result<String, PluginError>;
}

/// Fetches sources over HTTP(S) with reqwest.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("plughost/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn get_text(&self, source: &str, leaf: &str) -> Result<String, PluginError> {
        let url = endpoint(source, leaf)?;
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| PluginError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PluginError::Http(format!("GET {url} returned {status}")));
        }

        resp.text()
            .await
            .map_err(|e| PluginError::Http(e.to_string()))
    }
}

/// `<source>/<leaf>`, tolerating a trailing slash on `source`.
fn endpoint(source: &str, leaf: &str) -> Result<url::Url, PluginError> {
    let base = source.trim_end_matches('/');
    let url = url::Url::parse(&format!("{base}/{leaf}"))
        .map_err(|e| PluginError::Http(format!("invalid source URL '{source}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(PluginError::Http(format!(
            "unsupported source scheme '{}'",
            url.scheme()
        )));
    }
    Ok(url)
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch_manifest(&self, source: &str) -> Result<PluginManifest, PluginError> {
        let body = self.get_text(source, "manifest").await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn fetch_code(&self, source: &str) -> Result<String, PluginError> {
        self.get_text(source, "code").await
    }
}
