//! URL content fetching: the collaborator trait and a Jina reader client.

use crate::config::Settings;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

/// Boxed future returned by the fetcher methods.
pub type FetchFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send + 'a>>;

/// Extracted content of one fetched page.
#[derive(Clone, Debug, Default)]
pub struct PageContent {
    pub title: String,
    pub content: String,
    pub last_modified: Option<String>,
}

/// The URL-fetcher collaborator.
pub trait UrlFetcher: Send + Sync {
    /// Fetch and extract the full text of a page.
    fn read(&self, url: &str) -> FetchFuture<'_, PageContent>;

    /// Probe only the last-modified datetime of a page, if the server
    /// reports one.
    fn last_modified(&self, url: &str) -> FetchFuture<'_, Option<String>>;
}

// ── Jina reader ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ReaderResponse {
    data: ReaderData,
}

#[derive(Deserialize)]
struct ReaderData {
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
    #[serde(rename = "publishedTime", default)]
    published_time: Option<String>,
}

/// `r.jina.ai` reader: returns extracted page text as JSON.
pub struct JinaReader {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl JinaReader {
    pub fn new(settings: &Settings) -> Result<Self, String> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("trawl-rs/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60));
        if let Some(proxy_url) = settings.https_proxy.as_deref() {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| format!("invalid https_proxy `{proxy_url}`: {e}"))?;
            builder = builder.proxy(proxy);
        }
        Ok(Self {
            client: builder
                .build()
                .map_err(|e| format!("failed to build HTTP client: {e}"))?,
            api_key: settings.jina_api_key.clone(),
        })
    }
}

impl UrlFetcher for JinaReader {
    fn read(&self, url: &str) -> FetchFuture<'_, PageContent> {
        let url = url.to_string();
        Box::pin(async move {
            debug!("reading {url}");
            let mut request = self
                .client
                .get(format!("https://r.jina.ai/{url}"))
                .header("Accept", "application/json");
            if let Some(key) = &self.api_key {
                request = request.header("Authorization", format!("Bearer {key}"));
            }
            let resp = request
                .send()
                .await
                .map_err(|e| format!("request failed: {e}"))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(format!("reader HTTP {status} for {url}"));
            }
            let parsed: ReaderResponse = resp
                .json()
                .await
                .map_err(|e| format!("reader decode failed: {e}"))?;
            Ok(PageContent {
                title: parsed.data.title,
                content: parsed.data.content,
                last_modified: parsed.data.published_time,
            })
        })
    }

    fn last_modified(&self, url: &str) -> FetchFuture<'_, Option<String>> {
        let url = url.to_string();
        Box::pin(async move {
            let resp = self
                .client
                .head(&url)
                .send()
                .await
                .map_err(|e| format!("request failed: {e}"))?;
            let header = resp
                .headers()
                .get(reqwest::header::LAST_MODIFIED)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Ok(header)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_response_decodes() {
        let body = r#"{"data": {"title": "Paris", "content": "Paris is...", "publishedTime": "2024-01-02"}}"#;
        let parsed: ReaderResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.data.title, "Paris");
        assert_eq!(parsed.data.published_time.as_deref(), Some("2024-01-02"));
    }

    #[test]
    fn reader_response_tolerates_missing_fields() {
        let body = r#"{"data": {}}"#;
        let parsed: ReaderResponse = serde_json::from_str(body).unwrap();
        assert!(parsed.data.title.is_empty());
        assert!(parsed.data.published_time.is_none());
    }
}
