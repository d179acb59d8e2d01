//! Search provider clients: Jina, Brave, Serper, DuckDuckGo.
//!
//! Each client is a thin reqwest wrapper that maps its backend's response
//! shape onto [`SearchHit`]. HTTP and decode failures surface as `Err`
//! strings; the pipeline treats them as a skipped query, never as a fatal
//! error.

use super::{SearchFuture, SearchHit, SearchProvider};
use crate::actions::SerpQuery;
use crate::config::{SearchProviderKind, Settings};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

fn http_client(settings: &Settings) -> Result<reqwest::Client, String> {
    let mut builder = reqwest::Client::builder()
        .user_agent(concat!("trawl-rs/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(30));
    if let Some(proxy_url) = settings.https_proxy.as_deref() {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| format!("invalid https_proxy `{proxy_url}`: {e}"))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| format!("failed to build HTTP client: {e}"))
}

/// Build the provider selected by the configuration.
pub fn build_provider(settings: &Settings) -> Result<Arc<dyn SearchProvider>, String> {
    let client = http_client(settings)?;
    Ok(match settings.search_provider {
        SearchProviderKind::Jina => Arc::new(JinaSearch {
            client,
            api_key: settings
                .jina_api_key
                .clone()
                .ok_or("JINA_API_KEY not found")?,
        }),
        SearchProviderKind::Brave => Arc::new(BraveSearch {
            client,
            api_key: settings
                .brave_api_key
                .clone()
                .ok_or("BRAVE_API_KEY not found")?,
        }),
        SearchProviderKind::Serper => Arc::new(SerperSearch {
            client,
            api_key: settings
                .serper_api_key
                .clone()
                .ok_or("SERPER_API_KEY not found")?,
        }),
        SearchProviderKind::Duck => Arc::new(DuckSearch { client }),
    })
}

// ── Jina ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct JinaResponse {
    #[serde(default)]
    data: Vec<SearchHit>,
}

/// `s.jina.ai` search endpoint.
pub struct JinaSearch {
    client: reqwest::Client,
    api_key: String,
}

impl SearchProvider for JinaSearch {
    fn search(&self, query: &SerpQuery) -> SearchFuture<'_> {
        let q = query.q.clone();
        Box::pin(async move {
            debug!("jina search: {q}");
            let resp = self
                .client
                .get("https://s.jina.ai/")
                .query(&[("q", q.as_str())])
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Accept", "application/json")
                .send()
                .await
                .map_err(|e| format!("request failed: {e}"))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(format!("jina search HTTP {status}"));
            }
            let parsed: JinaResponse = resp
                .json()
                .await
                .map_err(|e| format!("jina search decode failed: {e}"))?;
            Ok(parsed.data)
        })
    }
}

// ── Brave ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct BraveResponse {
    #[serde(default)]
    web: BraveWeb,
}

#[derive(Deserialize, Default)]
struct BraveWeb {
    #[serde(default)]
    results: Vec<SearchHit>,
}

/// Brave web search API.
pub struct BraveSearch {
    client: reqwest::Client,
    api_key: String,
}

impl SearchProvider for BraveSearch {
    fn search(&self, query: &SerpQuery) -> SearchFuture<'_> {
        let q = query.q.clone();
        Box::pin(async move {
            debug!("brave search: {q}");
            let resp = self
                .client
                .get("https://api.search.brave.com/res/v1/web/search")
                .query(&[("q", q.as_str())])
                .header("X-Subscription-Token", &self.api_key)
                .header("Accept", "application/json")
                .send()
                .await
                .map_err(|e| format!("request failed: {e}"))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(format!("brave search HTTP {status}"));
            }
            let parsed: BraveResponse = resp
                .json()
                .await
                .map_err(|e| format!("brave search decode failed: {e}"))?;
            Ok(parsed.web.results)
        })
    }
}

// ── Serper ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<SearchHit>,
}

/// Serper.dev Google SERP API. The only provider that understands the full
/// query object (`tbs`, `gl`, `hl`, `location`).
pub struct SerperSearch {
    client: reqwest::Client,
    api_key: String,
}

impl SearchProvider for SerperSearch {
    fn search(&self, query: &SerpQuery) -> SearchFuture<'_> {
        let query = query.clone();
        Box::pin(async move {
            debug!("serper search: {}", query.q);
            let mut body = json!({"q": query.q});
            if let Some(tbs) = &query.tbs {
                body["tbs"] = json!(tbs);
            }
            if let Some(gl) = &query.gl {
                body["gl"] = json!(gl);
            }
            if let Some(hl) = &query.hl {
                body["hl"] = json!(hl);
            }
            if let Some(location) = &query.location {
                body["location"] = json!(location);
            }

            let resp = self
                .client
                .post("https://google.serper.dev/search")
                .header("X-API-KEY", &self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| format!("request failed: {e}"))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(format!("serper search HTTP {status}"));
            }
            let parsed: SerperResponse = resp
                .json()
                .await
                .map_err(|e| format!("serper search decode failed: {e}"))?;
            Ok(parsed.organic)
        })
    }
}

// ── DuckDuckGo ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct DuckResponse {
    #[serde(rename = "RelatedTopics", default)]
    related_topics: Vec<DuckTopic>,
    #[serde(rename = "AbstractURL", default)]
    abstract_url: String,
    #[serde(rename = "AbstractText", default)]
    abstract_text: String,
    #[serde(rename = "Heading", default)]
    heading: String,
}

#[derive(Deserialize)]
struct DuckTopic {
    #[serde(rename = "FirstURL", default)]
    first_url: String,
    #[serde(rename = "Text", default)]
    text: String,
}

/// DuckDuckGo instant-answer API. Keyless, so it is the fallback provider.
pub struct DuckSearch {
    client: reqwest::Client,
}

impl SearchProvider for DuckSearch {
    fn search(&self, query: &SerpQuery) -> SearchFuture<'_> {
        let q = query.q.clone();
        Box::pin(async move {
            debug!("duck search: {q}");
            let resp = self
                .client
                .get("https://api.duckduckgo.com/")
                .query(&[("q", q.as_str()), ("format", "json"), ("no_html", "1")])
                .send()
                .await
                .map_err(|e| format!("request failed: {e}"))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(format!("duck search HTTP {status}"));
            }
            let parsed: DuckResponse = resp
                .json()
                .await
                .map_err(|e| format!("duck search decode failed: {e}"))?;

            let mut hits = Vec::new();
            if !parsed.abstract_url.is_empty() {
                hits.push(SearchHit {
                    title: parsed.heading,
                    url: parsed.abstract_url,
                    description: parsed.abstract_text,
                });
            }
            hits.extend(
                parsed
                    .related_topics
                    .into_iter()
                    .filter(|t| !t.first_url.is_empty())
                    .map(|t| SearchHit {
                        title: t.text.chars().take(80).collect(),
                        url: t.first_url,
                        description: t.text,
                    }),
            );
            Ok(hits)
        })
    }
}
