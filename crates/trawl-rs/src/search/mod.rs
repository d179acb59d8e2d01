//! Web search: the provider interface and the query pipeline.
//!
//! - [`SearchProvider`] — the collaborator trait; one implementation per
//!   backend in [`providers`], selected by a single configuration key.
//! - [`pipeline::QueryPipeline`] — dedup, site biasing, execution, snippet
//!   capture, and the LLM rewrite pass.

pub mod pipeline;
pub mod providers;

use crate::actions::SerpQuery;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by [`SearchProvider::search`].
pub type SearchFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<SearchHit>, String>> + Send + 'a>>;

/// One search result, normalized across providers. `link`/`snippet` are
/// accepted as aliases because Serper uses those field names.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SearchHit {
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "link")]
    pub url: String,
    #[serde(default, alias = "snippet")]
    pub description: String,
}

/// The search-provider collaborator.
pub trait SearchProvider: Send + Sync {
    fn search(&self, query: &SerpQuery) -> SearchFuture<'_>;
}
