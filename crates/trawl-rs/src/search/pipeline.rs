//! Query pipeline: dedup, site biasing, execution, snippet capture, and the
//! grounded rewrite pass.
//!
//! Search never fails the loop. A provider error or an empty result set
//! skips that query; the caller decides what the diary should say about an
//! entirely dry pass.

use super::SearchProvider;
use crate::actions::{KnowledgeItem, KnowledgeKind, SerpQuery};
use crate::llm::ObjectGenerator;
use crate::schema::{DedupResult, QueryRewrite, SchemaRegistry};
use crate::trackers::TrackerContext;
use crate::urls::{UrlPool, UrlSnippet, normalize_url};
use crate::{MAX_QUERIES_PER_STEP, Message, SITE_BIAS_PROBABILITY};
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use rand::rngs::StdRng;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::warn;

static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

/// Strip HTML tags from provider snippets.
pub fn strip_html(text: &str) -> String {
    HTML_TAG.replace_all(text, "").to_string()
}

/// Render a `tbs` time filter as an absolute date range label.
pub fn format_date_range(tbs: &str) -> Option<String> {
    let now = Utc::now();
    let span = match tbs {
        "qdr:h" => ChronoDuration::hours(1),
        "qdr:d" => ChronoDuration::days(1),
        "qdr:w" => ChronoDuration::weeks(1),
        "qdr:m" => ChronoDuration::days(30),
        "qdr:y" => ChronoDuration::days(365),
        _ => return None,
    };
    let start = now - span;
    Some(format!(
        "{} - {}",
        start.format("%Y-%m-%d %H:%M"),
        now.format("%Y-%m-%d %H:%M"),
    ))
}

/// What one execution pass produced.
#[derive(Debug, Default)]
pub struct SearchOutcome {
    /// Queries actually sent to the provider (after site biasing).
    pub searched_queries: Vec<String>,
    /// One side-info knowledge item per successful query.
    pub new_knowledge: Vec<KnowledgeItem>,
}

/// Dedup, execute, and rewrite search queries against the active provider.
pub struct QueryPipeline<'a> {
    pub generator: &'a ObjectGenerator,
    pub registry: &'a SchemaRegistry,
    pub provider: &'a dyn SearchProvider,
    pub step_sleep: Duration,
}

impl QueryPipeline<'_> {
    fn trackers(&self) -> &TrackerContext {
        self.generator.trackers()
    }

    /// Semantic dedup of `candidates` against `existing`, via the LLM with a
    /// deterministic case-insensitive fallback layered on top. The result
    /// never contains two entries that are equal after trim + lowercase, and
    /// never repeats an existing entry.
    pub async fn dedup(&self, candidates: &[String], existing: &[String]) -> Vec<String> {
        if candidates.is_empty() {
            return Vec::new();
        }

        let system = "You deduplicate search queries. Given a list of candidate queries and a \
            list of queries already tried, return only the candidates that would surface new \
            information: drop a candidate when it is a rewording, subset, or translation of an \
            already-tried query or of another candidate. Preserve the original wording of the \
            survivors.";
        let user = format!(
            "Candidate queries:\n{}\n\nAlready tried:\n{}",
            candidates.join("\n"),
            if existing.is_empty() {
                "(none)".to_string()
            } else {
                existing.join("\n")
            },
        );

        let survivors = match self
            .generator
            .generate_parsed::<DedupResult>(
                "dedup",
                self.registry.dedup_schema(),
                system,
                vec![Message::user(user)],
            )
            .await
        {
            Ok(result) => result.unique_queries,
            Err(e) => {
                warn!("query dedup failed, falling back to exact dedup: {e}");
                candidates.to_vec()
            }
        };

        trim_dedup(&survivors, existing)
    }

    /// Execute queries against the provider, feeding results into the URL
    /// pool and capturing snippet knowledge. With probability
    /// [`SITE_BIAS_PROBABILITY`], a query without a `site:` token is focused
    /// onto a hostname drawn from the pool's histogram.
    pub async fn execute(
        &self,
        queries: &[SerpQuery],
        pool: &mut UrlPool,
        rng: &mut StdRng,
    ) -> SearchOutcome {
        let keywords: Vec<&str> = queries.iter().map(|q| q.q.as_str()).collect();
        self.trackers()
            .track_think(format!("searching for: {}", keywords.join(", ")));

        let mut outcome = SearchOutcome::default();

        for query in queries {
            let mut query = query.clone();
            let original_q = query.q.clone();

            if !pool.is_empty()
                && !query.q.contains("site:")
                && rng.gen_bool(SITE_BIAS_PROBABILITY)
                && let Some(host) = pool.sample_hostname(rng)
            {
                query.q = format!("{} site:{host}", query.q);
            }

            let hits = match self.provider.search(&query).await {
                Ok(hits) if !hits.is_empty() => hits,
                Ok(_) => {
                    warn!("search returned no results for: {}", query.q);
                    tokio::time::sleep(self.step_sleep).await;
                    continue;
                }
                Err(e) => {
                    warn!("search failed for `{}`: {e}", query.q);
                    tokio::time::sleep(self.step_sleep).await;
                    continue;
                }
            };

            let mut descriptions = Vec::new();
            for hit in hits {
                let Some(url) = normalize_url(&hit.url) else {
                    continue;
                };
                descriptions.push(hit.description.clone());
                pool.insert(UrlSnippet {
                    title: hit.title,
                    url,
                    description: hit.description,
                    weight: 1,
                });
            }

            outcome.searched_queries.push(query.q.clone());
            let mut item = KnowledgeItem::new(
                format!("What do Internet say about \"{original_q}\"?"),
                strip_html(&descriptions.join("; ")),
                KnowledgeKind::SideInfo,
            );
            if let Some(range) = query.tbs.as_deref().and_then(format_date_range) {
                item.updated = Some(range);
            }
            outcome.new_knowledge.push(item);

            tokio::time::sleep(self.step_sleep).await;
        }

        outcome
    }

    /// Rewrite the step's raw requests into refined SERP queries, grounded on
    /// the snippet text collected so far. Falls back to the raw requests when
    /// the rewriter call fails.
    pub async fn rewrite(
        &self,
        requests: &[String],
        think: &str,
        sound_bites: &str,
    ) -> Vec<SerpQuery> {
        let system = "You are a search query optimizer. Rewrite the user's search requests into \
            sharper keyword queries, using the collected snippets as grounding for better \
            terminology. Queries must be orthogonal to each other; add tbs/gl/hl/location \
            refinements only when the request clearly calls for them.";
        let user = format!(
            "Intention: {think}\n\nSearch requests:\n{}\n\nCollected snippets:\n<sound-bites>\n{sound_bites}\n</sound-bites>",
            requests.join("\n"),
        );

        let mut queries = match self
            .generator
            .generate_parsed::<QueryRewrite>(
                "queryRewriter",
                self.registry.query_rewriter_schema(),
                system,
                vec![Message::user(user)],
            )
            .await
        {
            Ok(rewrite) => rewrite.queries,
            Err(e) => {
                warn!("query rewrite failed, reusing raw requests: {e}");
                requests.iter().map(SerpQuery::keyword).collect()
            }
        };
        queries.retain(|q| !q.q.trim().is_empty());
        queries.truncate(MAX_QUERIES_PER_STEP);
        queries
    }
}

/// Deterministic dedup: drop entries equal (after trim + lowercase) to an
/// existing entry or to an earlier survivor.
fn trim_dedup(candidates: &[String], existing: &[String]) -> Vec<String> {
    let mut seen: Vec<String> = existing
        .iter()
        .map(|e| e.trim().to_lowercase())
        .collect();
    let mut survivors = Vec::new();
    for candidate in candidates {
        let key = candidate.trim().to_lowercase();
        if key.is_empty() || seen.contains(&key) {
            continue;
        }
        seen.push(key);
        survivors.push(candidate.trim().to_string());
    }
    survivors
}
