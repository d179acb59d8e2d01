//! Deep-research agent: a budgeted search/read/reflect/answer loop.
//!
//! `trawl-rs` runs an autonomous research session over a single question.
//! The core abstraction is the [`Researcher`](agent::researcher::Researcher) —
//! a state machine that picks exactly one action per step (search, visit,
//! reflect, coding, or answer), folds the result back into an evolving
//! knowledge base, URL pool, and reasoning diary, and keeps iterating until an
//! evaluator accepts an answer or the token/attempt budget runs dry. When the
//! budget expires without an accepted answer, a forced terminal "beast mode"
//! step produces one anyway.
//!
//! # Getting started
//!
//! ```ignore
//! use trawl_rs::agent::researcher::{Researcher, ResearcherOptions};
//! use trawl_rs::config::Settings;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), String> {
//!     let settings = Settings::load(None)?;
//!     let researcher = Researcher::from_settings(&settings)?;
//!
//!     let outcome = researcher
//!         .run("what is the tallest building completed in 2024?", ResearcherOptions::default())
//!         .await?;
//!
//!     println!("{}", outcome.md_answer());
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **The control loop:** [`agent::researcher`] — step scheduling, gating,
//!   evaluation branching, fail-reset, beast mode.
//! - **Action handling:** [`agent::dispatch`] — one handler per action
//!   variant, each mutating the shared [`agent::state::AgentState`].
//! - **Structured output:** [`schema::SchemaRegistry`] emits per-step JSON
//!   schemas gated by the allowed action set; [`llm::ObjectGenerator`]
//!   validates every model response against the schema it was prompted with.
//! - **Search:** [`search`] — the [`SearchProvider`](search::SearchProvider)
//!   trait, four provider clients, and the query pipeline (dedup, rewrite,
//!   site biasing, snippet capture).
//! - **URL management:** [`urls::UrlPool`] — normalization, weighting,
//!   ranking, per-hostname caps.
//! - **Quality control:** [`evaluate`] (metric-driven answer evaluation) and
//!   [`analyze`] (post-failure diary analysis).
//! - **Observability:** [`trackers`] — token and action trackers with a
//!   synchronous observer interface.
//!
//! # Design principles
//!
//! 1. **One action per step.** The model is never offered more than the
//!    currently allowed action set, and its output is parsed by the same
//!    builder that produced the schema, so the two cannot drift.
//!
//! 2. **Every external call may fail.** Search outages, fetch timeouts, and
//!    sandbox errors degrade to an empty result for that sub-task; the loop
//!    records the setback in the diary and keeps going.
//!
//! 3. **Budgets are authoritative.** The loop stops at 90% of the token
//!    budget or after `max_bad_attempts` rejected answers, whichever comes
//!    first, and beast mode guarantees a terminal answer either way.
//!
//! 4. **Determinism is injectable.** RNG, the LLM, search, fetch, and the
//!    sandbox are the only nondeterminism sources, and all five are
//!    injected — test runs are fully scripted.

pub mod actions;
pub mod agent;
pub mod analyze;
pub mod artifacts;
pub mod config;
pub mod evaluate;
pub mod fetch;
pub mod llm;
pub mod prompt;
pub mod sandbox;
pub mod schema;
pub mod search;
pub mod trackers;
pub mod urls;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// Re-export schemars for downstream crates.
pub use schemars;

// ── Constants ──────────────────────────────────────────────────────

/// Maximum URLs fetched by a single visit action.
pub const MAX_URLS_PER_STEP: usize = 4;

/// Maximum search requests executed per search action.
pub const MAX_QUERIES_PER_STEP: usize = 7;

/// Maximum sub-questions kept from a single reflect action.
pub const MAX_REFLECT_PER_STEP: usize = 2;

/// How many weighted URLs the visit action block lists in the system prompt.
pub const MAX_URLS_IN_PROMPT: usize = 20;

/// Per-hostname cap applied to the ranked URL candidate list.
pub const MAX_URLS_PER_HOSTNAME: usize = 2;

/// Probability of appending a `site:` restriction to a fresh search query.
pub const SITE_BIAS_PROBABILITY: f64 = 0.2;

/// Fraction of the token budget available to the regular loop; the remainder
/// is reserved for beast mode.
pub const REGULAR_BUDGET_FACTOR: f64 = 0.9;

/// Consecutive strict-evaluator failures tolerated before `strict` is dropped
/// from the original question's metric list.
pub const MAX_STRICT_EVALS: u32 = 2;

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`. This is the bridge between strong Rust types and
/// the `serde_json::Value` schemas handed to the LLM client.
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A message in the conversation passed to the LLM.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

// ── Small helpers ──────────────────────────────────────────────────

/// Push `value` onto `log` unless a case-insensitively identical entry is
/// already present. Keeps the append-only dedup logs (AllKeywords,
/// AllQuestions) free of duplicates regardless of what the LLM returns.
pub fn push_unique(log: &mut Vec<String>, value: impl Into<String>) -> bool {
    let value = value.into();
    let needle = value.trim().to_lowercase();
    if needle.is_empty() {
        return false;
    }
    if log.iter().any(|e| e.trim().to_lowercase() == needle) {
        return false;
    }
    log.push(value);
    true
}
