//! URL pool: normalization, deduplication, weighting, ranking, and the
//! hostname histogram used for `site:` biasing.
//!
//! URLs are stored in an arena keyed by their normalized form; references
//! hold the key, not a pointer, and titles are resolved by lookup at render
//! time. Identity is defined by [`normalize_url`] — two raw URLs that
//! normalize identically are the same entry.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

// ── Normalization ──────────────────────────────────────────────────

/// Normalize a raw URL string, or `None` when it cannot be parsed as an
/// http(s) URL.
///
/// Lower-cases scheme and host, strips default ports and fragments, and
/// collapses duplicate slashes in the path. Idempotent:
/// `normalize_url(normalize_url(u)) == normalize_url(u)`.
pub fn normalize_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut parsed = Url::parse(raw).ok()?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return None;
    }
    parsed.set_fragment(None);

    let path = parsed.path().to_string();
    if path.contains("//") {
        let mut collapsed = path;
        while collapsed.contains("//") {
            collapsed = collapsed.replace("//", "/");
        }
        parsed.set_path(&collapsed);
    }

    // The url crate already lower-cases scheme/host and drops known default
    // ports during parsing.
    Some(parsed.to_string())
}

/// Hostname of a normalized URL.
pub fn hostname_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

// ── Snippets ───────────────────────────────────────────────────────

/// One URL with its search-result metadata and accumulated weight.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UrlSnippet {
    pub title: String,
    pub url: String,
    pub description: String,
    pub weight: u32,
}

impl UrlSnippet {
    pub fn new(
        title: impl Into<String>,
        url: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            description: description.into(),
            weight: 1,
        }
    }
}

// ── Pool ───────────────────────────────────────────────────────────

/// All URLs the session has seen, keyed by normalized URL.
#[derive(Default, Clone, Debug)]
pub struct UrlPool {
    entries: HashMap<String, UrlSnippet>,
}

impl UrlPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, normalized: &str) -> bool {
        self.entries.contains_key(normalized)
    }

    pub fn get(&self, normalized: &str) -> Option<&UrlSnippet> {
        self.entries.get(normalized)
    }

    /// Insert a snippet, normalizing its URL. A duplicate insert bumps the
    /// existing entry's weight and fills in missing metadata; weights never
    /// decrease. Returns the normalized key, or `None` for invalid URLs.
    pub fn insert(&mut self, snippet: UrlSnippet) -> Option<String> {
        let key = normalize_url(&snippet.url)?;
        match self.entries.get_mut(&key) {
            Some(existing) => {
                existing.weight += 1;
                if existing.title.is_empty() {
                    existing.title = snippet.title;
                }
                if existing.description.is_empty() {
                    existing.description = snippet.description;
                }
            }
            None => {
                self.entries.insert(
                    key.clone(),
                    UrlSnippet {
                        url: key.clone(),
                        weight: snippet.weight.max(1),
                        ..snippet
                    },
                );
            }
        }
        Some(key)
    }

    /// All snippets in unspecified order.
    pub fn snippets(&self) -> impl Iterator<Item = &UrlSnippet> {
        self.entries.values()
    }

    /// All snippets sorted by weight (descending), URL as the tiebreak.
    pub fn by_weight(&self) -> Vec<UrlSnippet> {
        let mut all: Vec<UrlSnippet> = self.entries.values().cloned().collect();
        all.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.url.cmp(&b.url)));
        all
    }

    /// Rank unvisited URLs by relevance to `question`.
    ///
    /// The score is the pool weight boosted by token overlap between the
    /// question and the snippet's title/description. Purely derived from
    /// current pool state, so re-ranking without new evidence reproduces the
    /// same order.
    pub fn rank<'a>(
        &self,
        question: &str,
        visited: impl IntoIterator<Item = &'a String>,
    ) -> Vec<UrlSnippet> {
        let visited: std::collections::HashSet<&str> =
            visited.into_iter().map(String::as_str).collect();
        let question_tokens = tokenize(question);

        let mut ranked: Vec<UrlSnippet> = self
            .entries
            .values()
            .filter(|s| !visited.contains(s.url.as_str()))
            .map(|s| {
                let text = format!("{} {}", s.title, s.description);
                let overlap = tokenize(&text)
                    .iter()
                    .filter(|t| question_tokens.contains(*t))
                    .count() as u32;
                UrlSnippet {
                    weight: s.weight + overlap,
                    ..s.clone()
                }
            })
            .collect();
        ranked.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.url.cmp(&b.url)));
        ranked
    }

    /// Hostname → entry count over the whole pool.
    pub fn hostname_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for snippet in self.entries.values() {
            if let Some(host) = hostname_of(&snippet.url) {
                *counts.entry(host).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Draw a hostname from the pool's histogram, weighted by frequency.
    pub fn sample_hostname(&self, rng: &mut impl Rng) -> Option<String> {
        let counts = self.hostname_counts();
        if counts.is_empty() {
            return None;
        }
        let mut hosts: Vec<(String, usize)> = counts.into_iter().collect();
        hosts.sort(); // deterministic draw order under a seeded RNG
        let total: usize = hosts.iter().map(|(_, c)| c).sum();
        let mut draw = rng.gen_range(0..total);
        for (host, count) in hosts {
            if draw < count {
                return Some(host);
            }
            draw -= count;
        }
        None
    }
}

/// Keep at most `k` URLs per hostname, preserving rank order within and
/// across hostnames.
pub fn keep_k_per_hostname(ranked: Vec<UrlSnippet>, k: usize) -> Vec<UrlSnippet> {
    let mut kept_per_host: HashMap<String, usize> = HashMap::new();
    ranked
        .into_iter()
        .filter(|snippet| match hostname_of(&snippet.url) {
            Some(host) => {
                let kept = kept_per_host.entry(host).or_insert(0);
                *kept += 1;
                *kept <= k
            }
            None => true,
        })
        .collect()
}

/// Render the top `limit` weighted URLs as the prompt's `<url-list>` body.
pub fn weighted_urls_to_string(urls: &[UrlSnippet], limit: usize) -> String {
    urls.iter()
        .take(limit)
        .map(|u| format!("{} ({})", u.url, u.weight))
        .collect::<Vec<_>>()
        .join("\n")
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn normalize_lowercases_and_strips() {
        assert_eq!(
            normalize_url("HTTPS://En.Wikipedia.ORG:443/wiki/Paris#History"),
            Some("https://en.wikipedia.org/wiki/Paris".to_string())
        );
    }

    #[test]
    fn normalize_collapses_duplicate_slashes() {
        assert_eq!(
            normalize_url("https://example.com/a//b///c"),
            Some("https://example.com/a/b/c".to_string())
        );
    }

    #[test]
    fn normalize_is_idempotent() {
        let raw = "HTTP://Example.COM:80//a//b#frag";
        let once = normalize_url(raw).unwrap();
        let twice = normalize_url(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_rejects_garbage() {
        assert!(normalize_url("not a url").is_none());
        assert!(normalize_url("mailto:a@b.c").is_none());
        assert!(normalize_url("").is_none());
    }

    #[test]
    fn duplicate_insert_keeps_one_entry_and_bumps_weight() {
        let mut pool = UrlPool::new();
        pool.insert(UrlSnippet::new("Paris", "https://example.com/paris", "the city"));
        pool.insert(UrlSnippet::new(
            "Paris again",
            "HTTPS://EXAMPLE.com/paris#top",
            "",
        ));
        assert_eq!(pool.len(), 1);
        let entry = pool.get("https://example.com/paris").unwrap();
        assert_eq!(entry.weight, 2);
        assert_eq!(entry.title, "Paris");
    }

    #[test]
    fn invalid_urls_are_dropped() {
        let mut pool = UrlPool::new();
        assert!(pool.insert(UrlSnippet::new("t", "javascript:alert(1)", "d")).is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn rank_boosts_question_overlap_and_skips_visited() {
        let mut pool = UrlPool::new();
        pool.insert(UrlSnippet::new(
            "Capital of France",
            "https://a.com/france",
            "Paris is the capital of France",
        ));
        pool.insert(UrlSnippet::new(
            "Weather",
            "https://b.com/weather",
            "tomorrow's forecast",
        ));
        pool.insert(UrlSnippet::new(
            "Old news",
            "https://c.com/old",
            "capital of France history",
        ));

        let visited = vec!["https://c.com/old".to_string()];
        let ranked = pool.rank("capital of France", &visited);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].url, "https://a.com/france");
        assert!(ranked[0].weight > ranked[1].weight);
    }

    #[test]
    fn rerank_is_stable_without_new_evidence() {
        let mut pool = UrlPool::new();
        for i in 0..6 {
            pool.insert(UrlSnippet::new(
                format!("t{i}"),
                format!("https://site{i}.com/page"),
                "rust agent loop",
            ));
        }
        let first = pool.rank("rust agent", std::iter::empty());
        let second = pool.rank("rust agent", std::iter::empty());
        assert_eq!(first, second);
    }

    #[test]
    fn keep_k_per_hostname_caps_and_preserves_order() {
        let ranked = vec![
            UrlSnippet::new("1", "https://a.com/1", ""),
            UrlSnippet::new("2", "https://a.com/2", ""),
            UrlSnippet::new("3", "https://a.com/3", ""),
            UrlSnippet::new("4", "https://b.com/1", ""),
        ];
        let capped = keep_k_per_hostname(ranked, 2);
        let urls: Vec<&str> = capped.iter().map(|s| s.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["https://a.com/1", "https://a.com/2", "https://b.com/1"]
        );
    }

    #[test]
    fn hostname_histogram_counts_entries() {
        let mut pool = UrlPool::new();
        pool.insert(UrlSnippet::new("", "https://a.com/1", ""));
        pool.insert(UrlSnippet::new("", "https://a.com/2", ""));
        pool.insert(UrlSnippet::new("", "https://b.com/1", ""));
        let counts = pool.hostname_counts();
        assert_eq!(counts["a.com"], 2);
        assert_eq!(counts["b.com"], 1);
    }

    #[test]
    fn multinomial_sampling_favors_frequent_hosts() {
        let mut pool = UrlPool::new();
        for i in 0..10 {
            pool.insert(UrlSnippet::new("", format!("https://a.com/{i}"), ""));
        }
        pool.insert(UrlSnippet::new("", "https://b.com/only", ""));

        let mut rng = StdRng::seed_from_u64(42);
        let mut a_hits = 0;
        let draws = 2000;
        for _ in 0..draws {
            if pool.sample_hostname(&mut rng).as_deref() == Some("a.com") {
                a_hits += 1;
            }
        }
        // Expected ratio 10/11 ≈ 0.909.
        let ratio = f64::from(a_hits) / f64::from(draws);
        assert!((0.87..0.95).contains(&ratio), "ratio was {ratio}");
    }

    #[test]
    fn weighted_to_string_takes_top_entries() {
        let urls = vec![
            UrlSnippet {
                title: String::new(),
                url: "https://a.com/".into(),
                description: String::new(),
                weight: 5,
            },
            UrlSnippet {
                title: String::new(),
                url: "https://b.com/".into(),
                description: String::new(),
                weight: 2,
            },
        ];
        let rendered = weighted_urls_to_string(&urls, 1);
        assert_eq!(rendered, "https://a.com/ (5)");
    }
}
