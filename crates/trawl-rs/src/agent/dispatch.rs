//! Action handlers: one per step-action variant, each folding its outcome
//! back into the [`AgentState`] and narrowing the gate vector for the next
//! step.
//!
//! Handlers never fail the loop. Provider outages, unreadable pages, and
//! sandbox errors become diary entries that steer the next step instead.

use super::state::AgentState;
use crate::actions::{KnowledgeItem, KnowledgeKind, Reference, SerpQuery};
use crate::fetch::UrlFetcher;
use crate::llm::ObjectGenerator;
use crate::sandbox::{CodeSandbox, SandboxContext};
use crate::schema::SchemaRegistry;
use crate::search::SearchProvider;
use crate::search::pipeline::QueryPipeline;
use crate::urls::{UrlSnippet, normalize_url};
use crate::{MAX_QUERIES_PER_STEP, MAX_REFLECT_PER_STEP, MAX_URLS_PER_STEP, push_unique};
use chrono::Utc;
use futures::future::join_all;
use rand::rngs::StdRng;
use serde_json::json;
use std::time::Duration;
use tracing::warn;

/// The injected collaborators every handler may need.
pub struct Collaborators<'a> {
    pub generator: &'a ObjectGenerator,
    pub registry: &'a SchemaRegistry,
    pub search: &'a dyn SearchProvider,
    pub fetcher: &'a dyn UrlFetcher,
    pub sandbox: &'a dyn CodeSandbox,
    pub step_sleep: Duration,
}

impl<'a> Collaborators<'a> {
    fn pipeline(&self) -> QueryPipeline<'a> {
        QueryPipeline {
            generator: self.generator,
            registry: self.registry,
            provider: self.search,
            step_sleep: self.step_sleep,
        }
    }
}

fn now_full() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

// ── References ─────────────────────────────────────────────────────

/// Enrich an answer's references: normalize URLs (dropping unusable ones),
/// resolve titles from the URL pool, register cited URLs the pool has never
/// seen, and fill missing datetimes via the fetcher.
pub async fn update_references(
    references: &mut Vec<Reference>,
    state: &mut AgentState,
    fetcher: &dyn UrlFetcher,
) {
    let mut enriched = Vec::with_capacity(references.len());
    for reference in references.drain(..) {
        let Some(url) = normalize_url(&reference.url) else {
            continue;
        };
        if !state.url_pool.contains(&url) {
            state.url_pool.insert(UrlSnippet::new("", url.clone(), ""));
        }
        let title = state
            .url_pool
            .get(&url)
            .map(|s| s.title.clone())
            .unwrap_or_default();
        enriched.push(Reference {
            title,
            url,
            ..reference
        });
    }

    for reference in &mut enriched {
        if reference.date_time.is_empty() {
            reference.date_time = match fetcher.last_modified(&reference.url).await {
                Ok(Some(datetime)) => datetime,
                Ok(None) => String::new(),
                Err(e) => {
                    warn!("last-modified probe failed for {}: {e}", reference.url);
                    String::new()
                }
            };
        }
    }

    *references = enriched;
}

// ── Visit ──────────────────────────────────────────────────────────

/// Fetch a batch of URLs concurrently, recording page knowledge and marking
/// the successful ones visited. Returns the URLs that were actually read.
pub async fn process_urls(
    urls: &[String],
    state: &mut AgentState,
    co: &Collaborators<'_>,
) -> Vec<String> {
    let fetches = join_all(urls.iter().map(|url| co.fetcher.read(url))).await;

    let mut read = Vec::new();
    for (url, fetched) in urls.iter().zip(fetches) {
        let page = match fetched {
            Ok(page) if !page.content.is_empty() => page,
            Ok(_) => {
                warn!("empty content for {url}");
                continue;
            }
            Err(e) => {
                warn!("failed to read {url}: {e}");
                continue;
            }
        };

        state.url_pool.insert(UrlSnippet::new(
            page.title.clone(),
            url.clone(),
            String::new(),
        ));
        let mut item = KnowledgeItem::new(
            format!("What is in {url}?"),
            page.content,
            KnowledgeKind::Url,
        )
        .with_references(vec![Reference {
            url: url.clone(),
            title: page.title,
            ..Default::default()
        }]);
        if let Some(last_modified) = page.last_modified {
            item.updated = Some(last_modified);
        }
        state.knowledge.push(item);
        state.visited.insert(url.clone());
        read.push(url.clone());
    }
    read
}

/// Handle a visit action: normalize and dedup the targets, top the batch up
/// with the highest-weighted candidates, and fetch.
pub async fn handle_visit(
    state: &mut AgentState,
    co: &Collaborators<'_>,
    step: crate::actions::AgentStep,
    targets: &[String],
) {
    let mut batch: Vec<String> = Vec::new();
    for target in targets {
        if let Some(url) = normalize_url(target)
            && !state.visited.contains(&url)
            && !batch.contains(&url)
        {
            batch.push(url);
        }
    }
    for candidate in &state.weighted {
        if batch.len() >= MAX_URLS_PER_STEP {
            break;
        }
        if !batch.contains(&candidate.url) && !state.visited.contains(&candidate.url) {
            batch.push(candidate.url.clone());
        }
    }
    batch.truncate(MAX_URLS_PER_STEP);

    if batch.is_empty() {
        state.diary.push(format!(
            "At step {}, you took the **visit** action. But then you realized you have already \
             visited these URLs and you already know very well about their contents.\n\
             You decided to think out of the box or cut from a completely different angle.",
            state.step,
        ));
        state.push_context(
            None,
            step,
            Some(json!(
                "You have visited all possible URLs and found no new information. \
                 You must think out of the box or different angle!!!"
            )),
        );
    } else {
        let read = process_urls(&batch, state, co).await;
        if read.is_empty() {
            state.diary.push(format!(
                "At step {}, you took the **visit** action and try to visit some URLs but failed \
                 to read the content. You need to think out of the box or cut from a completely \
                 different angle.",
                state.step,
            ));
            state.push_context(
                None,
                step,
                Some(json!(
                    "You have tried all possible URLs and found no new information. \
                     You must think out of the box or different angle!!!"
                )),
            );
        } else {
            state.diary.push(format!(
                "At step {}, you took the **visit** action and deep dive into the following URLs:\n\
                 {}\n\
                 You found some useful information on the web and add them to your knowledge \
                 for future reference.",
                state.step,
                read.join("\n"),
            ));
            let question = state.gaps.first().cloned();
            state.push_context(question, step, Some(json!(read)));
        }
    }

    state.gates.visit = false;
}

// ── Search ─────────────────────────────────────────────────────────

/// Handle a search action: dedup, execute, rewrite with snippet grounding,
/// dedup against all prior keywords, and execute the refined pass.
pub async fn handle_search(
    state: &mut AgentState,
    co: &Collaborators<'_>,
    rng: &mut StdRng,
    step: crate::actions::AgentStep,
    requests: &[String],
    current_question: &str,
) {
    let pipeline = co.pipeline();

    let mut requests = pipeline.dedup(requests, &[]).await;
    requests.truncate(MAX_QUERIES_PER_STEP);

    let first_pass: Vec<SerpQuery> = requests.iter().map(SerpQuery::keyword).collect();
    let outcome = pipeline.execute(&first_pass, &mut state.url_pool, rng).await;
    for query in &outcome.searched_queries {
        push_unique(&mut state.all_keywords, query.clone());
    }
    let sound_bites: String = outcome
        .new_knowledge
        .iter()
        .map(|k| k.answer.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    state.knowledge.extend(outcome.new_knowledge);

    let rewritten = pipeline.rewrite(&requests, &step.think, &sound_bites).await;
    let q_only: Vec<String> = rewritten.iter().map(|q| q.q.clone()).collect();
    let mut unique_q = pipeline.dedup(&q_only, &state.all_keywords).await;
    unique_q.truncate(MAX_QUERIES_PER_STEP);
    let refined: Vec<SerpQuery> = rewritten
        .into_iter()
        .filter(|q| unique_q.contains(&q.q))
        .collect();

    let mut any_result = false;
    let refined_keywords: Vec<String> = refined.iter().map(|q| q.q.clone()).collect();
    if !refined.is_empty() {
        let outcome = pipeline.execute(&refined, &mut state.url_pool, rng).await;
        any_result = !outcome.searched_queries.is_empty();
        for query in &outcome.searched_queries {
            push_unique(&mut state.all_keywords, query.clone());
        }
        state.knowledge.extend(outcome.new_knowledge);
    }

    if any_result {
        state.diary.push(format!(
            "At step {}, you took the **search** action and look for external information for \
             the question: \"{current_question}\".\n\
             In particular, you tried to search for the following keywords: \"{}\".\n\
             You found quite some information and add them to your URL list and **visit** them \
             later when needed.",
            state.step,
            refined_keywords.join(", "),
        ));
        state.push_context(
            Some(current_question.to_string()),
            step,
            Some(json!({"searchedQueries": refined_keywords})),
        );
    } else {
        state.diary.push(format!(
            "At step {}, you took the **search** action and look for external information for \
             the question: \"{current_question}\".\n\
             In particular, you tried to search for the following keywords: \"{}\".\n\
             But then you realized you have already searched for these keywords before, no new \
             information is returned.\n\
             You decided to think out of the box or cut from a completely different angle.",
            state.step,
            refined_keywords.join(", "),
        ));
        state.push_context(
            None,
            step,
            Some(json!(
                "You have tried all possible queries and found no new information. \
                 You must think out of the box or different angle!!!"
            )),
        );
    }

    state.gates.search = false;
}

// ── Reflect ────────────────────────────────────────────────────────

/// Handle a reflect action: dedup candidate sub-questions against everything
/// ever asked, keep at most two, and append survivors to the gap queue.
pub async fn handle_reflect(
    state: &mut AgentState,
    co: &Collaborators<'_>,
    step: crate::actions::AgentStep,
    questions: &[String],
    current_question: &str,
) {
    let pipeline = co.pipeline();
    let mut new_gaps = pipeline.dedup(questions, &state.all_questions).await;
    new_gaps.truncate(MAX_REFLECT_PER_STEP);

    if new_gaps.is_empty() {
        state.diary.push(format!(
            "At step {}, you took **reflect** and think about the knowledge gaps. You tried to \
             break down the question \"{current_question}\" into gap-questions like this: {} \n\
             But then you realized you have asked them before. You decided to to think out of \
             the box or cut from a completely different angle.",
            state.step,
            questions.join(", "),
        ));
        state.push_context(
            None,
            step,
            Some(json!(
                "You have tried all possible questions and found no useful information. \
                 You must think out of the box or different angle!!!"
            )),
        );
    } else {
        state.diary.push(format!(
            "At step {}, you took **reflect** and think about the knowledge gaps. You found \
             some sub-questions are important to the question: \"{current_question}\"\n\
             You realize you need to know the answers to the following sub-questions:\n\
             {}\n\n\
             You will now figure out the answers to these sub-questions and see if they can \
             help you find the answer to the original question.",
            state.step,
            new_gaps
                .iter()
                .map(|q| format!("- {q}"))
                .collect::<Vec<_>>()
                .join("\n"),
        ));
        for question in &new_gaps {
            state.gaps.push(question.clone());
            push_unique(&mut state.all_questions, question.clone());
        }
        state.push_context(None, step, None);
    }

    state.gates.reflect = false;
}

// ── Coding ─────────────────────────────────────────────────────────

/// Handle a coding action: delegate the issue to the sandbox and record the
/// solution (or the setback) in knowledge and diary.
pub async fn handle_coding(
    state: &mut AgentState,
    co: &Collaborators<'_>,
    step: crate::actions::AgentStep,
    issue: &str,
) {
    let context = SandboxContext {
        all_context: serde_json::to_value(&state.context_log).unwrap_or_default(),
        visited_urls: state.visited.iter().cloned().collect(),
        all_urls: state.url_pool.by_weight(),
        all_knowledge: state.knowledge.clone(),
    };

    match co.sandbox.solve(issue, &context).await {
        Ok(solution) => {
            state.knowledge.push(
                KnowledgeItem::new(
                    format!("What is the solution to the coding issue: {issue}?"),
                    solution.output.clone(),
                    KnowledgeKind::Coding,
                )
                .with_source_code(solution.code.clone())
                .with_updated(now_full()),
            );
            state.diary.push(format!(
                "At step {}, you took the **coding** action and try to solve the coding issue: \
                 {issue}.\n\
                 You found the solution and add it to your knowledge for future reference.",
                state.step,
            ));
            state.push_context(
                None,
                step,
                Some(json!({"output": solution.output, "code": solution.code})),
            );
        }
        Err(e) => {
            warn!("sandbox failed for issue `{issue}`: {e}");
            state.diary.push(format!(
                "At step {}, you took the **coding** action and try to solve the coding issue: \
                 {issue}.\n\
                 But unfortunately, you failed to solve the issue. You need to think out of the \
                 box or cut from a completely different angle.",
                state.step,
            ));
            state.push_context(
                None,
                step,
                Some(json!(
                    "You have tried all possible solutions and found no new information. \
                     You must think out of the box or different angle!!!"
                )),
            );
        }
    }

    state.gates.coding = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{AgentStep, StepAction};
    use crate::fetch::{FetchFuture, PageContent};
    use crate::llm::{GenerateRequest, GenerateResult, LlmClient, LlmFuture};
    use crate::sandbox::{SandboxFuture, SandboxSolution, UnconfiguredSandbox};
    use crate::search::{SearchFuture, SearchHit};
    use crate::trackers::{TokenUsage, TrackerContext};
    use rand::SeedableRng;
    use serde_json::json;
    use std::sync::Arc;

    /// Dedup approves everything; every other tool echoes an empty object.
    struct PermissiveLlm;
    impl LlmClient for PermissiveLlm {
        fn generate_object(&self, request: GenerateRequest) -> LlmFuture<'_> {
            let object = match request.tool.as_str() {
                "dedup" => {
                    let queries: Vec<String> = request
                        .messages
                        .first()
                        .map(|m| {
                            m.content
                                .lines()
                                .skip(1)
                                .take_while(|l| !l.is_empty())
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default();
                    json!({"think": "", "unique_queries": queries})
                }
                "queryRewriter" => json!({"think": "", "queries": []}),
                _ => json!({}),
            };
            Box::pin(async move {
                Ok(GenerateResult {
                    object,
                    usage: TokenUsage::new(1, 1),
                })
            })
        }
    }

    struct StaticSearch(Vec<SearchHit>);
    impl SearchProvider for StaticSearch {
        fn search(&self, _query: &SerpQuery) -> SearchFuture<'_> {
            let hits = self.0.clone();
            Box::pin(async move { Ok(hits) })
        }
    }

    struct StaticFetcher {
        content: String,
    }
    impl UrlFetcher for StaticFetcher {
        fn read(&self, url: &str) -> FetchFuture<'_, PageContent> {
            let content = self.content.clone();
            let title = format!("page at {url}");
            Box::pin(async move {
                if content.is_empty() {
                    Err("reader HTTP 404".to_string())
                } else {
                    Ok(PageContent {
                        title,
                        content,
                        last_modified: Some("2024-06-01".to_string()),
                    })
                }
            })
        }

        fn last_modified(&self, _url: &str) -> FetchFuture<'_, Option<String>> {
            Box::pin(async { Ok(Some("2024-06-01".to_string())) })
        }
    }

    struct EchoSandbox;
    impl CodeSandbox for EchoSandbox {
        fn solve(&self, issue: &str, _ctx: &SandboxContext) -> SandboxFuture<'_, SandboxSolution> {
            let issue = issue.to_string();
            Box::pin(async move {
                Ok(SandboxSolution {
                    output: format!("solved: {issue}"),
                    code: "return 42".to_string(),
                })
            })
        }
    }

    fn step(action: StepAction) -> AgentStep {
        AgentStep {
            think: "t".into(),
            action,
        }
    }

    struct Fixture {
        generator: ObjectGenerator,
        registry: SchemaRegistry,
        search: StaticSearch,
        fetcher: StaticFetcher,
        sandbox: EchoSandbox,
    }

    impl Fixture {
        fn new(hits: Vec<SearchHit>, content: &str) -> Self {
            Self {
                generator: ObjectGenerator::new(
                    Arc::new(PermissiveLlm),
                    TrackerContext::new(1_000_000),
                ),
                registry: SchemaRegistry::new(),
                search: StaticSearch(hits),
                fetcher: StaticFetcher {
                    content: content.to_string(),
                },
                sandbox: EchoSandbox,
            }
        }

        fn collaborators(&self) -> Collaborators<'_> {
            Collaborators {
                generator: &self.generator,
                registry: &self.registry,
                search: &self.search,
                fetcher: &self.fetcher,
                sandbox: &self.sandbox,
                step_sleep: Duration::from_millis(0),
            }
        }
    }

    #[tokio::test]
    async fn visit_records_knowledge_and_marks_visited() {
        let fixture = Fixture::new(vec![], "page body text");
        let co = fixture.collaborators();
        let mut state = AgentState::new("q");
        state.step = 1;

        handle_visit(
            &mut state,
            &co,
            step(StepAction::Visit {
                url_targets: vec!["https://a.com/page".into()],
            }),
            &["https://a.com/page".to_string()],
        )
        .await;

        assert!(state.visited.contains("https://a.com/page"));
        assert_eq!(state.knowledge.len(), 1);
        assert_eq!(state.knowledge[0].kind, KnowledgeKind::Url);
        assert_eq!(state.knowledge[0].updated.as_deref(), Some("2024-06-01"));
        assert!(!state.gates.visit);
        // VisitedSet stays a subset of the pool.
        assert!(state.url_pool.contains("https://a.com/page"));
    }

    #[tokio::test]
    async fn visit_tops_up_batch_from_weighted_candidates() {
        let fixture = Fixture::new(vec![], "body");
        let co = fixture.collaborators();
        let mut state = AgentState::new("q");
        state.weighted = vec![
            UrlSnippet::new("", "https://w1.com/", ""),
            UrlSnippet::new("", "https://w2.com/", ""),
        ];

        handle_visit(
            &mut state,
            &co,
            step(StepAction::Visit { url_targets: vec![] }),
            &["https://t.com/x".to_string()],
        )
        .await;

        assert!(state.visited.contains("https://t.com/x"));
        assert!(state.visited.contains("https://w1.com/"));
        assert!(state.visited.contains("https://w2.com/"));
    }

    #[tokio::test]
    async fn visit_with_all_targets_visited_writes_setback_diary() {
        let fixture = Fixture::new(vec![], "body");
        let co = fixture.collaborators();
        let mut state = AgentState::new("q");
        state.visited.insert("https://a.com/".to_string());
        state.step = 2;

        handle_visit(
            &mut state,
            &co,
            step(StepAction::Visit { url_targets: vec![] }),
            &["https://a.com/".to_string()],
        )
        .await;

        assert_eq!(state.knowledge.len(), 0);
        assert!(state.diary[0].contains("already visited"));
    }

    #[tokio::test]
    async fn search_fills_keywords_knowledge_and_pool() {
        let fixture = Fixture::new(
            vec![SearchHit {
                title: "Paris".into(),
                url: "https://en.wikipedia.org/wiki/Paris".into(),
                description: "capital of France".into(),
            }],
            "",
        );
        let co = fixture.collaborators();
        let mut state = AgentState::new("capital of France");
        state.step = 1;
        let mut rng = StdRng::seed_from_u64(1);

        handle_search(
            &mut state,
            &co,
            &mut rng,
            step(StepAction::Search {
                search_requests: vec!["capital of France".into()],
            }),
            &["capital of France".to_string()],
            "capital of France",
        )
        .await;

        assert!(!state.all_keywords.is_empty());
        assert!(state.knowledge.iter().any(|k| k.kind == KnowledgeKind::SideInfo));
        assert!(state.url_pool.contains("https://en.wikipedia.org/wiki/Paris"));
        assert!(!state.gates.search);
    }

    #[tokio::test]
    async fn reflect_appends_new_gaps_and_dedups() {
        let fixture = Fixture::new(vec![], "");
        let co = fixture.collaborators();
        let mut state = AgentState::new("compare X and Y");
        state.step = 1;

        handle_reflect(
            &mut state,
            &co,
            step(StepAction::Reflect {
                questions_to_answer: vec!["what is X?".into(), "compare X and Y".into()],
            }),
            &["what is X?".to_string(), "compare X and Y".to_string()],
            "compare X and Y",
        )
        .await;

        // The original question is a known question; only the new one lands.
        assert_eq!(state.gaps, vec!["compare X and Y", "what is X?"]);
        assert!(state.all_questions.contains(&"what is X?".to_string()));
        assert!(!state.gates.reflect);
    }

    #[tokio::test]
    async fn coding_success_records_solution_with_source() {
        let fixture = Fixture::new(vec![], "");
        let co = fixture.collaborators();
        let mut state = AgentState::new("q");
        state.step = 3;

        handle_coding(
            &mut state,
            &co,
            step(StepAction::Coding {
                coding_issue: "count the items".into(),
            }),
            "count the items",
        )
        .await;

        assert_eq!(state.knowledge.len(), 1);
        let item = &state.knowledge[0];
        assert_eq!(item.kind, KnowledgeKind::Coding);
        assert_eq!(item.answer, "solved: count the items");
        assert_eq!(item.source_code.as_deref(), Some("return 42"));
        assert!(!state.gates.coding);
    }

    #[tokio::test]
    async fn coding_failure_degrades_to_diary_entry() {
        let fixture = Fixture::new(vec![], "");
        let sandbox = UnconfiguredSandbox;
        let mut co = fixture.collaborators();
        co.sandbox = &sandbox;
        let mut state = AgentState::new("q");

        handle_coding(
            &mut state,
            &co,
            step(StepAction::Coding {
                coding_issue: "impossible".into(),
            }),
            "impossible",
        )
        .await;

        assert!(state.knowledge.is_empty());
        assert!(state.diary[0].contains("failed to solve"));
        assert!(!state.gates.coding);
    }

    #[tokio::test]
    async fn update_references_normalizes_and_enriches() {
        let fixture = Fixture::new(vec![], "");
        let co = fixture.collaborators();
        let mut state = AgentState::new("q");
        state.url_pool.insert(UrlSnippet::new(
            "Paris - Wikipedia",
            "https://en.wikipedia.org/wiki/Paris",
            "",
        ));

        let mut references = vec![
            Reference {
                exact_quote: "Paris is the capital".into(),
                url: "HTTPS://EN.WIKIPEDIA.ORG/wiki/Paris#intro".into(),
                ..Default::default()
            },
            Reference {
                exact_quote: "bogus".into(),
                url: "not a url".into(),
                ..Default::default()
            },
        ];
        update_references(&mut references, &mut state, co.fetcher).await;

        assert_eq!(references.len(), 1);
        assert_eq!(references[0].url, "https://en.wikipedia.org/wiki/Paris");
        assert_eq!(references[0].title, "Paris - Wikipedia");
        assert_eq!(references[0].date_time, "2024-06-01");
    }

    #[tokio::test]
    async fn update_references_registers_unknown_urls_in_pool() {
        let fixture = Fixture::new(vec![], "");
        let co = fixture.collaborators();
        let mut state = AgentState::new("q");

        let mut references = vec![Reference {
            url: "https://fresh.example/cite".into(),
            ..Default::default()
        }];
        update_references(&mut references, &mut state, co.fetcher).await;

        assert!(state.url_pool.contains("https://fresh.example/cite"));
    }
}
