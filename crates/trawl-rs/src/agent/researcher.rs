//! The research loop: a budgeted state machine over search, visit, reflect,
//! coding, and answer actions.
//!
//! One iteration = one step: pick the current question round-robin from the
//! gap queue, compose the gated prompt and schema, ask the model for exactly
//! one action, dispatch it, and fold the result back into the session state.
//! Answers to the original question go through the evaluator chain; rejected
//! ones trigger error analysis and a fail-reset. When the token budget hits
//! 90% or the attempt budget runs out, a forced beast-mode step produces a
//! terminal answer.
//!
//! Cancellation is the caller's: dropping the `run()` future aborts any
//! outstanding I/O, and the session simply never completes.

use super::dispatch::{
    Collaborators, handle_coding, handle_reflect, handle_search, handle_visit, process_urls,
    update_references,
};
use super::state::{AgentState, GateVector};
use crate::actions::{AgentStep, KnowledgeItem, KnowledgeKind, Reference, StepAction};
use crate::analyze::analyze_steps;
use crate::artifacts::ArtifactWriter;
use crate::config::Settings;
use crate::evaluate::{EvaluationKind, EvaluationVerdict, Evaluator};
use crate::fetch::{JinaReader, UrlFetcher};
use crate::llm::{ChatCompletionsClient, LlmClient, ObjectGenerator};
use crate::prompt::{PromptInputs, compose_msgs, compose_system_prompt};
use crate::sandbox::{CodeSandbox, UnconfiguredSandbox};
use crate::schema::{LanguageVerdict, SchemaRegistry};
use crate::search::SearchProvider;
use crate::search::providers::build_provider;
use crate::trackers::TrackerContext;
use crate::urls::{UrlSnippet, keep_k_per_hostname};
use crate::{MAX_REFLECT_PER_STEP, Message, MessageRole, REGULAR_BUDGET_FACTOR};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

// ── Options ────────────────────────────────────────────────────────

/// Per-run knobs for [`Researcher::run`].
#[derive(Clone, Default)]
pub struct ResearcherOptions {
    /// Total token budget; the loop stops at 90% and beast mode uses the
    /// rest. Default 1,000,000.
    pub token_budget: Option<u64>,
    /// Rejected original-question answers tolerated before beast mode.
    /// Default 3.
    pub max_bad_attempts: Option<u32>,
    /// How many top-weighted URLs the outcome reports. Default 100.
    pub num_returned_urls: Option<usize>,
    /// Forbid the step-1 direct-answer shortcut.
    pub no_direct_answer: bool,
    /// Prior conversation. When set, system messages are stripped and the
    /// last user message becomes the question.
    pub messages: Option<Vec<Message>>,
    /// Trackers carried over from a previous session.
    pub existing_trackers: Option<TrackerContext>,
    /// RNG seed for deterministic runs.
    pub seed: Option<u64>,
    /// Directory for per-step debug artifacts.
    pub artifacts_dir: Option<PathBuf>,
}

impl ResearcherOptions {
    pub fn token_budget(&self) -> u64 {
        self.token_budget.unwrap_or(1_000_000)
    }

    pub fn max_bad_attempts(&self) -> u32 {
        self.max_bad_attempts.unwrap_or(3)
    }

    pub fn num_returned_urls(&self) -> usize {
        self.num_returned_urls.unwrap_or(100)
    }
}

// ── Outcome ────────────────────────────────────────────────────────

/// Everything a finished session hands back to the caller.
pub struct ResearchOutcome {
    /// The terminal step. `isFinal` is true on an accepted (or beast-mode)
    /// answer; false when even beast mode could not produce one.
    pub result: AgentStep,
    /// The trackers, reusable for a follow-up session.
    pub trackers: TrackerContext,
    /// Top-weighted URLs, capped at `num_returned_urls`.
    pub visited_urls: Vec<String>,
    /// URLs whose content was actually fetched.
    pub read_urls: Vec<String>,
    /// The whole URL pool, weight-ordered.
    pub all_urls: Vec<UrlSnippet>,
    pub knowledge: Vec<KnowledgeItem>,
    pub diary: Vec<String>,
}

impl ResearchOutcome {
    /// The rendered markdown answer, or the bare answer text when no
    /// references exist.
    pub fn md_answer(&self) -> String {
        match &self.result.action {
            StepAction::Answer {
                md_answer: Some(md),
                ..
            } => md.clone(),
            StepAction::Answer { answer, .. } => answer.clone(),
            _ => String::new(),
        }
    }
}

/// Render an answer with its references as markdown footnotes, in reference
/// order.
pub fn render_md_answer(answer: &str, references: &[Reference]) -> String {
    if references.is_empty() {
        return answer.to_string();
    }
    let mut out = String::from(answer);
    out.push_str("\n\n");
    for (idx, reference) in references.iter().enumerate() {
        let label = if reference.title.is_empty() {
            reference.url.clone()
        } else {
            reference.title.clone()
        };
        out.push_str(&format!(
            "[^{}]: \"{}\" [{}]({})",
            idx + 1,
            reference.exact_quote,
            label,
            reference.url,
        ));
        if !reference.date_time.is_empty() {
            out.push_str(&format!(" ({})", reference.date_time));
        }
        out.push('\n');
    }
    out
}

// ── Researcher ─────────────────────────────────────────────────────

/// The deep-research agent. Holds the collaborators; each [`run`] owns its
/// session state exclusively, so a `Researcher` can serve sequential
/// sessions.
///
/// [`run`]: Researcher::run
pub struct Researcher {
    llm: Arc<dyn LlmClient>,
    search: Arc<dyn SearchProvider>,
    fetcher: Arc<dyn UrlFetcher>,
    sandbox: Arc<dyn CodeSandbox>,
    step_sleep: Duration,
}

impl Researcher {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        search: Arc<dyn SearchProvider>,
        fetcher: Arc<dyn UrlFetcher>,
        sandbox: Arc<dyn CodeSandbox>,
        step_sleep: Duration,
    ) -> Self {
        Self {
            llm,
            search,
            fetcher,
            sandbox,
            step_sleep,
        }
    }

    /// Build a researcher with the live collaborators the configuration
    /// selects. The code sandbox starts unconfigured; attach one with
    /// [`with_sandbox`](Self::with_sandbox).
    pub fn from_settings(settings: &Settings) -> Result<Self, String> {
        Ok(Self {
            llm: Arc::new(ChatCompletionsClient::new(settings)?),
            search: build_provider(settings)?,
            fetcher: Arc::new(JinaReader::new(settings)?),
            sandbox: Arc::new(UnconfiguredSandbox),
            step_sleep: settings.step_sleep,
        })
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn CodeSandbox>) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Run one research session to completion.
    pub async fn run(
        &self,
        question: &str,
        options: ResearcherOptions,
    ) -> Result<ResearchOutcome, String> {
        let (question, chat_messages) = resolve_question(question, options.messages.clone());
        if question.is_empty() {
            return Err("no question provided".to_string());
        }

        let trackers = options
            .existing_trackers
            .clone()
            .unwrap_or_else(|| TrackerContext::new(options.token_budget()));
        let generator = ObjectGenerator::new(self.llm.clone(), trackers.clone());

        let mut registry = SchemaRegistry::new();
        detect_language(&generator, &mut registry, &question).await;

        let mut state = AgentState::new(question.clone());
        let mut rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(rand::rngs::OsRng.next_u64()),
        };
        let artifacts = options.artifacts_dir.as_ref().map(ArtifactWriter::new);

        let co = Collaborators {
            generator: &generator,
            registry: &registry,
            search: self.search.as_ref(),
            fetcher: self.fetcher.as_ref(),
            sandbox: self.sandbox.as_ref(),
            step_sleep: self.step_sleep,
        };
        let evaluator = Evaluator {
            generator: &generator,
            registry: &registry,
        };

        let regular_budget = (options.token_budget() as f64 * REGULAR_BUDGET_FACTOR) as u64;
        let max_bad_attempts = options.max_bad_attempts();
        let mut this_step = AgentStep::empty_answer();
        let mut is_final = false;

        info!("research session started: {question}");

        while trackers.total_tokens() < regular_budget && state.bad_attempts <= max_bad_attempts {
            state.step += 1;
            state.total_step += 1;

            state.gates.reflect = state.gates.reflect && state.gaps.len() <= MAX_REFLECT_PER_STEP;
            let current = state.gaps[state.total_step as usize % state.gaps.len()].clone();
            info!(
                "step {} (attempt step {}): question `{current}`, gaps={}",
                state.total_step,
                state.step,
                state.gaps.len(),
            );

            if state.is_original(&current) && state.total_step == 1 {
                let mut metrics = evaluator.question_metrics(&current).await;
                metrics.push(EvaluationKind::Strict);
                state.metrics.insert(current.clone(), metrics);
            } else if !state.is_original(&current) {
                state.metrics.insert(current.clone(), Vec::new());
            }

            // A freshness-checked question must not be answered from memory
            // on the very first step.
            if state.total_step == 1
                && state.metrics_for(&current).contains(&EvaluationKind::Freshness)
            {
                state.gates.answer = false;
                state.gates.reflect = false;
            }

            if state.gates.is_empty() {
                warn!("gate vector is empty; forcing beast mode");
                break;
            }

            if !state.url_pool.is_empty() {
                state.weighted = keep_k_per_hostname(
                    state.url_pool.rank(&current, &state.visited),
                    crate::MAX_URLS_PER_HOSTNAME,
                );
            }

            let system = compose_system_prompt(&PromptInputs {
                diary: &state.diary,
                all_keywords: &state.all_keywords,
                weighted_urls: &state.weighted,
                gates: state.gates,
                beast_mode: false,
            });
            let schema = registry.agent_schema(&state.gates, Some(&current));
            let pip = if state.is_original(&current) {
                Some(&state.final_answer_pip[..])
            } else {
                None
            };
            let msgs = compose_msgs(&chat_messages, &state.knowledge, &current, pip);

            this_step = match generator
                .generate("agent", schema, system.clone(), msgs.clone())
                .await
                .and_then(|object| AgentStep::from_llm_object(&object))
            {
                Ok(step) => step,
                Err(e) => {
                    warn!("step {} produced no usable action: {e}", state.total_step);
                    AgentStep::error(
                        e,
                        "The structured output was invalid. I need to think out of the box \
                         and try a completely different angle.",
                    )
                }
            };

            info!(
                "{current}: {} <- [{}]",
                this_step.action.name(),
                state.gates.allowed_actions().join(", "),
            );
            if let Ok(mut tracker) = trackers.action.lock() {
                tracker.track_action(
                    this_step.clone(),
                    state.gaps.clone(),
                    state.bad_attempts,
                    state.total_step,
                );
            }

            state.gates = GateVector::all();

            match this_step.action.clone() {
                StepAction::Answer {
                    answer,
                    mut references,
                    ..
                } if !answer.is_empty() => {
                    update_references(&mut references, &mut state, co.fetcher).await;
                    this_step.action = StepAction::Answer {
                        answer: answer.clone(),
                        references: references.clone(),
                        is_final: false,
                        md_answer: None,
                    };

                    if state.total_step == 1
                        && references.is_empty()
                        && !options.no_direct_answer
                    {
                        is_final = true;
                        break;
                    }

                    if !references.is_empty() {
                        let unread: Vec<String> = references
                            .iter()
                            .map(|r| r.url.clone())
                            .filter(|u| !state.visited.contains(u))
                            .collect::<BTreeSet<_>>()
                            .into_iter()
                            .collect();
                        process_urls(&unread, &mut state, &co).await;
                    }

                    state.push_context(Some(current.clone()), this_step.clone(), None);

                    let metrics = state.metrics_for(&current).to_vec();
                    let evaluation = if metrics.is_empty() {
                        EvaluationVerdict::auto_pass()
                    } else {
                        trackers.track_think(
                            "evaluating the answer against its quality checks first",
                        );
                        evaluator
                            .evaluate(&current, &answer, &references, &metrics, &state.knowledge)
                            .await
                    };

                    if state.is_original(&current) {
                        if evaluation.pass {
                            state.diary.push(format!(
                                "At step {}, you took **answer** action and finally found the \
                                 answer to the original question:\n\n\
                                 Original question:\n{current}\n\n\
                                 Your answer:\n{answer}\n\n\
                                 The evaluator thinks your answer is good because:\n{}\n\n\
                                 Your journey ends here. You have successfully answered the \
                                 original question.",
                                state.step, evaluation.think,
                            ));
                            is_final = true;
                            break;
                        }

                        if evaluation.kind == EvaluationKind::Strict
                            && let Some(plan) = &evaluation.improvement_plan
                        {
                            state.final_answer_pip.push(plan.clone());
                            state.max_strict_evals = state.max_strict_evals.saturating_sub(1);
                            if state.max_strict_evals == 0 {
                                info!("dropping `strict` from the evaluation metrics");
                                state.drop_strict_metric();
                            }
                        }

                        if state.bad_attempts >= max_bad_attempts {
                            is_final = false;
                            break;
                        }

                        state.diary.push(format!(
                            "At step {}, you took **answer** action but evaluator thinks it is \
                             not a good answer:\n\n\
                             Original question:\n{current}\n\n\
                             Your answer:\n{answer}\n\n\
                             The evaluator thinks your answer is bad because:\n{}",
                            state.step, evaluation.think,
                        ));

                        let analysis = analyze_steps(&generator, &registry, &state.diary).await;
                        state.knowledge.push(KnowledgeItem::new(
                            format!(
                                "Why is the following answer bad for the question? Please \
                                 reflect\n\n<question>\n{current}\n</question>\n\n\
                                 <answer>\n{answer}\n</answer>",
                            ),
                            analysis.to_answer_body(&evaluation.think),
                            KnowledgeKind::Qa,
                        ));
                        state.fail_reset();
                    } else if evaluation.pass {
                        state.diary.push(format!(
                            "At step {}, you took **answer** action. You found a good answer \
                             to the sub-question:\n\n\
                             Sub-question:\n{current}\n\n\
                             Your answer:\n{answer}\n\n\
                             The evaluator thinks your answer is good because:\n{}\n\n\
                             Although you solved a sub-question, you still need to find the \
                             answer to the original question. You need to keep going.",
                            state.step, evaluation.think,
                        ));
                        state.knowledge.push(
                            KnowledgeItem::new(current.clone(), answer.clone(), KnowledgeKind::Qa)
                                .with_references(references.clone())
                                .with_updated(
                                    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                                ),
                        );
                        state.resolve_gap(&current);
                    } else {
                        state.diary.push(format!(
                            "At step {}, you took **answer** action on the sub-question \
                             \"{current}\" but the evaluator rejected it. You noted the \
                             rejection and moved on.",
                            state.step,
                        ));
                    }
                }
                StepAction::Reflect {
                    questions_to_answer,
                } => {
                    handle_reflect(
                        &mut state,
                        &co,
                        this_step.clone(),
                        &questions_to_answer,
                        &current,
                    )
                    .await;
                }
                StepAction::Search { search_requests } => {
                    handle_search(
                        &mut state,
                        &co,
                        &mut rng,
                        this_step.clone(),
                        &search_requests,
                        &current,
                    )
                    .await;
                }
                StepAction::Visit { url_targets } => {
                    handle_visit(&mut state, &co, this_step.clone(), &url_targets).await;
                }
                StepAction::Coding { coding_issue } => {
                    handle_coding(&mut state, &co, this_step.clone(), &coding_issue).await;
                }
                StepAction::Error { message } => {
                    state.diary.push(format!(
                        "At step {}, you tried to take an action but the output did not match \
                         any allowed action ({message}). You decided to think out of the box \
                         or cut from a completely different angle.",
                        state.step,
                    ));
                    state.push_context(None, this_step.clone(), None);
                }
                StepAction::Answer { .. } => {
                    // An answer action with an empty answer body carries no
                    // information; the step is burned.
                }
            }

            if let Some(writer) = &artifacts {
                writer.store_step(&system, &state, &msgs);
            }
            tokio::time::sleep(self.step_sleep).await;
        }

        // ── Beast mode ──
        if !is_final {
            info!("entering beast mode");
            state.step += 1;
            state.total_step += 1;

            let system = compose_system_prompt(&PromptInputs {
                diary: &state.diary,
                all_keywords: &state.all_keywords,
                weighted_urls: &state.weighted,
                gates: GateVector::answer_only(),
                beast_mode: true,
            });
            let schema = registry.agent_schema(&GateVector::answer_only(), Some(&state.question));
            let msgs = compose_msgs(
                &chat_messages,
                &state.knowledge,
                &state.question,
                Some(&state.final_answer_pip[..]),
            );

            match generator
                .generate("agentBeastMode", schema, system, msgs)
                .await
                .and_then(|object| AgentStep::from_llm_object(&object))
            {
                Ok(mut step) => {
                    if let StepAction::Answer {
                        answer,
                        mut references,
                        ..
                    } = step.action.clone()
                        && !answer.is_empty()
                    {
                        update_references(&mut references, &mut state, co.fetcher).await;
                        step.action = StepAction::Answer {
                            answer,
                            references,
                            is_final: true,
                            md_answer: None,
                        };
                        is_final = true;
                    }
                    this_step = step;
                }
                Err(e) => {
                    warn!("beast mode failed: {e}");
                    if this_step.think.is_empty() {
                        this_step.think = format!(
                            "The session ran out of budget before a final answer could be \
                             produced ({e})."
                        );
                    }
                }
            }
        }

        // ── Done ──
        if let StepAction::Answer {
            answer,
            references,
            md_answer,
            is_final: final_flag,
        } = &mut this_step.action
        {
            *md_answer = Some(render_md_answer(answer, references));
            *final_flag = is_final;
        }

        if let Some(writer) = &artifacts {
            writer.store_step("", &state, &[]);
        }
        if let Ok(tracker) = trackers.token.lock() {
            tracker.log_summary();
        }

        let all_urls = state.url_pool.by_weight();
        Ok(ResearchOutcome {
            result: this_step,
            trackers,
            visited_urls: all_urls
                .iter()
                .take(options.num_returned_urls())
                .map(|s| s.url.clone())
                .collect(),
            read_urls: state.visited.iter().cloned().collect(),
            all_urls,
            knowledge: state.knowledge,
            diary: state.diary,
        })
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Resolve the effective question and conversation. A provided transcript
/// loses its system messages, and its last user message becomes the
/// question.
fn resolve_question(
    question: &str,
    messages: Option<Vec<Message>>,
) -> (String, Vec<Message>) {
    match messages {
        Some(messages) => {
            let filtered: Vec<Message> = messages
                .into_iter()
                .filter(|m| m.role != MessageRole::System)
                .collect();
            let question = filtered
                .iter()
                .rev()
                .find(|m| m.role == MessageRole::User)
                .map(|m| m.content.trim().to_string())
                .unwrap_or_else(|| question.trim().to_string());
            (question, filtered)
        }
        None => {
            let question = question.trim().to_string();
            (question.clone(), vec![Message::user(question.clone())])
        }
    }
}

/// Detect the question's language and register it with the schema registry.
/// Failure keeps the English defaults.
async fn detect_language(
    generator: &ObjectGenerator,
    registry: &mut SchemaRegistry,
    question: &str,
) {
    let system = "Identify both the language used and the overall vibe of the question. \
        Combine language and emotional vibe in a descriptive phrase, considering the primary \
        language or mix of languages, the emotional tone, the formality level, and the domain \
        context.";
    match generator
        .generate_parsed::<LanguageVerdict>(
            "language",
            registry.language_schema(),
            system,
            vec![Message::user(question.to_string())],
        )
        .await
    {
        Ok(verdict) => registry.set_language(&verdict),
        Err(e) => warn!("language detection failed, keeping defaults: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md_answer_renders_footnotes_in_order() {
        let references = vec![
            Reference {
                exact_quote: "Paris is the capital".into(),
                url: "https://a.com/paris".into(),
                title: "Paris - Wikipedia".into(),
                date_time: "2024-05-01".into(),
            },
            Reference {
                exact_quote: "population 2.1M".into(),
                url: "https://b.com/stats".into(),
                title: String::new(),
                date_time: String::new(),
            },
        ];
        let md = render_md_answer("Paris.[^1][^2]", &references);
        let lines: Vec<&str> = md.lines().collect();
        assert_eq!(lines[0], "Paris.[^1][^2]");
        assert!(lines[2].starts_with("[^1]:"));
        assert!(lines[2].contains("[Paris - Wikipedia](https://a.com/paris)"));
        assert!(lines[2].contains("(2024-05-01)"));
        assert!(lines[3].starts_with("[^2]:"));
        assert!(lines[3].contains("[https://b.com/stats](https://b.com/stats)"));
    }

    #[test]
    fn md_answer_without_references_is_plain() {
        assert_eq!(render_md_answer("Hello!", &[]), "Hello!");
    }

    #[test]
    fn resolve_question_from_plain_string() {
        let (question, messages) = resolve_question("  what is love?  ", None);
        assert_eq!(question, "what is love?");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::User);
    }

    #[test]
    fn resolve_question_from_transcript() {
        let transcript = vec![
            Message::system("be helpful"),
            Message::user("earlier question"),
            Message::assistant("earlier answer"),
            Message::user("the real question"),
        ];
        let (question, messages) = resolve_question("ignored", Some(transcript));
        assert_eq!(question, "the real question");
        assert_eq!(messages.len(), 3);
        assert!(messages.iter().all(|m| m.role != MessageRole::System));
    }

    #[test]
    fn options_defaults_match_interface() {
        let options = ResearcherOptions::default();
        assert_eq!(options.token_budget(), 1_000_000);
        assert_eq!(options.max_bad_attempts(), 3);
        assert_eq!(options.num_returned_urls(), 100);
        assert!(!options.no_direct_answer);
    }
}
