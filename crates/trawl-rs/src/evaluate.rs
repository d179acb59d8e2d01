//! Answer evaluation: question-specific metric derivation and the
//! short-circuiting evaluator chain.
//!
//! Metrics are invoked in the order they appear in the question's list; the
//! first failing verdict is returned and the rest are skipped. Numeric
//! verdicts (freshness, plurality) are recomputed from the analysis payload,
//! so `pass` always matches the definition even when the model contradicts
//! its own numbers. An evaluator call that errors out is skipped — a broken
//! judge never blocks the loop.

use crate::actions::{KnowledgeItem, KnowledgeKind, Reference};
use crate::llm::ObjectGenerator;
use crate::schema::{QuestionRequirements, SchemaRegistry};
use crate::Message;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ── Metric kinds ───────────────────────────────────────────────────

/// The evaluator kinds an answer can be scored against.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationKind {
    Definitive,
    Freshness,
    Plurality,
    Completeness,
    Attribution,
    Strict,
}

impl EvaluationKind {
    pub const ALL: [EvaluationKind; 6] = [
        EvaluationKind::Definitive,
        EvaluationKind::Freshness,
        EvaluationKind::Plurality,
        EvaluationKind::Completeness,
        EvaluationKind::Attribution,
        EvaluationKind::Strict,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EvaluationKind::Definitive => "definitive",
            EvaluationKind::Freshness => "freshness",
            EvaluationKind::Plurality => "plurality",
            EvaluationKind::Completeness => "completeness",
            EvaluationKind::Attribution => "attribution",
            EvaluationKind::Strict => "strict",
        }
    }
}

impl std::fmt::Display for EvaluationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Verdicts ───────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
pub struct FreshnessAnalysis {
    pub days_ago: i64,
    pub max_age_days: i64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
pub struct PluralityAnalysis {
    pub minimum_count_required: u64,
    pub actual_count_provided: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CompletenessAnalysis {
    #[serde(default)]
    pub aspects_expected: String,
    #[serde(default)]
    pub aspects_provided: String,
}

/// One evaluator's judgement of an answer.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EvaluationVerdict {
    #[serde(rename = "type")]
    pub kind: EvaluationKind,
    pub pass: bool,
    #[serde(default)]
    pub think: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freshness_analysis: Option<FreshnessAnalysis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plurality_analysis: Option<PluralityAnalysis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completeness_analysis: Option<CompletenessAnalysis>,
    #[serde(rename = "exactQuote", default, skip_serializing_if = "Option::is_none")]
    pub exact_quote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub improvement_plan: Option<String>,
}

impl EvaluationVerdict {
    /// The verdict used when a question carries no metrics at all.
    pub fn auto_pass() -> Self {
        Self {
            kind: EvaluationKind::Definitive,
            pass: true,
            think: String::new(),
            freshness_analysis: None,
            plurality_analysis: None,
            completeness_analysis: None,
            exact_quote: None,
            improvement_plan: None,
        }
    }
}

// ── Evaluator ──────────────────────────────────────────────────────

/// Runs the metric chain for one candidate answer.
pub struct Evaluator<'a> {
    pub generator: &'a ObjectGenerator,
    pub registry: &'a SchemaRegistry,
}

impl Evaluator<'_> {
    /// Derive the metric list for the original question: a one-shot call
    /// mapping the question onto the four optional checks. `strict` is the
    /// caller's business. Degrades to no checks when the call fails.
    pub async fn question_metrics(&self, question: &str) -> Vec<EvaluationKind> {
        let system = "You decide which quality checks an answer to the question will need.\n\
            - needsDefinitive: true unless the question is purely conversational.\n\
            - needsFreshness: true when the answer changes over time (prices, versions, \
            office holders, schedules, anything \"latest\").\n\
            - needsPlurality: true when the question asks for multiple items, examples, \
            or a specific count.\n\
            - needsCompleteness: true when the question names multiple explicit aspects \
            or entities that all must be covered.";

        let requirements = match self
            .generator
            .generate_parsed::<QuestionRequirements>(
                "evaluator",
                self.registry.question_requirements_schema(),
                system,
                vec![Message::user(question.to_string())],
            )
            .await
        {
            Ok(requirements) => requirements,
            Err(e) => {
                warn!("question evaluation failed, skipping metric derivation: {e}");
                return Vec::new();
            }
        };

        let mut metrics = Vec::new();
        if requirements.needs_definitive {
            metrics.push(EvaluationKind::Definitive);
        }
        if requirements.needs_freshness {
            metrics.push(EvaluationKind::Freshness);
        }
        if requirements.needs_plurality {
            metrics.push(EvaluationKind::Plurality);
        }
        if requirements.needs_completeness {
            metrics.push(EvaluationKind::Completeness);
        }
        debug!("metrics for question: {metrics:?}");
        metrics
    }

    /// Run the metric chain in order; the first failure short-circuits.
    /// Returns a passing verdict when every metric passes (or none exist).
    pub async fn evaluate(
        &self,
        question: &str,
        answer: &str,
        references: &[Reference],
        metrics: &[EvaluationKind],
        knowledge: &[KnowledgeItem],
    ) -> EvaluationVerdict {
        let mut last = EvaluationVerdict::auto_pass();
        for &kind in metrics {
            let (system, user) = metric_prompt(kind, question, answer, references, knowledge);
            let verdict = match self
                .generator
                .generate_parsed::<EvaluationVerdict>(
                    "evaluator",
                    self.registry.evaluator_schema(kind),
                    system,
                    vec![Message::user(user)],
                )
                .await
            {
                Ok(mut verdict) => {
                    verdict.kind = kind;
                    enforce_analysis(&mut verdict);
                    verdict
                }
                Err(e) => {
                    warn!("{kind} evaluation failed, skipping this metric: {e}");
                    continue;
                }
            };

            debug!("{kind} verdict: pass={} ({})", verdict.pass, verdict.think);
            if !verdict.pass {
                return verdict;
            }
            last = verdict;
        }
        last
    }
}

/// Recompute `pass` from the numeric analysis payloads: freshness passes iff
/// `days_ago <= max_age_days`, plurality iff provided >= required.
fn enforce_analysis(verdict: &mut EvaluationVerdict) {
    if let Some(freshness) = verdict.freshness_analysis {
        verdict.pass = freshness.days_ago <= freshness.max_age_days;
    }
    if let Some(plurality) = verdict.plurality_analysis {
        verdict.pass = plurality.actual_count_provided >= plurality.minimum_count_required;
    }
}

fn metric_prompt(
    kind: EvaluationKind,
    question: &str,
    answer: &str,
    references: &[Reference],
    knowledge: &[KnowledgeItem],
) -> (String, String) {
    let base_user = format!("<question>\n{question}\n</question>\n\n<answer>\n{answer}\n</answer>");

    match kind {
        EvaluationKind::Definitive => (
            "You judge whether the answer is definitive. Fail it when it hedges, expresses \
             uncertainty, refuses, or defers (\"I cannot\", \"it depends\", \"as an AI\"). \
             Confident, committed statements pass."
                .to_string(),
            base_user,
        ),
        EvaluationKind::Freshness => (
            "You judge whether the answer is fresh enough for the question. Estimate the age \
             of the answer's information in days (days_ago) and the maximum acceptable age for \
             this kind of question (max_age_days)."
                .to_string(),
            base_user,
        ),
        EvaluationKind::Plurality => (
            "You judge whether the answer provides as many items as the question demands. \
             Count what the question requires (minimum_count_required) and what the answer \
             actually provides (actual_count_provided)."
                .to_string(),
            base_user,
        ),
        EvaluationKind::Completeness => (
            "You judge whether the answer covers every aspect the question explicitly names. \
             List the expected aspects and the provided aspects as comma-separated strings; \
             fail when any expected aspect is missing."
                .to_string(),
            base_user,
        ),
        EvaluationKind::Attribution => {
            let mut sources = String::new();
            for reference in references {
                let excerpt = knowledge
                    .iter()
                    .find(|k| {
                        k.kind == KnowledgeKind::Url
                            && k.references.iter().any(|r| r.url == reference.url)
                    })
                    .map(|k| k.answer.chars().take(2000).collect::<String>())
                    .unwrap_or_default();
                sources.push_str(&format!(
                    "<source url=\"{}\" quote=\"{}\">\n{excerpt}\n</source>\n",
                    reference.url, reference.exact_quote,
                ));
            }
            (
                "You verify attribution. For each cited reference, check that its exactQuote \
                 actually appears in (or is directly supported by) the fetched content of its \
                 URL. Fail when any quote is unsupported or fabricated."
                    .to_string(),
                format!("{base_user}\n\n{sources}"),
            )
        }
        EvaluationKind::Strict => (
            "You are the harshest reviewer this answer will ever face. Look for missing \
             angles, shallow reasoning, uncited claims, and wasted words. Only an answer you \
             would publish under your own name passes. When it fails, write an actionable \
             improvement_plan starting with \"For the best answer, you must...\"."
                .to_string(),
            base_user,
        ),
    }
}
