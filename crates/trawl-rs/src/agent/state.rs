//! Mutable session state shared by the loop and the action handlers.
//!
//! All of it is owned by a single [`Researcher`](super::researcher::Researcher)
//! run and mutated only from the loop, so no locking is involved. The
//! invariants documented on [`AgentState`] are checked by the integration
//! tests rather than enforced at runtime.

use crate::actions::{AgentStep, KnowledgeItem, Reference};
use crate::evaluate::EvaluationKind;
use crate::urls::{UrlPool, UrlSnippet};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

// ── Gate vector ────────────────────────────────────────────────────

/// Which actions the agent may take this step. Reset to all-true at the top
/// of every step, then narrowed by recent-action rules and edge policies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateVector {
    pub search: bool,
    pub visit: bool,
    pub answer: bool,
    pub reflect: bool,
    pub coding: bool,
}

impl GateVector {
    pub fn all() -> Self {
        Self {
            search: true,
            visit: true,
            answer: true,
            reflect: true,
            coding: true,
        }
    }

    /// The beast-mode gate: nothing but `answer`.
    pub fn answer_only() -> Self {
        Self {
            search: false,
            visit: false,
            answer: true,
            reflect: false,
            coding: false,
        }
    }

    /// Wire names of the allowed actions, in schema order.
    pub fn allowed_actions(&self) -> Vec<&'static str> {
        let mut allowed = Vec::new();
        if self.search {
            allowed.push("search");
        }
        if self.coding {
            allowed.push("coding");
        }
        if self.answer {
            allowed.push("answer");
        }
        if self.reflect {
            allowed.push("reflect");
        }
        if self.visit {
            allowed.push("visit");
        }
        allowed
    }

    pub fn is_empty(&self) -> bool {
        !(self.search || self.visit || self.answer || self.reflect || self.coding)
    }
}

impl Default for GateVector {
    fn default() -> Self {
        Self::all()
    }
}

// ── Context records ────────────────────────────────────────────────

/// One entry of the session's raw context log, persisted as a debug artifact.
/// `result` carries whatever the handler attached — the raw LLM result for a
/// search step, the fetched URL list for a visit step, or a canned retry
/// nudge. Nothing reads it back; it exists for offline inspection.
#[derive(Serialize, Clone, Debug)]
pub struct ContextRecord {
    #[serde(rename = "totalStep")]
    pub total_step: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(flatten)]
    pub step: AgentStep,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

// ── Agent state ────────────────────────────────────────────────────

/// The whole mutable state of one research session.
///
/// Invariants maintained by the loop and handlers:
/// - `gaps[0]` references the original question until it is solved;
/// - `visited` is a subset of the URL pool's keys;
/// - `all_questions` and `all_keywords` contain no case-insensitive
///   duplicates;
/// - `diary` is empty exactly at `step == 0` (session start and immediately
///   after a fail-reset).
pub struct AgentState {
    /// The original question Q0.
    pub question: String,
    /// Open questions, round-robin scheduled. Q0 stays at index 0.
    pub gaps: Vec<String>,
    /// Every question ever asked (dedup log for reflect).
    pub all_questions: Vec<String>,
    /// Every search query ever executed (dedup log + bad-requests prompt list).
    pub all_keywords: Vec<String>,
    /// Append-only knowledge base.
    pub knowledge: Vec<KnowledgeItem>,
    /// Natural-language step descriptions fed back as `<context>`.
    pub diary: Vec<String>,
    /// All URLs ever seen, keyed by normalized URL.
    pub url_pool: UrlPool,
    /// Successfully fetched URLs.
    pub visited: BTreeSet<String>,
    /// Ranked, hostname-capped URL candidates for the current step.
    pub weighted: Vec<UrlSnippet>,
    /// Per-question evaluator metric lists.
    pub metrics: HashMap<String, Vec<EvaluationKind>>,
    /// Reviewer feedback accumulated from strict-evaluator failures.
    pub final_answer_pip: Vec<String>,
    /// Raw context log (debug artifact only).
    pub context_log: Vec<ContextRecord>,

    pub gates: GateVector,
    /// Step counter since the last fail-reset.
    pub step: u32,
    /// Step counter since session start; never resets.
    pub total_step: u32,
    pub bad_attempts: u32,
    /// Strict-evaluator failures still tolerated before `strict` is dropped.
    pub max_strict_evals: u32,
}

impl AgentState {
    pub fn new(question: impl Into<String>) -> Self {
        let question = question.into();
        Self {
            gaps: vec![question.clone()],
            all_questions: vec![question.clone()],
            question,
            all_keywords: Vec::new(),
            knowledge: Vec::new(),
            diary: Vec::new(),
            url_pool: UrlPool::new(),
            visited: BTreeSet::new(),
            weighted: Vec::new(),
            metrics: HashMap::new(),
            final_answer_pip: Vec::new(),
            context_log: Vec::new(),
            gates: GateVector::all(),
            step: 0,
            total_step: 0,
            bad_attempts: 0,
            max_strict_evals: crate::MAX_STRICT_EVALS,
        }
    }

    /// Whether `current` is the original question.
    pub fn is_original(&self, current: &str) -> bool {
        current.trim() == self.question
    }

    /// The metric list for `question` (empty when none was derived).
    pub fn metrics_for(&self, question: &str) -> &[EvaluationKind] {
        self.metrics
            .get(question)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Drop `strict` from the original question's metric list.
    pub fn drop_strict_metric(&mut self) {
        if let Some(list) = self.metrics.get_mut(&self.question) {
            list.retain(|kind| *kind != EvaluationKind::Strict);
        }
    }

    /// Record a context-log entry.
    pub fn push_context(
        &mut self,
        question: Option<String>,
        step: AgentStep,
        result: Option<Value>,
    ) {
        self.context_log.push(ContextRecord {
            total_step: self.total_step,
            question,
            step,
            result,
        });
    }

    /// Fail-reset after a rejected answer to the original question: wipe the
    /// diary, restart the per-attempt step counter, and keep the agent away
    /// from answering on the very next step.
    pub fn fail_reset(&mut self) {
        self.bad_attempts += 1;
        self.diary.clear();
        self.step = 0;
        self.gates.answer = false;
    }

    /// Mark a sub-question as solved and remove it from the gap queue.
    pub fn resolve_gap(&mut self, question: &str) {
        self.gaps.retain(|g| g != question);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_actions_order_matches_schema() {
        assert_eq!(
            GateVector::all().allowed_actions(),
            vec!["search", "coding", "answer", "reflect", "visit"]
        );
    }

    #[test]
    fn answer_only_gate() {
        let gates = GateVector::answer_only();
        assert_eq!(gates.allowed_actions(), vec!["answer"]);
        assert!(!gates.is_empty());
    }

    #[test]
    fn empty_gate_detected() {
        let gates = GateVector {
            search: false,
            visit: false,
            answer: false,
            reflect: false,
            coding: false,
        };
        assert!(gates.is_empty());
        assert!(gates.allowed_actions().is_empty());
    }

    #[test]
    fn new_state_seeds_gap_queue_with_question() {
        let state = AgentState::new("what is love?");
        assert_eq!(state.gaps, vec!["what is love?"]);
        assert_eq!(state.all_questions, vec!["what is love?"]);
        assert!(state.diary.is_empty());
        assert_eq!(state.step, 0);
    }

    #[test]
    fn fail_reset_clears_diary_and_blocks_answer() {
        let mut state = AgentState::new("q");
        state.diary.push("step 1 happened".into());
        state.step = 4;
        state.fail_reset();
        assert!(state.diary.is_empty());
        assert_eq!(state.step, 0);
        assert_eq!(state.bad_attempts, 1);
        assert!(!state.gates.answer);
    }

    #[test]
    fn drop_strict_metric_removes_only_strict() {
        let mut state = AgentState::new("q");
        state.metrics.insert(
            "q".into(),
            vec![
                EvaluationKind::Definitive,
                EvaluationKind::Strict,
                EvaluationKind::Plurality,
            ],
        );
        state.drop_strict_metric();
        assert_eq!(
            state.metrics_for("q"),
            &[EvaluationKind::Definitive, EvaluationKind::Plurality]
        );
    }

    #[test]
    fn resolve_gap_keeps_original_question() {
        let mut state = AgentState::new("q0");
        state.gaps.push("sub".into());
        state.resolve_gap("sub");
        assert_eq!(state.gaps, vec!["q0"]);
    }
}
