//! Token and action trackers: passive usage sinks with a synchronous
//! observer interface.
//!
//! Neither tracker influences control flow except by supplying the running
//! token total to the loop's budget check. Observers are called inline and
//! must not block or re-enter the loop.

use crate::actions::AgentStep;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::info;

// ── Usage ──────────────────────────────────────────────────────────

/// Token usage reported for a single LLM call.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// One tracked LLM call: which tool made it and what it cost.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UsageRow {
    pub tool: String,
    pub usage: TokenUsage,
}

// ── Observer interface ─────────────────────────────────────────────

/// Events emitted by the trackers.
#[derive(Debug)]
pub enum TrackerEvent<'a> {
    /// An LLM call finished and reported usage.
    Usage { tool: &'a str, usage: &'a TokenUsage },
    /// The agent's current step changed (new action or updated `think`).
    Action { step: &'a AgentStep },
}

/// Observer for tracker events. Called synchronously; implementations must
/// not block.
pub trait TrackerObserver: Send + Sync {
    fn on_event(&self, event: &TrackerEvent<'_>);
}

// ── Token tracker ──────────────────────────────────────────────────

/// Accumulates per-tool token usage across a research session.
pub struct TokenTracker {
    rows: Vec<UsageRow>,
    budget: u64,
    observers: Vec<Box<dyn TrackerObserver>>,
}

impl TokenTracker {
    pub fn new(budget: u64) -> Self {
        Self {
            rows: Vec::new(),
            budget,
            observers: Vec::new(),
        }
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Record usage for an LLM call made by `tool`.
    pub fn track(&mut self, tool: &str, usage: TokenUsage) {
        self.rows.push(UsageRow {
            tool: tool.to_string(),
            usage,
        });
        for obs in &self.observers {
            obs.on_event(&TrackerEvent::Usage { tool, usage: &usage });
        }
    }

    /// Sum of all tracked usage.
    pub fn total_usage(&self) -> TokenUsage {
        let mut total = TokenUsage::default();
        for row in &self.rows {
            total.prompt_tokens += row.usage.prompt_tokens;
            total.completion_tokens += row.usage.completion_tokens;
            total.total_tokens += row.usage.total_tokens;
        }
        total
    }

    /// Total tokens per tool name.
    pub fn usage_breakdown(&self) -> BTreeMap<String, u64> {
        let mut breakdown = BTreeMap::new();
        for row in &self.rows {
            *breakdown.entry(row.tool.clone()).or_insert(0) += row.usage.total_tokens;
        }
        breakdown
    }

    pub fn rows(&self) -> &[UsageRow] {
        &self.rows
    }

    pub fn add_observer(&mut self, observer: Box<dyn TrackerObserver>) {
        self.observers.push(observer);
    }

    /// Log a one-line usage summary.
    pub fn log_summary(&self) {
        let total = self.total_usage();
        info!(
            "Token usage: budget={}, total={} ({} prompt + {} completion), breakdown={:?}",
            self.budget,
            total.total_tokens,
            total.prompt_tokens,
            total.completion_tokens,
            self.usage_breakdown(),
        );
    }
}

// ── Action tracker ─────────────────────────────────────────────────

/// Snapshot of the agent's progress, updated after every state change.
#[derive(Serialize, Clone, Debug)]
pub struct ActionState {
    pub this_step: AgentStep,
    pub gaps: Vec<String>,
    pub bad_attempts: u32,
    pub total_step: u32,
}

impl Default for ActionState {
    fn default() -> Self {
        Self {
            this_step: AgentStep::empty_answer(),
            gaps: Vec::new(),
            bad_attempts: 0,
            total_step: 0,
        }
    }
}

/// Holds the latest step and notifies observers after every update.
#[derive(Default)]
pub struct ActionTracker {
    state: ActionState,
    observers: Vec<Box<dyn TrackerObserver>>,
}

impl ActionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new step (and the surrounding loop counters).
    pub fn track_action(
        &mut self,
        this_step: AgentStep,
        gaps: Vec<String>,
        bad_attempts: u32,
        total_step: u32,
    ) {
        self.state = ActionState {
            this_step,
            gaps,
            bad_attempts,
            total_step,
        };
        self.notify();
    }

    /// Update only the `think` line of the current step. Used for progress
    /// narration between actions ("searching for ...", "evaluating first ...").
    pub fn track_think(&mut self, think: impl Into<String>) {
        self.state.this_step.think = think.into();
        self.notify();
    }

    pub fn state(&self) -> &ActionState {
        &self.state
    }

    pub fn add_observer(&mut self, observer: Box<dyn TrackerObserver>) {
        self.observers.push(observer);
    }

    fn notify(&self) {
        for obs in &self.observers {
            obs.on_event(&TrackerEvent::Action {
                step: &self.state.this_step,
            });
        }
    }
}

// ── Shared tracker context ─────────────────────────────────────────

/// Both trackers, shareable between the loop, the object generator, and the
/// caller. A caller can pass the same context into a follow-up session to
/// keep accumulating usage.
#[derive(Clone)]
pub struct TrackerContext {
    pub token: Arc<Mutex<TokenTracker>>,
    pub action: Arc<Mutex<ActionTracker>>,
}

impl TrackerContext {
    pub fn new(token_budget: u64) -> Self {
        Self {
            token: Arc::new(Mutex::new(TokenTracker::new(token_budget))),
            action: Arc::new(Mutex::new(ActionTracker::new())),
        }
    }

    /// Total tokens consumed so far.
    pub fn total_tokens(&self) -> u64 {
        self.token
            .lock()
            .map(|t| t.total_usage().total_tokens)
            .unwrap_or(0)
    }

    pub fn track_usage(&self, tool: &str, usage: TokenUsage) {
        if let Ok(mut tracker) = self.token.lock() {
            tracker.track(tool, usage);
        }
    }

    pub fn track_think(&self, think: impl Into<String>) {
        if let Ok(mut tracker) = self.action.lock() {
            tracker.track_think(think);
        }
    }
}
