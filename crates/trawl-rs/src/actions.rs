//! Step actions, references, and knowledge items — the agent's data model.
//!
//! [`StepAction`] is the tagged union the LLM fills in each step; the wire
//! format uses a top-level `action` discriminator plus one sub-object per
//! variant (`{"think": ..., "action": "search", "search": {...}}`).
//! [`AgentStep::from_llm_object`] is the in-memory parser matching the
//! schemas emitted by [`SchemaRegistry`](crate::schema::SchemaRegistry);
//! it truncates slack data to the documented limits so a misbehaving model
//! cannot widen an action beyond its schema.

use crate::{MAX_QUERIES_PER_STEP, MAX_REFLECT_PER_STEP, MAX_URLS_PER_STEP};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── References ─────────────────────────────────────────────────────

/// A supporting citation attached to an answer.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    /// Short soundbite quoted from the source.
    #[serde(default)]
    pub exact_quote: String,
    /// Normalized source URL.
    #[serde(default)]
    pub url: String,
    /// Page title, resolved from the URL pool at enrichment time.
    #[serde(default)]
    pub title: String,
    /// Publication/update datetime when known.
    #[serde(default)]
    pub date_time: String,
}

// ── Knowledge ──────────────────────────────────────────────────────

/// Where a piece of knowledge came from.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum KnowledgeKind {
    #[serde(rename = "qa")]
    Qa,
    #[serde(rename = "url")]
    Url,
    #[serde(rename = "side-info")]
    SideInfo,
    #[serde(rename = "coding")]
    Coding,
}

/// An append-only entry in the agent's knowledge base.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct KnowledgeItem {
    pub question: String,
    pub answer: String,
    #[serde(rename = "type")]
    pub kind: KnowledgeKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
    #[serde(
        rename = "sourceCode",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub source_code: Option<String>,
}

impl KnowledgeItem {
    pub fn new(question: impl Into<String>, answer: impl Into<String>, kind: KnowledgeKind) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
            kind,
            references: Vec::new(),
            updated: None,
            source_code: None,
        }
    }

    pub fn with_references(mut self, references: Vec<Reference>) -> Self {
        self.references = references;
        self
    }

    pub fn with_updated(mut self, updated: impl Into<String>) -> Self {
        self.updated = Some(updated.into());
        self
    }

    pub fn with_source_code(mut self, source_code: impl Into<String>) -> Self {
        self.source_code = Some(source_code.into());
        self
    }
}

// ── SERP queries ───────────────────────────────────────────────────

/// A provider-agnostic search query. Only `q` is mandatory; the remaining
/// fields are Serper-style refinements the query rewriter may fill in.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SerpQuery {
    pub q: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tbs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl SerpQuery {
    pub fn keyword(q: impl Into<String>) -> Self {
        Self {
            q: q.into(),
            ..Default::default()
        }
    }
}

// ── Step actions ───────────────────────────────────────────────────

/// One action chosen by the agent, with its variant payload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum StepAction {
    Search {
        #[serde(rename = "searchRequests")]
        search_requests: Vec<String>,
    },
    Visit {
        #[serde(rename = "URLTargets")]
        url_targets: Vec<String>,
    },
    Answer {
        answer: String,
        #[serde(default)]
        references: Vec<Reference>,
        #[serde(rename = "isFinal", default)]
        is_final: bool,
        #[serde(rename = "mdAnswer", default, skip_serializing_if = "Option::is_none")]
        md_answer: Option<String>,
    },
    Reflect {
        #[serde(rename = "questionsToAnswer")]
        questions_to_answer: Vec<String>,
    },
    Coding {
        #[serde(rename = "codingIssue")]
        coding_issue: String,
    },
    /// Synthetic action recorded when the model's output failed schema
    /// validation or the call itself failed. Never offered to the model.
    Error { message: String },
}

impl StepAction {
    /// The wire name of this variant.
    pub fn name(&self) -> &'static str {
        match self {
            StepAction::Search { .. } => "search",
            StepAction::Visit { .. } => "visit",
            StepAction::Answer { .. } => "answer",
            StepAction::Reflect { .. } => "reflect",
            StepAction::Coding { .. } => "coding",
            StepAction::Error { .. } => "error",
        }
    }
}

/// A full step: the model's reasoning plus the chosen action.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AgentStep {
    pub think: String,
    #[serde(flatten)]
    pub action: StepAction,
}

impl AgentStep {
    /// The placeholder step before the first LLM call: an empty non-final
    /// answer.
    pub fn empty_answer() -> Self {
        Self {
            think: String::new(),
            action: StepAction::Answer {
                answer: String::new(),
                references: Vec::new(),
                is_final: false,
                md_answer: None,
            },
        }
    }

    /// Synthetic error step used when the LLM output cannot be trusted.
    pub fn error(message: impl Into<String>, think: impl Into<String>) -> Self {
        Self {
            think: think.into(),
            action: StepAction::Error {
                message: message.into(),
            },
        }
    }

    /// Parse the object returned by the per-step agent call.
    ///
    /// The wire shape is `{"think", "action", "<action-name>": {...}}`. The
    /// variant payload for the chosen action must be present; list payloads
    /// are truncated to the per-step maxima in case the model returned slack
    /// data the schema should have rejected.
    pub fn from_llm_object(object: &Value) -> Result<Self, String> {
        let think = object
            .get("think")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let action_name = object
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing `action` discriminator".to_string())?;

        let payload = object.get(action_name);
        let action = match action_name {
            "search" => {
                let mut requests = string_list(payload, "searchRequests")?;
                if requests.is_empty() {
                    return Err("search action with empty searchRequests".into());
                }
                requests.truncate(MAX_QUERIES_PER_STEP);
                StepAction::Search {
                    search_requests: requests,
                }
            }
            "visit" => {
                let mut targets = string_list(payload, "URLTargets")?;
                targets.truncate(MAX_URLS_PER_STEP);
                StepAction::Visit {
                    url_targets: targets,
                }
            }
            "reflect" => {
                let mut questions = string_list(payload, "questionsToAnswer")?;
                questions.truncate(MAX_REFLECT_PER_STEP);
                StepAction::Reflect {
                    questions_to_answer: questions,
                }
            }
            "coding" => {
                let issue = payload
                    .and_then(|p| p.get("codingIssue"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| "coding action without codingIssue".to_string())?;
                StepAction::Coding {
                    coding_issue: issue.to_string(),
                }
            }
            "answer" => {
                let payload =
                    payload.ok_or_else(|| "answer action without payload".to_string())?;
                let answer = payload
                    .get("answer")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "answer action without answer text".to_string())?
                    .to_string();
                let references = payload
                    .get("references")
                    .cloned()
                    .map(|refs| serde_json::from_value::<Vec<Reference>>(refs))
                    .transpose()
                    .map_err(|e| format!("malformed references: {e}"))?
                    .unwrap_or_default();
                StepAction::Answer {
                    answer,
                    references,
                    is_final: false,
                    md_answer: None,
                }
            }
            other => return Err(format!("unknown action `{other}`")),
        };

        Ok(Self { think, action })
    }
}

fn string_list(payload: Option<&Value>, field: &str) -> Result<Vec<String>, String> {
    let list = payload
        .and_then(|p| p.get(field))
        .and_then(Value::as_array)
        .ok_or_else(|| format!("missing `{field}` array"))?;
    Ok(list
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.trim().is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_search_step() {
        let object = json!({
            "think": "need external info",
            "action": "search",
            "search": {"searchRequests": ["capital of France"]}
        });
        let step = AgentStep::from_llm_object(&object).unwrap();
        assert_eq!(step.think, "need external info");
        assert_eq!(
            step.action,
            StepAction::Search {
                search_requests: vec!["capital of France".into()]
            }
        );
    }

    #[test]
    fn parse_truncates_slack_search_requests() {
        let requests: Vec<String> = (0..12).map(|i| format!("query {i}")).collect();
        let object = json!({
            "think": "",
            "action": "search",
            "search": {"searchRequests": requests}
        });
        let step = AgentStep::from_llm_object(&object).unwrap();
        match step.action {
            StepAction::Search { search_requests } => {
                assert_eq!(search_requests.len(), MAX_QUERIES_PER_STEP);
            }
            other => panic!("expected search, got {other:?}"),
        }
    }

    #[test]
    fn parse_rejects_empty_search() {
        let object = json!({
            "think": "",
            "action": "search",
            "search": {"searchRequests": []}
        });
        assert!(AgentStep::from_llm_object(&object).is_err());
    }

    #[test]
    fn parse_answer_with_references() {
        let object = json!({
            "think": "confident now",
            "action": "answer",
            "answer": {
                "answer": "Paris is the capital of France. [^1]",
                "references": [
                    {"exactQuote": "Paris is the capital", "url": "https://en.wikipedia.org/wiki/Paris", "dateTime": ""}
                ]
            }
        });
        let step = AgentStep::from_llm_object(&object).unwrap();
        match step.action {
            StepAction::Answer {
                answer,
                references,
                is_final,
                ..
            } => {
                assert!(answer.starts_with("Paris"));
                assert_eq!(references.len(), 1);
                assert_eq!(references[0].exact_quote, "Paris is the capital");
                assert!(!is_final);
            }
            other => panic!("expected answer, got {other:?}"),
        }
    }

    #[test]
    fn parse_missing_action_fails() {
        let object = json!({"think": "hm"});
        assert!(AgentStep::from_llm_object(&object).is_err());
    }

    #[test]
    fn parse_unknown_action_fails() {
        let object = json!({"think": "", "action": "dance"});
        assert!(AgentStep::from_llm_object(&object).is_err());
    }

    #[test]
    fn step_serializes_with_action_tag() {
        let step = AgentStep {
            think: "t".into(),
            action: StepAction::Reflect {
                questions_to_answer: vec!["what is X?".into()],
            },
        };
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["action"], "reflect");
        assert_eq!(value["questionsToAnswer"][0], "what is X?");
    }

    #[test]
    fn knowledge_item_serializes_kind_as_type() {
        let item = KnowledgeItem::new("q", "a", KnowledgeKind::SideInfo);
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["type"], "side-info");
    }
}
