//! Schema registry: per-step structured-output schemas gated by the allowed
//! action set, plus the fixed schemas for every auxiliary LLM tool.
//!
//! The gated agent schema and [`AgentStep::from_llm_object`]
//! (crate::actions::AgentStep::from_llm_object) are maintained together — the
//! registry decides which variants exist, the parser reads exactly those
//! variants, and [`ObjectGenerator`](crate::llm::ObjectGenerator) validates
//! the model output against the emitted schema in between. Max-length
//! constraints live in the schema; list-size constraints are additionally
//! enforced by truncation in the parser.

use crate::agent::state::GateVector;
use crate::{MAX_QUERIES_PER_STEP, MAX_REFLECT_PER_STEP, MAX_URLS_PER_STEP, json_schema_for};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};

// ── Parsed auxiliary payloads ──────────────────────────────────────
//
// The fixed-shape tool responses are plain derives: the same struct is both
// the schema source (via `json_schema_for`) and the parse target, so the two
// cannot drift. Only the dynamic schemas (the gated agent step and the
// per-kind evaluator verdicts) are assembled by hand below.

/// Output of the language-detection call.
#[derive(Deserialize, JsonSchema, Clone, Debug)]
pub struct LanguageVerdict {
    /// ISO 639-1 language code
    #[serde(rename = "langCode")]
    #[schemars(length(max = 10))]
    pub lang_code: String,
    /// [vibe & tone] in [what language], such as formal english, informal
    /// chinese, technical german, humor english, slang, genZ, emojis etc.
    #[serde(rename = "langStyle")]
    #[schemars(length(max = 100))]
    pub lang_style: String,
}

/// Output of the one-shot question-evaluation call: which quality metrics the
/// original question requires.
#[derive(Deserialize, JsonSchema, Clone, Debug)]
pub struct QuestionRequirements {
    /// A very concise explain of why those checks are needed.
    #[schemars(length(max = 500))]
    pub think: String,
    #[serde(rename = "needsDefinitive")]
    pub needs_definitive: bool,
    #[serde(rename = "needsFreshness")]
    pub needs_freshness: bool,
    #[serde(rename = "needsPlurality")]
    pub needs_plurality: bool,
    #[serde(rename = "needsCompleteness")]
    pub needs_completeness: bool,
}

/// Output of the dedup call.
#[derive(Deserialize, JsonSchema, Clone, Debug, Default)]
pub struct DedupResult {
    /// Explain why you consider those queries distinct or duplicated.
    #[schemars(length(max = 500))]
    pub think: String,
    /// Queries that carry new information compared to the existing set.
    /// Preserve the original wording.
    pub unique_queries: Vec<String>,
}

/// Output of the query-rewriter call.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct QueryRewrite {
    #[serde(default)]
    pub think: String,
    #[serde(default)]
    pub queries: Vec<crate::actions::SerpQuery>,
}

/// Output of the code-generator call.
#[derive(Deserialize, JsonSchema, Clone, Debug)]
pub struct CodeSolution {
    /// Short explain or comments on the thought process behind the code.
    #[schemars(length(max = 200))]
    pub think: String,
    /// The code that solves the problem; always use a `return` statement to
    /// return the result. Focus on solving the core problem, without error
    /// handling or code comments. Variables that are already available must
    /// not be redeclared, especially big long strings or arrays.
    pub code: String,
}

// ── Registry ───────────────────────────────────────────────────────

/// Produces every JSON schema handed to the LLM, parameterized by the
/// detected language style so `think` fields come back in the user's voice.
#[derive(Clone, Debug)]
pub struct SchemaRegistry {
    language_style: String,
    language_code: String,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self {
            language_style: "English".to_string(),
            language_code: "en".to_string(),
        }
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_language(&mut self, verdict: &LanguageVerdict) {
        if !verdict.lang_code.trim().is_empty() {
            self.language_code = verdict.lang_code.trim().to_string();
        }
        if !verdict.lang_style.trim().is_empty() {
            self.language_style = verdict.lang_style.trim().to_string();
        }
    }

    pub fn language_style(&self) -> &str {
        &self.language_style
    }

    pub fn language_code(&self) -> &str {
        &self.language_code
    }

    // ── Agent step schema ─────────────────────────────────────────

    /// The gated per-step schema: `think`, an `action` enum limited to the
    /// allowed variants, and one payload object per allowed variant.
    pub fn agent_schema(&self, gates: &GateVector, current_question: Option<&str>) -> Value {
        let allowed = gates.allowed_actions();

        let mut properties = serde_json::Map::new();
        properties.insert(
            "think".into(),
            json!({
                "type": "string",
                "maxLength": 500,
                "description": format!(
                    "Concisely explain your reasoning process in {}.",
                    self.language_style
                ),
            }),
        );
        properties.insert(
            "action".into(),
            json!({
                "type": "string",
                "enum": allowed,
                "description": "Choose exactly one best action from the available actions, \
                    fill in the corresponding action schema required. Keep the reasons in mind: \
                    (1) What specific information is still needed? \
                    (2) Why is this action most likely to provide that information? \
                    (3) What alternatives did you consider and why were they rejected? \
                    (4) How will this action advance toward the complete answer?",
            }),
        );

        if gates.search {
            properties.insert(
                "search".into(),
                json!({
                    "type": "object",
                    "properties": {
                        "searchRequests": {
                            "type": "array",
                            "minItems": 1,
                            "maxItems": MAX_QUERIES_PER_STEP,
                            "items": {"type": "string", "minLength": 1, "maxLength": 30},
                            "description": format!(
                                "Required when action='search'. Always prefer a single request, \
                                 only add another request if the original question covers multiple \
                                 aspects or elements and one search request is definitely not enough, \
                                 each request focus on one specific aspect of the original question. \
                                 Minimize mutual information between each request. \
                                 Maximum {MAX_QUERIES_PER_STEP} search requests."
                            ),
                        }
                    },
                    "required": ["searchRequests"],
                }),
            );
        }
        if gates.coding {
            properties.insert(
                "coding".into(),
                json!({
                    "type": "object",
                    "properties": {
                        "codingIssue": {
                            "type": "string",
                            "maxLength": 500,
                            "description": "Required when action='coding'. Describe what issue \
                                to solve with coding, format like a github issue ticket. \
                                Specify the input value when it is short.",
                        }
                    },
                    "required": ["codingIssue"],
                }),
            );
        }
        if gates.answer {
            properties.insert("answer".into(), self.answer_payload_schema());
        }
        if gates.reflect {
            let og = current_question.unwrap_or_default();
            properties.insert(
                "reflect".into(),
                json!({
                    "type": "object",
                    "properties": {
                        "questionsToAnswer": {
                            "type": "array",
                            "maxItems": MAX_REFLECT_PER_STEP,
                            "items": {"type": "string"},
                            "description": format!(
                                "Required when action='reflect'. Reflection and planing, \
                                 generate a list of most important questions to fill the knowledge \
                                 gaps to <og-question> {og} </og-question>. \
                                 Maximum provide {MAX_REFLECT_PER_STEP} reflect questions."
                            ),
                        }
                    },
                    "required": ["questionsToAnswer"],
                }),
            );
        }
        if gates.visit {
            properties.insert(
                "visit".into(),
                json!({
                    "type": "object",
                    "properties": {
                        "URLTargets": {
                            "type": "array",
                            "maxItems": MAX_URLS_PER_STEP,
                            "items": {"type": "string"},
                            "description": format!(
                                "Required when action='visit'. Must be an array of URLs, choose \
                                 up the most relevant {MAX_URLS_PER_STEP} URLs to visit"
                            ),
                        }
                    },
                    "required": ["URLTargets"],
                }),
            );
        }

        json!({
            "type": "object",
            "properties": Value::Object(properties),
            "required": ["think", "action"],
        })
    }

    fn answer_payload_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "references": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "exactQuote": {
                                "type": "string",
                                "maxLength": 30,
                                "description": "Exact relevant quote from the document, must be \
                                    a soundbite, short and to the point, no fluff",
                            },
                            "url": {
                                "type": "string",
                                "maxLength": 100,
                                "description": "source URL; must be copy directly from previous \
                                    message's <url>, avoid example.com or any placeholder fake URLs",
                            },
                            "dateTime": {
                                "type": "string",
                                "maxLength": 16,
                                "description": "Use original message's <answer-datetime> if available.",
                            },
                        },
                        "required": ["exactQuote", "url", "dateTime"],
                    },
                    "description": "Required when action='answer'. Must be an array of references \
                        that support the answer, each reference must contain an exact quote, \
                        URL and datetime",
                },
                "answer": {
                    "type": "string",
                    "description": format!(
                        "Required when action='answer'. Use all your knowledge you have collected, \
                         cover multiple aspects if needed. Must be definitive, no ambiguity, no \
                         uncertainty, no disclaimers. Must in {} and confident. Use markdown \
                         footnote syntax like [^1], [^2] to refer the corresponding reference item. \
                         DO NOT contain any placeholder variables in the final answer.",
                        self.language_style
                    ),
                },
            },
            "required": ["answer", "references"],
        })
    }

    // ── Auxiliary tool schemas ────────────────────────────────────

    /// Language detection: ISO code plus a descriptive style phrase.
    pub fn language_schema(&self) -> Value {
        json_schema_for::<LanguageVerdict>()
    }

    /// Question evaluation: which metric checks the question needs.
    pub fn question_requirements_schema(&self) -> Value {
        json_schema_for::<QuestionRequirements>()
    }

    /// Semantic query/question dedup.
    pub fn dedup_schema(&self) -> Value {
        json_schema_for::<DedupResult>()
    }

    /// Query rewriter: refined SERP queries grounded on first-pass snippets.
    pub fn query_rewriter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "think": {
                    "type": "string",
                    "maxLength": 500,
                    "description": "Explain why you choose those search queries.",
                },
                "queries": {
                    "type": "array",
                    "maxItems": MAX_QUERIES_PER_STEP,
                    "items": {
                        "type": "object",
                        "properties": {
                            "q": {
                                "type": "string",
                                "maxLength": 50,
                                "description": "keyword-based search query, 2-3 words preferred, \
                                    total length < 30 characters",
                            },
                            "tbs": {
                                "type": "string",
                                "enum": ["qdr:h", "qdr:d", "qdr:w", "qdr:m", "qdr:y"],
                                "description": "time-based search filter, must use this field if \
                                    the search request asks for latest info. qdr:h for past hour, \
                                    qdr:d for past 24 hours, qdr:w for past week, qdr:m for past \
                                    month, qdr:y for past year. Choose exactly one.",
                            },
                            "gl": {
                                "type": "string",
                                "maxLength": 2,
                                "description": "defines the country to use for the search. \
                                    a two-letter country code.",
                            },
                            "hl": {
                                "type": "string",
                                "maxLength": 2,
                                "description": "the language to use for the search. \
                                    a two-letter language code.",
                            },
                            "location": {
                                "type": "string",
                                "description": "defines from where you want the search to \
                                    originate. City level is recommended.",
                            },
                        },
                        "required": ["q"],
                    },
                    "description": format!(
                        "Array of search keywords queries, orthogonal to each other. \
                         Maximum {MAX_QUERIES_PER_STEP} queries allowed."
                    ),
                },
            },
            "required": ["think", "queries"],
        })
    }

    /// Code generator used by the sandbox front end.
    pub fn code_generator_schema(&self) -> Value {
        json_schema_for::<CodeSolution>()
    }

    /// Post-failure diary analysis.
    pub fn error_analysis_schema(&self) -> Value {
        json_schema_for::<crate::analyze::ErrorAnalysis>()
    }

    /// The verdict schema for one evaluator kind. Every verdict carries
    /// `type`, `think`, and `pass`; the analysis payload differs per kind.
    pub fn evaluator_schema(&self, kind: crate::evaluate::EvaluationKind) -> Value {
        use crate::evaluate::EvaluationKind::*;

        let mut properties = serde_json::Map::new();
        properties.insert("type".into(), json!({"type": "string", "const": kind.as_str()}));
        properties.insert(
            "think".into(),
            json!({
                "type": "string",
                "maxLength": 500,
                "description": format!(
                    "Explanation the thought process why the answer does not pass the \
                     evaluation, in {}.",
                    self.language_style
                ),
            }),
        );
        let mut required = vec!["type", "think", "pass"];

        match kind {
            Definitive => {
                properties.insert("pass".into(), json!({"type": "boolean"}));
            }
            Freshness => {
                properties.insert(
                    "freshness_analysis".into(),
                    json!({
                        "type": "object",
                        "properties": {
                            "days_ago": {"type": "integer", "description": "datetime of the **answer** relative to today, in days"},
                            "max_age_days": {"type": "integer", "description": "maximum acceptable age for this question, in days"},
                        },
                        "required": ["days_ago", "max_age_days"],
                    }),
                );
                properties.insert(
                    "pass".into(),
                    json!({"type": "boolean", "description": "If \"days_ago\" <= \"max_age_days\" then pass!"}),
                );
                required.insert(2, "freshness_analysis");
            }
            Plurality => {
                properties.insert(
                    "plurality_analysis".into(),
                    json!({
                        "type": "object",
                        "properties": {
                            "minimum_count_required": {"type": "integer"},
                            "actual_count_provided": {"type": "integer"},
                        },
                        "required": ["minimum_count_required", "actual_count_provided"],
                    }),
                );
                properties.insert(
                    "pass".into(),
                    json!({"type": "boolean", "description": "If count_provided >= count_expected then pass!"}),
                );
                required.insert(2, "plurality_analysis");
            }
            Completeness => {
                properties.insert(
                    "completeness_analysis".into(),
                    json!({
                        "type": "object",
                        "properties": {
                            "aspects_expected": {"type": "string", "description": "Comma-separated list of aspects the question asks about"},
                            "aspects_provided": {"type": "string", "description": "Comma-separated list of aspects the answer covers"},
                        },
                        "required": ["aspects_expected", "aspects_provided"],
                    }),
                );
                properties.insert("pass".into(), json!({"type": "boolean"}));
                required.insert(2, "completeness_analysis");
            }
            Attribution => {
                properties.insert(
                    "exactQuote".into(),
                    json!({
                        "type": "string",
                        "maxLength": 200,
                        "description": "Exact relevant quote and evidence from the source.",
                    }),
                );
                properties.insert("pass".into(), json!({"type": "boolean"}));
            }
            Strict => {
                properties.insert(
                    "improvement_plan".into(),
                    json!({
                        "type": "string",
                        "maxLength": 500,
                        "description": "Explain detailed and actionable instructions on how to \
                            improve the answer. Starts with \"For the best answer, you must...\"",
                    }),
                );
                properties.insert("pass".into(), json!({"type": "boolean"}));
                required.insert(2, "improvement_plan");
            }
        }

        json!({
            "type": "object",
            "properties": Value::Object(properties),
            "required": required,
        })
    }
}
