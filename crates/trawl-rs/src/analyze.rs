//! Error analyzer: turns the diary of a failed attempt into a recap, a root
//! cause, and an improvement direction.
//!
//! Runs once per rejected answer to the original question, right before the
//! fail-reset wipes the diary. Its output is the only memory the next
//! attempt keeps of what went wrong.

use crate::llm::ObjectGenerator;
use crate::schema::SchemaRegistry;
use crate::Message;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The analyzer's summary of a failed attempt. Doubles as the schema source
/// for the `errorAnalyzer` tool.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default)]
pub struct ErrorAnalysis {
    /// Recap of the actions taken and the steps conducted in first person
    /// narrative.
    #[schemars(length(max = 500))]
    pub recap: String,
    /// Which action or the step was the root cause of the answer rejection.
    #[schemars(length(max = 500))]
    pub blame: String,
    /// Suggested key improvement for the next iteration, concise, no bullet
    /// points.
    #[schemars(length(max = 500))]
    pub improvement: String,
}

impl ErrorAnalysis {
    /// Render as the knowledge-item answer body appended after a failure.
    pub fn to_answer_body(&self, evaluator_think: &str) -> String {
        format!(
            "{evaluator_think}\n\n{}\n\n{}\n\n{}",
            self.recap, self.blame, self.improvement,
        )
    }
}

/// Analyze the steps of a failed attempt.
///
/// Degrades to an empty analysis when the call fails — the failure diary
/// entry still lands in knowledge either way.
pub async fn analyze_steps(
    generator: &ObjectGenerator,
    registry: &SchemaRegistry,
    diary: &[String],
) -> ErrorAnalysis {
    let system = "You review a research agent's own action diary after its final answer was \
        rejected. Recap what the agent did in first person, identify which single action or \
        step caused the rejection, and state the key improvement for the next attempt.";
    let user = format!("<diary>\n{}\n</diary>", diary.join("\n"));

    match generator
        .generate_parsed::<ErrorAnalysis>(
            "errorAnalyzer",
            registry.error_analysis_schema(),
            system,
            vec![Message::user(user)],
        )
        .await
    {
        Ok(analysis) => analysis,
        Err(e) => {
            tracing::warn!("error analysis failed: {e}");
            ErrorAnalysis::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{GenerateRequest, GenerateResult, LlmClient, LlmFuture};
    use crate::trackers::{TokenUsage, TrackerContext};
    use serde_json::json;
    use std::sync::Arc;

    struct AnalysisLlm;
    impl LlmClient for AnalysisLlm {
        fn generate_object(&self, request: GenerateRequest) -> LlmFuture<'_> {
            assert_eq!(request.tool, "errorAnalyzer");
            assert!(request.messages[0].content.contains("<diary>"));
            Box::pin(async {
                Ok(GenerateResult {
                    object: json!({
                        "recap": "I searched twice and answered from snippets.",
                        "blame": "I never visited a primary source.",
                        "improvement": "Visit the top-ranked URL before answering.",
                    }),
                    usage: TokenUsage::new(10, 10),
                })
            })
        }
    }

    struct DeadLlm;
    impl LlmClient for DeadLlm {
        fn generate_object(&self, _request: GenerateRequest) -> LlmFuture<'_> {
            Box::pin(async { Err("LLM API HTTP 400: nope".to_string()) })
        }
    }

    #[tokio::test]
    async fn analysis_parses_all_three_fields() {
        let generator = ObjectGenerator::new(Arc::new(AnalysisLlm), TrackerContext::new(1000));
        let registry = SchemaRegistry::new();
        let analysis = analyze_steps(&generator, &registry, &["step one".to_string()]).await;
        assert!(analysis.recap.contains("searched twice"));
        assert!(analysis.blame.contains("primary source"));
        assert!(analysis.improvement.contains("top-ranked URL"));
    }

    #[tokio::test]
    async fn analysis_degrades_to_empty() {
        let generator = ObjectGenerator::new(Arc::new(DeadLlm), TrackerContext::new(1000));
        let registry = SchemaRegistry::new();
        let analysis = analyze_steps(&generator, &registry, &[]).await;
        assert!(analysis.recap.is_empty());
    }

    #[test]
    fn answer_body_stacks_sections() {
        let analysis = ErrorAnalysis {
            recap: "r".into(),
            blame: "b".into(),
            improvement: "i".into(),
        };
        assert_eq!(analysis.to_answer_body("t"), "t\n\nr\n\nb\n\ni");
    }
}
