//! Coding collaborator: the sandbox interface and an LLM-backed code
//! generator front end.
//!
//! The agent's coding action delegates data chores (counting, filtering,
//! regex extraction, transformations) to a sandboxed executor. Execution
//! itself is external — [`CodeRunner`] is the seam — while
//! [`LlmCodeSandbox`] covers the generation half: it asks the `coder` tool
//! for a program and hands it to the runner together with the session
//! context.

use crate::actions::KnowledgeItem;
use crate::llm::ObjectGenerator;
use crate::schema::{CodeSolution, SchemaRegistry};
use crate::urls::UrlSnippet;
use crate::Message;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by the sandbox methods.
pub type SandboxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send + 'a>>;

/// Session state made available to the generated program.
#[derive(Serialize, Clone, Debug, Default)]
pub struct SandboxContext {
    #[serde(rename = "allContext")]
    pub all_context: Value,
    #[serde(rename = "visitedURLs")]
    pub visited_urls: Vec<String>,
    #[serde(rename = "allURLs")]
    pub all_urls: Vec<UrlSnippet>,
    #[serde(rename = "allKnowledge")]
    pub all_knowledge: Vec<KnowledgeItem>,
}

/// A solved coding issue: the program and what it printed.
#[derive(Clone, Debug)]
pub struct SandboxSolution {
    pub output: String,
    pub code: String,
}

/// The code-sandbox collaborator.
pub trait CodeSandbox: Send + Sync {
    fn solve(&self, issue: &str, context: &SandboxContext) -> SandboxFuture<'_, SandboxSolution>;
}

/// Executes a generated program against the sandbox context and returns its
/// output. This is the externally provided, actually-sandboxed half.
pub trait CodeRunner: Send + Sync {
    fn run(&self, code: &str, context: &SandboxContext) -> SandboxFuture<'_, String>;
}

// ── LLM-backed sandbox ─────────────────────────────────────────────

/// Generates code with the `coder` tool, then delegates execution to a
/// [`CodeRunner`].
pub struct LlmCodeSandbox {
    generator: ObjectGenerator,
    registry: SchemaRegistry,
    runner: Arc<dyn CodeRunner>,
}

impl LlmCodeSandbox {
    pub fn new(
        generator: ObjectGenerator,
        registry: SchemaRegistry,
        runner: Arc<dyn CodeRunner>,
    ) -> Self {
        Self {
            generator,
            registry,
            runner,
        }
    }
}

impl CodeSandbox for LlmCodeSandbox {
    fn solve(&self, issue: &str, context: &SandboxContext) -> SandboxFuture<'_, SandboxSolution> {
        let issue = issue.to_string();
        let context = context.clone();
        Box::pin(async move {
            let system = "You are an expert engineer solving a data-processing issue with a \
                short program. The variables `allContext`, `visitedURLs`, `allURLs` and \
                `allKnowledge` are already in scope; do not redeclare them. Return the result \
                with a `return` statement.";
            let user = format!(
                "Issue:\n{issue}\n\nAvailable data summary: {} knowledge items, {} URLs, {} visited.",
                context.all_knowledge.len(),
                context.all_urls.len(),
                context.visited_urls.len(),
            );

            let solution: CodeSolution = self
                .generator
                .generate_parsed(
                    "coder",
                    self.registry.code_generator_schema(),
                    system,
                    vec![Message::user(user)],
                )
                .await?;

            let output = self.runner.run(&solution.code, &context).await?;
            Ok(SandboxSolution {
                output,
                code: solution.code,
            })
        })
    }
}

/// Placeholder sandbox for deployments without an executor. Every issue
/// fails, which the dispatcher degrades into a diary entry.
pub struct UnconfiguredSandbox;

impl CodeSandbox for UnconfiguredSandbox {
    fn solve(&self, _issue: &str, _context: &SandboxContext) -> SandboxFuture<'_, SandboxSolution> {
        Box::pin(async { Err("code sandbox not configured".to_string()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{GenerateRequest, GenerateResult, LlmClient, LlmFuture};
    use crate::trackers::{TokenUsage, TrackerContext};
    use serde_json::json;

    struct CoderLlm;
    impl LlmClient for CoderLlm {
        fn generate_object(&self, _request: GenerateRequest) -> LlmFuture<'_> {
            Box::pin(async {
                Ok(GenerateResult {
                    object: json!({"think": "count them", "code": "return allKnowledge.length"}),
                    usage: TokenUsage::new(5, 5),
                })
            })
        }
    }

    struct EchoRunner;
    impl CodeRunner for EchoRunner {
        fn run(&self, code: &str, _context: &SandboxContext) -> SandboxFuture<'_, String> {
            let code = code.to_string();
            Box::pin(async move { Ok(format!("ran: {code}")) })
        }
    }

    #[tokio::test]
    async fn llm_sandbox_generates_then_runs() {
        let generator =
            ObjectGenerator::new(Arc::new(CoderLlm), TrackerContext::new(1000));
        let sandbox =
            LlmCodeSandbox::new(generator, SchemaRegistry::new(), Arc::new(EchoRunner));

        let solution = sandbox
            .solve("count the knowledge items", &SandboxContext::default())
            .await
            .unwrap();
        assert_eq!(solution.code, "return allKnowledge.length");
        assert_eq!(solution.output, "ran: return allKnowledge.length");
    }

    #[tokio::test]
    async fn unconfigured_sandbox_fails_cleanly() {
        let err = UnconfiguredSandbox
            .solve("anything", &SandboxContext::default())
            .await
            .unwrap_err();
        assert!(err.contains("not configured"));
    }
}
