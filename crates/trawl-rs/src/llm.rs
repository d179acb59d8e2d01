//! LLM client abstraction and the validating object generator.
//!
//! [`LlmClient`] is the narrow interface the agent needs: one structured
//! generation call. [`ChatCompletionsClient`] implements it against any
//! OpenAI-compatible chat completions endpoint using strict JSON-schema
//! response formatting. [`ObjectGenerator`] wraps a client with the pieces
//! every call site wants: per-tool retry on transient failures, token-usage
//! tracking, and validation of the returned object against the schema it was
//! prompted with. Model output is untrusted — an object that fails
//! validation is an error the call site degrades from, never a panic.

use crate::config::{Settings, ToolSettings};
use crate::trackers::{TokenUsage, TrackerContext};
use crate::{Message, MessageRole};
use serde::Deserialize;
use serde_json::{Value, json};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Boxed future returned by [`LlmClient::generate_object`].
pub type LlmFuture<'a> = Pin<Box<dyn Future<Output = Result<GenerateResult, String>> + Send + 'a>>;

// ── Request / result ───────────────────────────────────────────────

/// One structured-output generation request.
#[derive(Clone, Debug)]
pub struct GenerateRequest {
    /// Logical tool making the call (`agent`, `evaluator`, `dedup`, ...).
    /// Selects the per-tool model/temperature/token overrides.
    pub tool: String,
    /// JSON schema the returned object must validate against.
    pub schema: Value,
    /// System prompt.
    pub system: String,
    /// Conversation messages (without the system message).
    pub messages: Vec<Message>,
}

/// A generated object plus the usage the provider reported for the call.
#[derive(Clone, Debug)]
pub struct GenerateResult {
    pub object: Value,
    pub usage: TokenUsage,
}

/// The language-model collaborator.
pub trait LlmClient: Send + Sync {
    fn generate_object(&self, request: GenerateRequest) -> LlmFuture<'_>;
}

// ── Error classification ───────────────────────────────────────────

/// Whether an error string indicates a transient (retryable) failure.
pub fn is_transient_error(error: &str) -> bool {
    let transient_statuses = ["429", "500", "502", "503", "504"];
    if transient_statuses
        .iter()
        .any(|s| error.contains(&format!("HTTP {s}")))
    {
        return true;
    }

    let lower = error.to_lowercase();
    [
        "request failed:",
        "connection reset",
        "connection refused",
        "timed out",
        "timeout",
        "broken pipe",
        "network",
    ]
    .iter()
    .any(|p| lower.contains(p))
}

// ── OpenAI-compatible client ───────────────────────────────────────

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<RawUsage>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

#[derive(Deserialize, Debug)]
struct RawUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

/// Async HTTP client for an OpenAI-compatible chat completions endpoint.
///
/// The per-tool model/temperature/maxTokens overrides come from
/// [`Settings`]; the returned JSON object is produced via strict
/// `response_format: json_schema`.
pub struct ChatCompletionsClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    settings: Settings,
}

impl ChatCompletionsClient {
    pub fn new(settings: &Settings) -> Result<Self, String> {
        let (base_url, api_key) = settings.llm_endpoint()?;
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("trawl-rs/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(120));
        if let Some(proxy_url) = settings.https_proxy.as_deref() {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| format!("invalid https_proxy `{proxy_url}`: {e}"))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            base_url,
            api_key,
            settings: settings.clone(),
        })
    }

    async fn chat(&self, request: &GenerateRequest) -> Result<GenerateResult, String> {
        let tool_cfg: ToolSettings = self.settings.tool_config(&request.tool);

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(json!({"role": "system", "content": request.system}));
        for msg in &request.messages {
            messages.push(json!({
                "role": match msg.role {
                    MessageRole::System => "system",
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                },
                "content": msg.content,
            }));
        }

        let body = json!({
            "model": tool_cfg.model,
            "messages": messages,
            "max_tokens": tool_cfg.max_tokens,
            "temperature": tool_cfg.temperature,
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": request.tool,
                    "schema": request.schema,
                    "strict": true,
                },
            },
        });

        debug!(
            "LLM request: tool={}, model={}, messages={}, temp={}",
            request.tool,
            tool_cfg.model,
            messages.len(),
            tool_cfg.temperature,
        );

        let resp = self
            .client
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| format!("failed to read response: {e}"))?;

        if !status.is_success() {
            return Err(format!("LLM API HTTP {status}: {text}"));
        }

        let parsed: RawChatResponse =
            serde_json::from_str(&text).map_err(|e| format!("failed to parse response: {e}"))?;

        if let Some(err) = parsed.error {
            return Err(format!("LLM API error: {}", err.message));
        }

        let content = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message.content)
            .ok_or_else(|| "empty LLM response".to_string())?;

        let object: Value = serde_json::from_str(&content)
            .map_err(|e| format!("LLM returned non-JSON content: {e}"))?;

        let usage = parsed
            .usage
            .map(|u| {
                TokenUsage::new(
                    u.prompt_tokens.unwrap_or(0),
                    u.completion_tokens.unwrap_or(0),
                )
            })
            .unwrap_or_default();

        Ok(GenerateResult { object, usage })
    }
}

impl LlmClient for ChatCompletionsClient {
    fn generate_object(&self, request: GenerateRequest) -> LlmFuture<'_> {
        Box::pin(async move { self.chat(&request).await })
    }
}

// ── Object generator ───────────────────────────────────────────────

/// Retries when the provider hiccups, before the call is given up on.
const MAX_TRANSIENT_RETRIES: u32 = 2;

/// Wraps an [`LlmClient`] with usage tracking, transient-error retry, and
/// schema validation of the returned object.
#[derive(Clone)]
pub struct ObjectGenerator {
    client: Arc<dyn LlmClient>,
    trackers: TrackerContext,
}

impl ObjectGenerator {
    pub fn new(client: Arc<dyn LlmClient>, trackers: TrackerContext) -> Self {
        Self { client, trackers }
    }

    pub fn trackers(&self) -> &TrackerContext {
        &self.trackers
    }

    /// Generate an object and validate it against `schema`.
    ///
    /// Usage is tracked for every completed call, including ones whose
    /// object later fails validation — those tokens were still spent.
    pub async fn generate(
        &self,
        tool: &str,
        schema: Value,
        system: impl Into<String>,
        messages: Vec<Message>,
    ) -> Result<Value, String> {
        let request = GenerateRequest {
            tool: tool.to_string(),
            schema: schema.clone(),
            system: system.into(),
            messages,
        };

        let mut last_error = String::new();
        for attempt in 0..=MAX_TRANSIENT_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
            }
            match self.client.generate_object(request.clone()).await {
                Ok(result) => {
                    self.trackers.track_usage(tool, result.usage);
                    validate_against(&schema, &result.object)?;
                    return Ok(result.object);
                }
                Err(e) if is_transient_error(&e) && attempt < MAX_TRANSIENT_RETRIES => {
                    warn!("transient LLM failure for tool `{tool}` (attempt {attempt}): {e}");
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    /// Generate and deserialize into `T`.
    pub async fn generate_parsed<T: serde::de::DeserializeOwned>(
        &self,
        tool: &str,
        schema: Value,
        system: impl Into<String>,
        messages: Vec<Message>,
    ) -> Result<T, String> {
        let object = self.generate(tool, schema, system, messages).await?;
        serde_json::from_value(object).map_err(|e| format!("unexpected `{tool}` payload: {e}"))
    }
}

/// Validate `instance` against `schema`, collecting every violation.
fn validate_against(schema: &Value, instance: &Value) -> Result<(), String> {
    let validator = match jsonschema::validator_for(schema) {
        Ok(v) => v,
        // If the schema itself is invalid, skip validation.
        Err(_) => return Ok(()),
    };
    let errors: Vec<String> = validator
        .iter_errors(instance)
        .map(|e| format!("{}: {e}", e.instance_path()))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(format!("schema validation failed: {}", errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedClient {
        responses: std::sync::Mutex<Vec<Result<GenerateResult, String>>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Result<GenerateResult, String>>) -> Self {
            Self {
                responses: std::sync::Mutex::new(responses),
            }
        }
    }

    impl LlmClient for ScriptedClient {
        fn generate_object(&self, _request: GenerateRequest) -> LlmFuture<'_> {
            let next = self.responses.lock().unwrap().remove(0);
            Box::pin(async move { next })
        }
    }

    fn probe_schema() -> Value {
        json!({
            "type": "object",
            "properties": {"answer": {"type": "string"}},
            "required": ["answer"],
        })
    }

    #[tokio::test]
    async fn generate_tracks_usage_and_validates() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(GenerateResult {
            object: json!({"answer": "Paris"}),
            usage: TokenUsage::new(100, 20),
        })]));
        let trackers = TrackerContext::new(10_000);
        let generator = ObjectGenerator::new(client, trackers.clone());

        let object = generator
            .generate("agent", probe_schema(), "system", vec![Message::user("q")])
            .await
            .unwrap();
        assert_eq!(object["answer"], "Paris");
        assert_eq!(trackers.total_tokens(), 120);
    }

    #[tokio::test]
    async fn generate_rejects_schema_violation() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(GenerateResult {
            object: json!({"wrong": true}),
            usage: TokenUsage::new(10, 5),
        })]));
        let trackers = TrackerContext::new(10_000);
        let generator = ObjectGenerator::new(client, trackers.clone());

        let err = generator
            .generate("agent", probe_schema(), "system", vec![])
            .await
            .unwrap_err();
        assert!(err.contains("schema validation failed"), "{err}");
        // Tokens were spent even though the object was rejected.
        assert_eq!(trackers.total_tokens(), 15);
    }

    #[tokio::test]
    async fn generate_retries_transient_errors() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err("LLM API HTTP 503: overloaded".to_string()),
            Ok(GenerateResult {
                object: json!({"answer": "ok"}),
                usage: TokenUsage::new(1, 1),
            }),
        ]));
        let generator = ObjectGenerator::new(client, TrackerContext::new(100));

        let object = generator
            .generate("dedup", probe_schema(), "system", vec![])
            .await
            .unwrap();
        assert_eq!(object["answer"], "ok");
    }

    #[tokio::test]
    async fn generate_gives_up_on_permanent_errors() {
        let client = Arc::new(ScriptedClient::new(vec![Err(
            "LLM API HTTP 401: bad key".to_string()
        )]));
        let generator = ObjectGenerator::new(client, TrackerContext::new(100));

        let err = generator
            .generate("agent", probe_schema(), "system", vec![])
            .await
            .unwrap_err();
        assert!(err.contains("401"));
    }

    #[test]
    fn transient_classification() {
        assert!(is_transient_error("LLM API HTTP 429: rate limited"));
        assert!(is_transient_error("request failed: connection reset"));
        assert!(!is_transient_error("LLM API HTTP 400: bad request"));
        assert!(!is_transient_error("some other error"));
    }
}
