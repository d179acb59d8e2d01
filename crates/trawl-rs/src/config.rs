//! Configuration: environment variables layered over an optional
//! `config.json`, with per-tool model overrides.
//!
//! The file carries defaults (LLM provider, search provider, step sleep) and
//! per-provider model tables; any key in its `env` section can be overridden
//! by a real environment variable of the same name. Missing API keys for the
//! selected providers are fatal — they abort before the loop starts.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

// ── Provider enums ─────────────────────────────────────────────────

/// Which LLM backend serves the structured-output calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAi,
    Gemini,
    Vertex,
}

impl FromStr for LlmProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(LlmProvider::OpenAi),
            "gemini" => Ok(LlmProvider::Gemini),
            "vertex" => Ok(LlmProvider::Vertex),
            other => Err(format!("invalid LLM provider: {other}")),
        }
    }
}

/// Which web-search backend executes queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchProviderKind {
    Jina,
    Duck,
    Brave,
    Serper,
}

impl FromStr for SearchProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "jina" => Ok(SearchProviderKind::Jina),
            "duck" => Ok(SearchProviderKind::Duck),
            "brave" => Ok(SearchProviderKind::Brave),
            "serper" => Ok(SearchProviderKind::Serper),
            other => Err(format!("invalid search provider: {other}")),
        }
    }
}

// ── Tool settings ──────────────────────────────────────────────────

/// Resolved model settings for one logical tool.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Partial override from the config file's per-tool table.
#[derive(Clone, Debug, Default, Deserialize)]
struct ToolOverride {
    model: Option<String>,
    temperature: Option<f32>,
    #[serde(rename = "maxTokens")]
    max_tokens: Option<u32>,
}

#[derive(Clone, Debug, Deserialize)]
struct ProviderModels {
    default: DefaultModel,
    #[serde(default)]
    tools: HashMap<String, ToolOverride>,
}

#[derive(Clone, Debug, Deserialize)]
struct DefaultModel {
    model: String,
    #[serde(default)]
    temperature: f32,
    #[serde(rename = "maxTokens", default = "default_max_tokens")]
    max_tokens: u32,
}

fn default_max_tokens() -> u32 {
    2000
}

// ── Config file shape ──────────────────────────────────────────────

#[derive(Clone, Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    defaults: ConfigDefaults,
    #[serde(default)]
    models: HashMap<String, ProviderModels>,
}

#[derive(Clone, Debug, Deserialize)]
struct ConfigDefaults {
    #[serde(default = "default_llm_provider")]
    llm_provider: String,
    #[serde(default = "default_search_provider")]
    search_provider: String,
    #[serde(default = "default_step_sleep")]
    step_sleep: u64,
}

impl Default for ConfigDefaults {
    fn default() -> Self {
        Self {
            llm_provider: default_llm_provider(),
            search_provider: default_search_provider(),
            step_sleep: default_step_sleep(),
        }
    }
}

fn default_llm_provider() -> String {
    "openai".into()
}
fn default_search_provider() -> String {
    "jina".into()
}
fn default_step_sleep() -> u64 {
    100
}

// ── Settings ───────────────────────────────────────────────────────

/// Fully resolved configuration for a research session.
#[derive(Clone, Debug)]
pub struct Settings {
    pub llm_provider: LlmProvider,
    pub search_provider: SearchProviderKind,
    pub step_sleep: Duration,
    pub openai_base_url: Option<String>,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub jina_api_key: Option<String>,
    pub brave_api_key: Option<String>,
    pub serper_api_key: Option<String>,
    pub https_proxy: Option<String>,
    default_model_name: Option<String>,
    models: HashMap<String, ProviderModels>,
}

impl Settings {
    /// Load settings from an optional `config.json` plus the process
    /// environment, and validate that the selected providers have the keys
    /// they need. Key lookups prefer real environment variables over the
    /// file's `env` section.
    pub fn load(config_path: Option<&Path>) -> Result<Self, String> {
        let file: ConfigFile = match config_path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
                serde_json::from_str(&text)
                    .map_err(|e| format!("failed to parse {}: {e}", path.display()))?
            }
            None => ConfigFile::default(),
        };

        let lookup = |key: &str| -> Option<String> {
            std::env::var(key)
                .ok()
                .filter(|v| !v.is_empty())
                .or_else(|| file.env.get(key).cloned().filter(|v| !v.is_empty()))
        };

        let llm_provider = lookup("LLM_PROVIDER")
            .unwrap_or_else(|| file.defaults.llm_provider.clone())
            .parse::<LlmProvider>()?;
        let search_provider = lookup("SEARCH_PROVIDER")
            .unwrap_or_else(|| file.defaults.search_provider.clone())
            .parse::<SearchProviderKind>()?;
        let step_sleep = lookup("STEP_SLEEP")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(file.defaults.step_sleep);

        let settings = Self {
            llm_provider,
            search_provider,
            step_sleep: Duration::from_millis(step_sleep),
            openai_base_url: lookup("OPENAI_BASE_URL"),
            openai_api_key: lookup("OPENAI_API_KEY"),
            gemini_api_key: lookup("GEMINI_API_KEY"),
            jina_api_key: lookup("JINA_API_KEY"),
            brave_api_key: lookup("BRAVE_API_KEY"),
            serper_api_key: lookup("SERPER_API_KEY"),
            https_proxy: lookup("https_proxy"),
            default_model_name: lookup("DEFAULT_MODEL_NAME"),
            models: file.models,
        };

        settings.validate()?;
        info!(
            "configuration: llm={:?}, search={:?}, step_sleep={}ms",
            settings.llm_provider,
            settings.search_provider,
            settings.step_sleep.as_millis(),
        );
        Ok(settings)
    }

    /// Fatal-config validation: required keys for the selected providers.
    fn validate(&self) -> Result<(), String> {
        match self.llm_provider {
            LlmProvider::OpenAi if self.openai_api_key.is_none() => {
                return Err("OPENAI_API_KEY not found".into());
            }
            LlmProvider::Gemini | LlmProvider::Vertex if self.gemini_api_key.is_none() => {
                return Err("GEMINI_API_KEY not found".into());
            }
            _ => {}
        }
        match self.search_provider {
            SearchProviderKind::Jina if self.jina_api_key.is_none() => {
                Err("JINA_API_KEY not found".into())
            }
            SearchProviderKind::Brave if self.brave_api_key.is_none() => {
                Err("BRAVE_API_KEY not found".into())
            }
            SearchProviderKind::Serper if self.serper_api_key.is_none() => {
                Err("SERPER_API_KEY not found".into())
            }
            _ => Ok(()),
        }
    }

    /// Chat completions endpoint and API key for the selected LLM provider.
    pub fn llm_endpoint(&self) -> Result<(String, String), String> {
        match self.llm_provider {
            LlmProvider::OpenAi => Ok((
                self.openai_base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1".into())
                    .trim_end_matches('/')
                    .to_string()
                    + "/chat/completions",
                self.openai_api_key
                    .clone()
                    .ok_or("OPENAI_API_KEY not found")?,
            )),
            LlmProvider::Gemini | LlmProvider::Vertex => Ok((
                "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions"
                    .to_string(),
                self.gemini_api_key
                    .clone()
                    .ok_or("GEMINI_API_KEY not found")?,
            )),
        }
    }

    /// Resolve model settings for a logical tool name, merging the provider's
    /// default entry with any per-tool override. Unknown tool names get the
    /// defaults. Vertex shares the gemini model table.
    pub fn tool_config(&self, tool: &str) -> ToolSettings {
        let provider_key = match self.llm_provider {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Gemini | LlmProvider::Vertex => "gemini",
        };
        let table = self.models.get(provider_key);

        let (default_model, default_temperature, default_max_tokens) = match table {
            Some(t) => (
                t.default.model.clone(),
                t.default.temperature,
                t.default.max_tokens,
            ),
            None => (builtin_default_model(self.llm_provider), 0.0, 2000),
        };
        let over = table.and_then(|t| t.tools.get(tool));

        ToolSettings {
            model: self
                .default_model_name
                .clone()
                .or_else(|| over.and_then(|o| o.model.clone()))
                .unwrap_or(default_model),
            temperature: over
                .and_then(|o| o.temperature)
                .unwrap_or(default_temperature),
            max_tokens: over.and_then(|o| o.max_tokens).unwrap_or(default_max_tokens),
        }
    }
}

fn builtin_default_model(provider: LlmProvider) -> String {
    match provider {
        LlmProvider::OpenAi => "gpt-4o-mini".into(),
        LlmProvider::Gemini | LlmProvider::Vertex => "gemini-2.0-flash".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_settings() -> Settings {
        Settings {
            llm_provider: LlmProvider::OpenAi,
            search_provider: SearchProviderKind::Duck,
            step_sleep: Duration::from_millis(100),
            openai_base_url: None,
            openai_api_key: Some("sk-test".into()),
            gemini_api_key: None,
            jina_api_key: None,
            brave_api_key: None,
            serper_api_key: None,
            https_proxy: None,
            default_model_name: None,
            models: HashMap::new(),
        }
    }

    #[test]
    fn provider_parsing() {
        assert_eq!("gemini".parse::<LlmProvider>().unwrap(), LlmProvider::Gemini);
        assert!("cohere".parse::<LlmProvider>().is_err());
        assert_eq!(
            "serper".parse::<SearchProviderKind>().unwrap(),
            SearchProviderKind::Serper
        );
        assert!("bing".parse::<SearchProviderKind>().is_err());
    }

    #[test]
    fn missing_llm_key_is_fatal() {
        let mut settings = bare_settings();
        settings.openai_api_key = None;
        assert_eq!(
            settings.validate().unwrap_err(),
            "OPENAI_API_KEY not found".to_string()
        );
    }

    #[test]
    fn missing_search_key_is_fatal() {
        let mut settings = bare_settings();
        settings.search_provider = SearchProviderKind::Brave;
        assert_eq!(
            settings.validate().unwrap_err(),
            "BRAVE_API_KEY not found".to_string()
        );
    }

    #[test]
    fn duck_needs_no_key() {
        assert!(bare_settings().validate().is_ok());
    }

    #[test]
    fn endpoint_for_openai_honors_base_url() {
        let mut settings = bare_settings();
        settings.openai_base_url = Some("https://proxy.example/v1/".into());
        let (url, key) = settings.llm_endpoint().unwrap();
        assert_eq!(url, "https://proxy.example/v1/chat/completions");
        assert_eq!(key, "sk-test");
    }

    #[test]
    fn tool_config_merges_overrides() {
        let table = r#"{
            "models": {
                "openai": {
                    "default": {"model": "gpt-4o", "temperature": 0.0, "maxTokens": 2000},
                    "tools": {
                        "agent": {"temperature": 0.7},
                        "evaluator": {"temperature": 0.6, "maxTokens": 200}
                    }
                }
            }
        }"#;
        let file: ConfigFile = serde_json::from_str(table).unwrap();
        let mut settings = bare_settings();
        settings.models = file.models;

        let agent = settings.tool_config("agent");
        assert_eq!(agent.model, "gpt-4o");
        assert!((agent.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(agent.max_tokens, 2000);

        let evaluator = settings.tool_config("evaluator");
        assert_eq!(evaluator.max_tokens, 200);

        // Unknown tools fall back to the default row.
        let unknown = settings.tool_config("language");
        assert_eq!(unknown.model, "gpt-4o");
        assert_eq!(unknown.max_tokens, 2000);
    }

    #[test]
    fn default_model_name_overrides_table() {
        let mut settings = bare_settings();
        settings.default_model_name = Some("gpt-custom".into());
        assert_eq!(settings.tool_config("agent").model, "gpt-custom");
    }
}
