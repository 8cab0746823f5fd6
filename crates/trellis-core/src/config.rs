use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrellisError};

/// Top-level Trellis configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
}

/// Worker pool and handler budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of worker tasks consuming the job queue.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Wall-clock budget per node execution.
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
    /// Maximum LLM <-> tool round trips per agent node.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    /// Broadcast channel capacity for the event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Maximum nodes in an LLM-generated virtual workflow.
    #[serde(default = "default_max_virtual_nodes")]
    pub max_virtual_nodes: usize,
    /// Step budget when walking a virtual workflow.
    #[serde(default = "default_max_virtual_steps")]
    pub max_virtual_steps: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            node_timeout_secs: default_node_timeout(),
            max_tool_rounds: default_max_tool_rounds(),
            event_capacity: default_event_capacity(),
            max_virtual_nodes: default_max_virtual_nodes(),
            max_virtual_steps: default_max_virtual_steps(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_node_timeout() -> u64 {
    300
}

fn default_max_tool_rounds() -> usize {
    8
}

fn default_event_capacity() -> usize {
    256
}

fn default_max_virtual_nodes() -> usize {
    20
}

fn default_max_virtual_steps() -> usize {
    50
}

/// LLM endpoint configuration (OpenAI-compatible).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Base URL of the chat-completions API.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// API key; usually `${ENV_VAR}` in the config file.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Model used when a node does not name one.
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Per-request HTTP timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            default_model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_request_timeout() -> u64 {
    30
}

/// Retry policy for transient LLM/tool failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    10_000
}

/// In-process queue behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Seconds before an unacknowledged job is redelivered.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: default_visibility_timeout(),
        }
    }
}

fn default_visibility_timeout() -> u64 {
    60
}

/// Persistence location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "data/trellis.db".to_string()
}

/// HTTP/WebSocket gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Master token; grants access to every workflow.
    #[serde(default)]
    pub token: Option<String>,
    /// Per-subject API keys; the subject must own the workflow it touches.
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token: None,
            api_keys: Vec::new(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    /// Subject this key authenticates as (matched against workflow owner).
    pub name: String,
    pub key: String,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TrellisError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| TrellisError::Config(e.to_string()))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_TRELLIS_VAR", "value123");
        let result = expand_env_vars("key = \"${TEST_TRELLIS_VAR}\"");
        assert_eq!(result, "key = \"value123\"");
        std::env::remove_var("TEST_TRELLIS_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_TRELLIS_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_TRELLIS_VAR}\"");
    }

    #[test]
    fn test_engine_defaults_from_minimal_toml() {
        let config: AppConfig = toml::from_str("").expect("parse empty config");
        assert_eq!(config.engine.workers, 4);
        assert_eq!(config.engine.node_timeout_secs, 300);
        assert_eq!(config.engine.max_tool_rounds, 8);
        assert_eq!(config.engine.max_virtual_nodes, 20);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.model.request_timeout_secs, 30);
        assert_eq!(config.queue.visibility_timeout_secs, 60);
        assert!(config.gateway.is_none());
    }

    #[test]
    fn test_custom_sections() {
        let toml_str = r#"
[engine]
workers = 8
node_timeout_secs = 60

[model]
base_url = "http://localhost:11434/v1"
default_model = "llama3.2"

[gateway]
bind = "0.0.0.0:9000"
token = "secret"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.engine.workers, 8);
        assert_eq!(config.engine.node_timeout_secs, 60);
        assert_eq!(config.model.default_model, "llama3.2");
        let gw = config.gateway.expect("gateway present");
        assert_eq!(gw.bind, "0.0.0.0:9000");
        assert_eq!(gw.token.as_deref(), Some("secret"));
    }
}
