use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use trellis_core::config::ModelConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::ChatClient;
use trellis_core::types::*;

/// OpenAI-compatible chat client. Works with OpenAI, Ollama, vLLM, Groq,
/// OpenRouter, and any other `/chat/completions` endpoint.
pub struct OpenAiClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: Option<f32>,
}

impl OpenAiClient {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| TrellisError::LlmRequest(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OaiTool>,
}

#[derive(Serialize)]
struct OaiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OaiToolCallOut>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
struct OaiToolCallOut {
    id: String,
    r#type: String,
    function: OaiFunctionOut,
}

#[derive(Serialize)]
struct OaiFunctionOut {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct OaiTool {
    r#type: String,
    function: OaiToolDef,
}

#[derive(Serialize)]
struct OaiToolDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

// Response types
#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OaiToolCallIn>>,
}

#[derive(Deserialize)]
struct OaiToolCallIn {
    id: String,
    function: OaiFunctionIn,
}

#[derive(Deserialize)]
struct OaiFunctionIn {
    name: String,
    arguments: String,
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<OaiTool> {
    tools
        .iter()
        .map(|t| OaiTool {
            r#type: "function".to_string(),
            function: OaiToolDef {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            },
        })
        .collect()
}

fn convert_messages(messages: Vec<ChatMessage>) -> Vec<OaiMessage> {
    messages
        .into_iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            let tool_calls = if m.tool_calls.is_empty() {
                None
            } else {
                Some(
                    m.tool_calls
                        .iter()
                        .map(|tc| OaiToolCallOut {
                            id: tc.id.clone(),
                            r#type: "function".to_string(),
                            function: OaiFunctionOut {
                                name: tc.name.clone(),
                                arguments: tc.arguments.to_string(),
                            },
                        })
                        .collect(),
                )
            };
            OaiMessage {
                role: role.to_string(),
                content: Some(m.content),
                tool_calls,
                tool_call_id: m.tool_call_id,
            }
        })
        .collect()
}

impl ChatClient for OpenAiClient {
    fn chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<ChatResponse>> {
        let body = ChatRequest {
            model: model.to_string(),
            messages: convert_messages(messages),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            tools: convert_tools(tools),
        };

        Box::pin(async move {
            let mut request = self
                .http
                .post(format!("{}/chat/completions", self.base_url))
                .json(&body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            let response = request
                .send()
                .await
                .map_err(|e| TrellisError::LlmRequest(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(TrellisError::LlmRequest(format!("{}: {}", status, text)));
            }

            let completion: ChatCompletion = response
                .json()
                .await
                .map_err(|e| TrellisError::LlmParse(e.to_string()))?;

            let choice = completion
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| TrellisError::LlmParse("response has no choices".into()))?;

            let mut tool_calls = Vec::new();
            for tc in choice.message.tool_calls.unwrap_or_default() {
                let arguments: serde_json::Value = serde_json::from_str(&tc.function.arguments)
                    .map_err(|e| {
                        TrellisError::LlmParse(format!(
                            "bad tool call arguments for {}: {}",
                            tc.function.name, e
                        ))
                    })?;
                tool_calls.push(ToolCall {
                    id: tc.id,
                    name: tc.function.name,
                    arguments,
                });
            }

            Ok(ChatResponse {
                content: choice.message.content.unwrap_or_default(),
                tool_calls,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn converts_tool_definitions() {
        let defs = vec![ToolDefinition {
            name: "weather".into(),
            description: "Get weather".into(),
            parameters: json!({"type": "object", "properties": {}}),
        }];
        let oai = convert_tools(&defs);
        assert_eq!(oai.len(), 1);
        assert_eq!(oai[0].r#type, "function");
        assert_eq!(oai[0].function.name, "weather");
    }

    #[test]
    fn converts_tool_result_message() {
        let msgs = convert_messages(vec![ChatMessage::tool_result("call-1", "42")]);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, "tool");
        assert_eq!(msgs[0].tool_call_id.as_deref(), Some("call-1"));
    }

    #[test]
    fn assistant_message_carries_tool_calls() {
        let msgs = convert_messages(vec![ChatMessage::assistant(
            "",
            vec![ToolCall {
                id: "c1".into(),
                name: "weather".into(),
                arguments: json!({"city": "Paris"}),
            }],
        )]);
        let calls = msgs[0].tool_calls.as_ref().expect("tool calls");
        assert_eq!(calls[0].function.name, "weather");
        assert!(calls[0].function.arguments.contains("Paris"));
    }
}
