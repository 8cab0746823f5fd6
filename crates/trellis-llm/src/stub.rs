use std::collections::VecDeque;
use std::sync::Mutex;

use futures::future::BoxFuture;

use trellis_core::error::Result;
use trellis_core::traits::ChatClient;
use trellis_core::types::*;

/// Echoes the conversation back as the assistant response.
///
/// Useful as the `stub-echo` model in tests and local dry runs: the response
/// content is the system and user messages joined with newlines, so prompt
/// templating is observable end to end without a real provider.
pub struct EchoClient;

impl ChatClient for EchoClient {
    fn chat(
        &self,
        _model: &str,
        messages: Vec<ChatMessage>,
        _tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<ChatResponse>> {
        let content = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        Box::pin(async move {
            Ok(ChatResponse {
                content,
                tool_calls: vec![],
            })
        })
    }
}

/// Replays a fixed sequence of responses; the final response repeats once
/// the script is exhausted.
pub struct ScriptedClient {
    script: Mutex<VecDeque<ChatResponse>>,
    last: ChatResponse,
}

impl ScriptedClient {
    pub fn new(responses: Vec<ChatResponse>) -> Self {
        let last = responses.last().cloned().unwrap_or_default();
        Self {
            script: Mutex::new(responses.into()),
            last,
        }
    }
}

impl ChatClient for ScriptedClient {
    fn chat(
        &self,
        _model: &str,
        _messages: Vec<ChatMessage>,
        _tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<ChatResponse>> {
        let response = self
            .script
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or_else(|| self.last.clone());
        Box::pin(async move { Ok(response) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn echo_concatenates_prompts() {
        let client = EchoClient;
        let response = client
            .chat(
                "stub-echo",
                vec![ChatMessage::system("Greet Ada"), ChatMessage::user("hi")],
                &[],
            )
            .await
            .expect("ok");
        assert_eq!(response.content, "Greet Ada\nhi");
    }

    #[tokio::test]
    async fn scripted_repeats_last_response() {
        let client = ScriptedClient::new(vec![
            ChatResponse {
                content: "first".into(),
                tool_calls: vec![],
            },
            ChatResponse {
                content: "".into(),
                tool_calls: vec![ToolCall {
                    id: "c1".into(),
                    name: "t".into(),
                    arguments: json!({}),
                }],
            },
        ]);

        let first = client.chat("m", vec![], &[]).await.expect("ok");
        assert_eq!(first.content, "first");

        for _ in 0..3 {
            let next = client.chat("m", vec![], &[]).await.expect("ok");
            assert_eq!(next.tool_calls.len(), 1);
        }
    }
}
