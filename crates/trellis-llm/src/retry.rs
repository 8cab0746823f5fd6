use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use trellis_core::config::RetryConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::ChatClient;
use trellis_core::types::*;

/// A chat client that retries transient failures with exponential backoff.
pub struct RetryingClient {
    inner: Box<dyn ChatClient>,
    retry_config: RetryConfig,
}

impl RetryingClient {
    pub fn new(inner: Box<dyn ChatClient>, retry_config: RetryConfig) -> Self {
        Self {
            inner,
            retry_config,
        }
    }
}

fn is_retryable(e: &TrellisError) -> bool {
    match e {
        TrellisError::LlmRequest(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = (config.initial_backoff_ms * 2u64.pow(attempt)).min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl ChatClient for RetryingClient {
    fn chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<ChatResponse>> {
        let model = model.to_string();
        let tools = tools.to_vec();

        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;
            let mut last_err = None;

            for attempt in 0..=max_retries {
                match self.inner.chat(&model, messages.clone(), &tools).await {
                    Ok(response) => return Ok(response),
                    Err(e) => {
                        if is_retryable(&e) && attempt < max_retries {
                            let backoff = calculate_backoff(attempt, &self.retry_config);
                            warn!(
                                attempt = attempt + 1,
                                max_retries,
                                backoff_ms = backoff.as_millis() as u64,
                                error = %e,
                                "Retrying LLM request"
                            );
                            tokio::time::sleep(backoff).await;
                            last_err = Some(e);
                            continue;
                        }
                        return Err(e);
                    }
                }
            }

            Err(last_err.unwrap_or_else(|| TrellisError::LlmRequest("retries exhausted".into())))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FlakyClient {
        calls: Arc<AtomicUsize>,
        fail_first: usize,
    }

    impl ChatClient for FlakyClient {
        fn chat(
            &self,
            _model: &str,
            _messages: Vec<ChatMessage>,
            _tools: &[ToolDefinition],
        ) -> BoxFuture<'_, Result<ChatResponse>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = n < self.fail_first;
            Box::pin(async move {
                if fail {
                    Err(TrellisError::LlmRequest("503 service unavailable".into()))
                } else {
                    Ok(ChatResponse {
                        content: "ok".into(),
                        tool_calls: vec![],
                    })
                }
            })
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[tokio::test]
    async fn retries_transient_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = RetryingClient::new(
            Box::new(FlakyClient {
                calls: calls.clone(),
                fail_first: 2,
            }),
            fast_retry(),
        );

        let response = client.chat("m", vec![ChatMessage::user("hi")], &[]).await.expect("ok");
        assert_eq!(response.content, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = RetryingClient::new(
            Box::new(FlakyClient {
                calls: calls.clone(),
                fail_first: 10,
            }),
            fast_retry(),
        );

        let result = client.chat("m", vec![ChatMessage::user("hi")], &[]).await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4); // initial + 3 retries
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_fast() {
        struct ParseFail;
        impl ChatClient for ParseFail {
            fn chat(
                &self,
                _model: &str,
                _messages: Vec<ChatMessage>,
                _tools: &[ToolDefinition],
            ) -> BoxFuture<'_, Result<ChatResponse>> {
                Box::pin(async { Err(TrellisError::LlmParse("bad json".into())) })
            }
        }

        let client = RetryingClient::new(Box::new(ParseFail), fast_retry());
        let result = client.chat("m", vec![], &[]).await;
        assert!(matches!(result, Err(TrellisError::LlmParse(_))));
    }

    #[test]
    fn backoff_is_capped() {
        let config = RetryConfig {
            max_retries: 5,
            initial_backoff_ms: 1000,
            max_backoff_ms: 3000,
        };
        let backoff = calculate_backoff(10, &config);
        // 3000ms cap with at most 1.2x jitter
        assert!(backoff <= Duration::from_millis(3600));
    }
}
