use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use trellis_core::config::RetryConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::ToolInvoker;
use trellis_core::types::ToolSpec;

/// Invokes tools by calling their backing HTTP API.
///
/// GET and DELETE send the LLM arguments as query parameters; POST and PUT
/// send them as a JSON body. Non-2xx responses are surfaced to the LLM as an
/// error string rather than failing the node; transport failures and 5xx
/// are retried before giving up.
pub struct HttpToolInvoker {
    http: Client,
    retry_config: RetryConfig,
}

impl HttpToolInvoker {
    pub fn new(request_timeout_secs: u64, retry_config: RetryConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(request_timeout_secs))
            .build()
            .map_err(|e| TrellisError::ToolInvocation {
                tool: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { http, retry_config })
    }

    async fn send_once(
        &self,
        spec: &ToolSpec,
        arguments: &Value,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        let method = spec.method.to_uppercase();
        let mut request = match method.as_str() {
            "POST" => self.http.post(&spec.api_url).json(arguments),
            "PUT" => self.http.put(&spec.api_url).json(arguments),
            "DELETE" => self.http.delete(&spec.api_url).query(&query_pairs(arguments)),
            // GET and anything unrecognized was rejected earlier
            _ => self.http.get(&spec.api_url).query(&query_pairs(arguments)),
        };
        for (name, value) in &spec.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request.send().await
    }
}

fn query_pairs(arguments: &Value) -> Vec<(String, String)> {
    match arguments {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let rendered = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), rendered)
            })
            .collect(),
        _ => Vec::new(),
    }
}

impl ToolInvoker for HttpToolInvoker {
    fn invoke(&self, spec: &ToolSpec, arguments: Value) -> BoxFuture<'_, Result<Value>> {
        let spec = spec.clone();

        Box::pin(async move {
            let method = spec.method.to_uppercase();
            if !matches!(method.as_str(), "GET" | "POST" | "PUT" | "DELETE") {
                return Err(TrellisError::ToolInvocation {
                    tool: spec.name.clone(),
                    message: format!("unsupported HTTP method {}", spec.method),
                });
            }

            let max_retries = self.retry_config.max_retries;
            let mut backoff = Duration::from_millis(self.retry_config.initial_backoff_ms);
            let mut last_err: Option<String> = None;

            for attempt in 0..=max_retries {
                match self.send_once(&spec, &arguments).await {
                    Ok(response) => {
                        let status = response.status();
                        if status.is_server_error() && attempt < max_retries {
                            warn!(tool = %spec.name, %status, attempt, "Tool API 5xx, retrying");
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2)
                                .min(Duration::from_millis(self.retry_config.max_backoff_ms));
                            continue;
                        }

                        let text = response.text().await.unwrap_or_default();
                        if status.is_success() {
                            debug!(tool = %spec.name, %status, "Tool call succeeded");
                            // Prefer structured output; fall back to the raw body
                            return Ok(serde_json::from_str(&text)
                                .unwrap_or(Value::String(text)));
                        }
                        return Ok(Value::String(format!(
                            "Error: API returned status {}: {}",
                            status, text
                        )));
                    }
                    Err(e) => {
                        if attempt < max_retries {
                            warn!(tool = %spec.name, error = %e, attempt, "Tool request failed, retrying");
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2)
                                .min(Duration::from_millis(self.retry_config.max_backoff_ms));
                            last_err = Some(e.to_string());
                            continue;
                        }
                        last_err = Some(e.to_string());
                    }
                }
            }

            Err(TrellisError::ToolInvocation {
                tool: spec.name,
                message: last_err.unwrap_or_else(|| "request failed".into()),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_pairs_stringify_values() {
        let pairs = query_pairs(&json!({"city": "Paris", "days": 3, "detailed": true}));
        let mut pairs: Vec<(String, String)> = pairs;
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("city".to_string(), "Paris".to_string()),
                ("days".to_string(), "3".to_string()),
                ("detailed".to_string(), "true".to_string()),
            ]
        );
    }

    #[test]
    fn query_pairs_of_non_object_is_empty() {
        assert!(query_pairs(&json!("just a string")).is_empty());
    }

    #[tokio::test]
    async fn unsupported_method_is_rejected() {
        let invoker = HttpToolInvoker::new(5, RetryConfig::default()).expect("invoker");
        let spec = ToolSpec {
            id: "t".into(),
            name: "patchy".into(),
            description: String::new(),
            parameters: vec![],
            api_url: "http://127.0.0.1:1/never".into(),
            method: "PATCH".into(),
            headers: Default::default(),
        };
        let result = invoker.invoke(&spec, json!({})).await;
        match result {
            Err(TrellisError::ToolInvocation { tool, message }) => {
                assert_eq!(tool, "patchy");
                assert!(message.contains("PATCH"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
