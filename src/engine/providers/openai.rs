// Lucy Engine — OpenAI-Compatible Provider
// Handles OpenRouter and any OpenAI-compatible REST API speaking
// /chat/completions. Non-streaming: the agent loop consumes whole turns.

use super::{ChatProvider, ProviderError, ProviderReply};
use crate::atoms::types::{truncate_utf8, Message, TokenUsage, ToolCall, ToolDefinition};
use crate::engine::http::{is_retryable_status, parse_retry_after, retry_delay, MAX_RETRIES};
use async_trait::async_trait;
use log::{error, info, warn};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiProvider {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        OpenAiProvider {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn parse_reply(data: &Value) -> ProviderReply {
        let model = data["model"].as_str().unwrap_or_default().to_string();
        let usage = data.get("usage").and_then(|u| {
            serde_json::from_value::<TokenUsage>(u.clone()).ok()
        });

        let message = &data["choices"][0]["message"];
        let content = message["content"].as_str().unwrap_or_default().to_string();
        let tool_calls: Vec<ToolCall> = message["tool_calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|tc| serde_json::from_value(tc.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        ProviderReply {
            content,
            tool_calls,
            usage,
            model,
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    async fn chat(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
        max_tokens: u32,
        temperature: f64,
    ) -> Result<ProviderReply, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": max_tokens,
            "temperature": temperature,
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
            body["tool_choice"] = json!("auto");
        }

        info!("[provider] Request to {} model={} tools={}", url, model, tools.len());

        let mut last_error = String::new();
        let mut last_status: u16 = 0;
        let mut retry_after: Option<u64> = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = retry_delay(attempt - 1, retry_after.take()).await;
                warn!(
                    "[provider] Retry {}/{} after {}ms",
                    attempt,
                    MAX_RETRIES,
                    delay.as_millis()
                );
            }

            let response = match self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_error = format!("HTTP request failed: {}", e);
                    last_status = 0;
                    if attempt < MAX_RETRIES {
                        continue;
                    }
                    return Err(ProviderError::Transport(last_error));
                }
            };

            if !response.status().is_success() {
                let status = response.status().as_u16();
                last_status = status;
                retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);
                let body_text = response.text().await.unwrap_or_default();
                last_error = format!("API error {}: {}", status, truncate_utf8(&body_text, 200));
                error!("[provider] {} — {}", model, truncate_utf8(&body_text, 500));

                // Auth errors are never retried.
                if status == 401 || status == 403 {
                    return Err(ProviderError::Auth(last_error));
                }
                if is_retryable_status(status) && attempt < MAX_RETRIES {
                    continue;
                }
                return if status == 429 {
                    Err(ProviderError::RateLimited {
                        message: last_error,
                        retry_after_secs: retry_after.take(),
                    })
                } else {
                    Err(ProviderError::Api { status, message: last_error })
                };
            }

            let data: Value = response
                .json()
                .await
                .map_err(|e| ProviderError::Transport(format!("Body read error: {}", e)))?;
            return Ok(Self::parse_reply(&data));
        }

        match last_status {
            0 => Err(ProviderError::Transport(last_error)),
            429 => Err(ProviderError::RateLimited {
                message: last_error,
                retry_after_secs: retry_after,
            }),
            s => Err(ProviderError::Api { status: s, message: last_error }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply_with_tool_calls() {
        let data = json!({
            "model": "openai/gpt-4o-mini",
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {
                            "name": "GOOGLECALENDAR_EVENTS_LIST",
                            "arguments": "{\"calendar_id\":\"primary\"}"
                        }
                    }]
                }
            }],
            "usage": {"prompt_tokens": 100, "completion_tokens": 20, "total_tokens": 120}
        });
        let reply = OpenAiProvider::parse_reply(&data);
        assert_eq!(reply.model, "openai/gpt-4o-mini");
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].function.name, "GOOGLECALENDAR_EVENTS_LIST");
        assert_eq!(reply.usage.unwrap().total_tokens, 120);
    }

    #[test]
    fn test_parse_reply_empty_choices() {
        let reply = OpenAiProvider::parse_reply(&json!({"choices": []}));
        assert!(reply.content.is_empty());
        assert!(reply.tool_calls.is_empty());
    }
}
