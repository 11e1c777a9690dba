//! LLM Client - HTTP client for OpenAI-compatible APIs
//!
//! Uses reqwest to call chat-completions endpoints. Compatible with:
//! - OpenAI
//! - Azure OpenAI
//! - DeepSeek
//! - Other OpenAI-compatible APIs

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::models::{AiConfig, LlmError};

/// Per-call deadline. A hung provider must never stall the pipeline.
const CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// LLM HTTP Client
pub struct LlmClient {
    http_client: Client,
}

impl Default for LlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmClient {
    pub fn new() -> Self {
        let http_client = Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");

        Self { http_client }
    }

    /// Call the chat-completions API and parse the content as JSON.
    ///
    /// Returns the parsed value plus input/output token counts. Content
    /// wrapped in markdown code fences is unwrapped before parsing.
    pub async fn chat_completion_json(
        &self,
        config: &AiConfig,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<(serde_json::Value, i64, i64), LlmError> {
        let chat_request = ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage { role: "system".to_string(), content: system_prompt.to_string() },
                ChatMessage { role: "user".to_string(), content: user_prompt.to_string() },
            ],
            temperature: Some(0.1),
            response_format: Some(ResponseFormat { r#type: "json_object".to_string() }),
        };

        let url = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));

        tracing::debug!("Calling LLM API: {} with model {}", url, model);

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {}", config.api_key))
            .header("Content-Type", "application/json")
            .json(&chat_request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(CALL_TIMEOUT.as_secs())
                } else {
                    LlmError::ApiError(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(LlmError::RateLimited(retry_after));
        }

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LlmError::ApiError(format!("API error {}: {}", status, error_text)));
        }

        let chat_response: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        let content = chat_response
            .choices
            .first()
            .and_then(|c| c.message.content.as_ref())
            .ok_or_else(|| LlmError::ParseError("Empty response from LLM".to_string()))?;

        let parsed = parse_lenient_json(content)?;

        let input_tokens = chat_response
            .usage
            .as_ref()
            .map(|u| u.prompt_tokens)
            .unwrap_or(0);
        let output_tokens = chat_response
            .usage
            .as_ref()
            .map(|u| u.completion_tokens)
            .unwrap_or(0);

        Ok((parsed, input_tokens, output_tokens))
    }
}

/// Parse LLM output as JSON, tolerating markdown code fences around it.
pub fn parse_lenient_json(content: &str) -> Result<serde_json::Value, LlmError> {
    let trimmed = content.trim();

    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    let unfenced = strip_code_fences(trimmed);
    serde_json::from_str(unfenced).map_err(|e| {
        LlmError::ParseError(format!("Failed to parse LLM response: {}. Content: {}", e, content))
    })
}

/// Strip a leading ```json / ``` fence pair, if present.
fn strip_code_fences(content: &str) -> &str {
    let Some(rest) = content.strip_prefix("```") else {
        return content;
    };
    // Drop the info string ("json", "JSON", ...) up to the first newline.
    let rest = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    rest.rsplit_once("```").map(|(body, _)| body.trim()).unwrap_or(rest.trim())
}

// ============================================================================
// OpenAI API Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    r#type: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: i64,
    completion_tokens: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let value = parse_lenient_json(r#"{"scores": [1, 2]}"#).unwrap();
        assert_eq!(value["scores"][0], 1);
    }

    #[test]
    fn test_parse_fenced_json() {
        let content = "```json\n{\"summary\": \"quiet window\"}\n```";
        let value = parse_lenient_json(content).unwrap();
        assert_eq!(value["summary"], "quiet window");
    }

    #[test]
    fn test_parse_fenced_without_language() {
        let content = "```\n[0.1, 0.2]\n```";
        let value = parse_lenient_json(content).unwrap();
        assert!(value.is_array());
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(parse_lenient_json("the window looks fine").is_err());
    }
}
