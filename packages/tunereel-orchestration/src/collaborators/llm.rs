//! Chat-completions client for the prompt agents.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::LlmClient;
use crate::error::{OrchestratorError, Result};

pub struct HttpLlmClient {
    base_url: String,
    default_api_key: Option<String>,
    client: Client,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, default_api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_api_key,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn chat_json(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        model: &str,
        api_key: Option<&str>,
    ) -> Result<serde_json::Value> {
        let key = api_key.or(self.default_api_key.as_deref());
        let body = json!({
            "model": model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
            "response_format": { "type": "json_object" },
        });

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(OrchestratorError::transient)?;
        let status = response.status();
        if !status.is_success() {
            return Err(OrchestratorError::collaborator(
                "language model",
                format!("chat endpoint returned {status}"),
            ));
        }
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| OrchestratorError::collaborator("language model", e.to_string()))?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                OrchestratorError::collaborator("language model", "response carried no content")
            })?;
        parse_json_content(content)
    }
}

/// Parse a model response as JSON, unwrapping a markdown code fence first if
/// one is present.
pub fn parse_json_content(content: &str) -> Result<serde_json::Value> {
    let unfenced = strip_markdown_fence(content);
    serde_json::from_str(unfenced).map_err(|e| {
        OrchestratorError::invalid_input(format!("language model produced invalid JSON: {e}"))
    })
}

fn strip_markdown_fence(content: &str) -> &str {
    let trimmed = content.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim();
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_json_parses() {
        let value = parse_json_content(r#"{"song_id": "s1"}"#).unwrap();
        assert_eq!(value["song_id"], "s1");
    }

    #[test]
    fn test_fenced_json_unwrapped() {
        let value = parse_json_content("```json\n{\"prompt\": \"a sunset\"}\n```").unwrap();
        assert_eq!(value["prompt"], "a sunset");
    }

    #[test]
    fn test_bare_fence_unwrapped() {
        let value = parse_json_content("```\n{\"instrumental\": true}\n```").unwrap();
        assert_eq!(value["instrumental"], true);
    }

    #[test]
    fn test_prose_is_rejected() {
        let err = parse_json_content("Sure! Here's the result you asked for.").unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput(_)));
    }
}
