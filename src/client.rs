//! Upstream completion clients. One trait seam so tests and the
//! orchestrator never care which provider is behind a name.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ProviderConfig;
use crate::error::{GatewayError, Result};

#[derive(Clone, Debug, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub prompt: String,
    pub max_output_tokens: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Completion {
    pub text: String,
    pub tokens_used: u64,
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
}

/// Client for any OpenAI-compatible chat completions endpoint. Credentials
/// are resolved from the environment at construction, never logged.
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    extra_headers: Vec<(String, String)>,
}

impl OpenAiCompatibleClient {
    pub fn from_config(provider: &ProviderConfig, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| GatewayError::Upstream {
                message: format!("failed to build http client: {error}"),
            })?;

        let api_key = if provider.api_key_env.is_empty() {
            None
        } else {
            std::env::var(&provider.api_key_env)
                .ok()
                .filter(|value| !value.trim().is_empty())
        };
        if api_key.is_none() && !provider.api_key_env.is_empty() {
            tracing::warn!(
                provider = %provider.name,
                env = %provider.api_key_env,
                "provider api key env var is unset; requests will go out unauthenticated"
            );
        }

        Ok(Self {
            http,
            base_url: provider.base_url.trim_end_matches('/').to_string(),
            api_key,
            extra_headers: provider
                .headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: u64,
}

#[async_trait]
impl CompletionClient for OpenAiCompatibleClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system_prompt {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": request.prompt }));

        let body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_output_tokens,
        });

        let mut builder = self.http.post(self.endpoint()).json(&body);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }
        for (name, value) in &self.extra_headers {
            builder = builder.header(name, value);
        }

        let response = builder
            .send()
            .await
            .map_err(|error| GatewayError::Upstream {
                message: format!("request failed: {error}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let detail = detail.chars().take(200).collect::<String>();
            return Err(GatewayError::Upstream {
                message: format!("upstream returned {status}: {detail}"),
            });
        }

        let parsed: ChatCompletionResponse =
            response
                .json()
                .await
                .map_err(|error| GatewayError::Upstream {
                    message: format!("malformed upstream response: {error}"),
                })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| GatewayError::Upstream {
                message: "upstream response contained no choices".to_string(),
            })?;

        // Some compatible servers omit usage; fall back to a rough estimate
        // so accounting never records zero for a real completion.
        let tokens_used = parsed
            .usage
            .map(|usage| usage.total_tokens)
            .filter(|total| *total > 0)
            .unwrap_or_else(|| estimate_tokens(&request.prompt) + estimate_tokens(&text));

        Ok(Completion { text, tokens_used })
    }
}

/// Conservative chars/4 heuristic, floored at 1 for non-empty input.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    (text.chars().count() as u64).div_ceil(4)
}
