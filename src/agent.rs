//! reqwest-based [`AgentClient`] speaking the OpenAI-compatible
//! chat-completions dialect, the wire format most hosted and self-hosted
//! backends accept.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::error;
use url::Url;

use crate::collaborator::{AgentClient, CollaboratorError, Generation};

#[derive(Debug, Clone)]
pub struct HttpAgentClient {
    base_url: Url,
    api_key: Option<String>,
    client: Client,
}

impl HttpAgentClient {
    pub fn new(base_url: Url, api_key: Option<String>) -> Self {
        Self {
            base_url,
            api_key,
            client: Client::new(),
        }
    }

    /// `OPENAI_URL` (default `https://api.openai.com/v1`) and `OPENAI_KEY`.
    pub fn from_env() -> Result<Self, CollaboratorError> {
        let base = std::env::var("OPENAI_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let base_url = Url::parse(&base)
            .map_err(|e| CollaboratorError::Rejected(format!("bad OPENAI_URL: {e}")))?;
        Ok(Self::new(base_url, std::env::var("OPENAI_KEY").ok()))
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Generation, CollaboratorError> {
        let body = json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": temperature,
            "max_tokens": max_tokens,
        });
        let url = format!(
            "{}/chat/completions",
            self.base_url.as_str().trim_end_matches('/')
        );

        let mut request = self.client.post(url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CollaboratorError::Unreachable(format!("chat request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_else(|_| "<no body>".into());
            error!("chat completions error: {status} {text}");
            return Err(CollaboratorError::Rejected(format!(
                "chat completions returned {status}"
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Rejected(format!("invalid chat response: {e}")))?;
        parse_generation(&payload)
    }
}

fn parse_generation(payload: &Value) -> Result<Generation, CollaboratorError> {
    let text = payload
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            CollaboratorError::Rejected("chat response missing message content".into())
        })?;
    let tokens_used = payload
        .pointer("/usage/total_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Ok(Generation { text, tokens_used })
}
