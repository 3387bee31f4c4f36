use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::config::LlmSettings;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("language model endpoint unreachable: {0}")]
    Transport(String),

    #[error("language model http error {status}: {body}")]
    Http { status: u16, body: String },

    #[error("language model returned a malformed response: {0}")]
    Malformed(String),
}

/// One blocking chat completion: a system prompt plus a single user turn.
pub trait LlmClient {
    fn complete(&self, system: &str, user: &str, json_mode: bool) -> Result<String, LlmError>;
}

impl<T: LlmClient + ?Sized> LlmClient for &T {
    fn complete(&self, system: &str, user: &str, json_mode: bool) -> Result<String, LlmError> {
        (**self).complete(system, user, json_mode)
    }
}

/// Client for an OpenAI-compatible `/v1/chat/completions` endpoint.
pub struct OpenAiChatClient {
    settings: LlmSettings,
    http: reqwest::blocking::Client,
}

impl OpenAiChatClient {
    pub fn new(settings: LlmSettings) -> anyhow::Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|error| anyhow::anyhow!("failed to build http client: {error}"))?;
        Ok(Self { settings, http })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.settings.base_url)
    }
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl LlmClient for OpenAiChatClient {
    fn complete(&self, system: &str, user: &str, json_mode: bool) -> Result<String, LlmError> {
        let mut body = json!({
            "model": self.settings.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ],
            "max_tokens": self.settings.max_tokens,
            "temperature": self.settings.temperature,
        });
        if json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let started = std::time::Instant::now();
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.settings.api_key)
            .json(&body)
            .send()
            .map_err(|error| LlmError::Transport(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(LlmError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let decoded: ChatCompletionResponse = response
            .json()
            .map_err(|error| LlmError::Malformed(error.to_string()))?;
        tracing::debug!(
            model = %self.settings.model,
            json_mode,
            duration_ms = crate::utils::time::elapsed_ms(started),
            "chat completion finished"
        );

        decoded
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| LlmError::Malformed("response contained no message content".to_string()))
    }
}
