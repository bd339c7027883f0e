//! The upstream provider vocabulary: the `Provider` trait every backend
//! implements, and a generic HTTP-backed implementation for talking to an
//! OpenAI-compatible completion endpoint. Grounded on the `LlmProvider`
//! trait and its request/response types in this codebase's LLM crate,
//! trimmed to the single `generate` operation the gateway actually needs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use hapax_core::{HapaxError, Prompt};

/// One upstream call's outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub content: String,
    pub model: String,
}

/// A backend capable of turning a prompt into a completion.
///
/// Implementations must treat `HapaxError::Cancelled` specially: returning
/// it tells the circuit breaker this outcome was a client-side cancellation,
/// not a provider fault (§9 Open Question 1).
#[async_trait]
pub trait Provider: Send + Sync {
    /// The provider's configured name, e.g. `"openai"` or `"anthropic"`.
    fn name(&self) -> &str;

    /// The model this provider instance is bound to.
    fn model(&self) -> &str;

    async fn generate(&self, prompt: &Prompt) -> Result<GenerateResponse, HapaxError>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [hapax_core::PromptMessage],
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionMessage {
    content: String,
}

/// A provider that speaks the OpenAI-compatible chat-completions wire
/// format over plain HTTP. Vendor-specific SDKs are out of scope; this is
/// the one real upstream-calling implementation the gateway ships, and
/// everything OpenAI-compatible (including most self-hosted runtimes)
/// speaks this dialect.
pub struct HttpProvider {
    name: String,
    model: String,
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(name: impl Into<String>, model: impl Into<String>, endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &Prompt) -> Result<GenerateResponse, HapaxError> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: &prompt.messages,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    HapaxError::Timeout
                } else {
                    HapaxError::Provider(format!("{}: request failed: {e}", self.name))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(HapaxError::Provider(format!(
                "{}: upstream returned {status}",
                self.name
            )));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| HapaxError::Provider(format!("{}: malformed response: {e}", self.name)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| HapaxError::Provider(format!("{}: empty choices array", self.name)))?;

        Ok(GenerateResponse {
            content,
            model: self.model.clone(),
        })
    }
}
