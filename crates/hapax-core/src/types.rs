use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Static configuration for a single upstream provider (§3 Data Model).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: String,
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Ordered sequence of provider names defining failover order (§3).
pub type ProviderPreference = Vec<String>;

/// Per-provider health, updated atomically on every observation (§3).
///
/// Readers must never observe a torn struct: callers always replace the
/// whole value rather than mutate individual fields in place.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub last_check: std::time::SystemTime,
    pub consecutive_fails: u32,
    pub latency: Duration,
    pub error_count: i64,
    pub request_count: i64,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            healthy: true,
            last_check: std::time::SystemTime::now(),
            consecutive_fails: 0,
            latency: Duration::ZERO,
            error_count: 0,
            request_count: 0,
        }
    }
}

/// The `/v1/completions` request body (§3, §6). Exactly one of `input` or
/// `messages` must be non-empty.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub messages: Option<Vec<super::message::PromptMessage>>,
    #[serde(default)]
    pub function_description: Option<String>,
}

/// Request "type" discriminant from the `?type=` query parameter (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestKind {
    #[default]
    Default,
    Chat,
    Function,
}

impl std::str::FromStr for RequestKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" | "" => Ok(RequestKind::Default),
            "chat" => Ok(RequestKind::Chat),
            "function" => Ok(RequestKind::Function),
            _ => Err(()),
        }
    }
}

/// The `/v1/completions` response body (§3, §6).
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompletionResponse {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub const MAX_INPUT_BYTES: usize = 512 * 1024;
pub const MAX_FUNCTION_DESCRIPTION_BYTES: usize = 5 * 1024;

impl CompletionRequest {
    /// Validate per §3 invariants: at least one of `input`/`messages` must be
    /// non-empty; `input` ≤ 512 KB; `function_description` ≤ 5 KB.
    pub fn validate(&self) -> Result<(), String> {
        let has_input = self.input.as_deref().is_some_and(|s| !s.is_empty());
        let has_messages = self.messages.as_ref().is_some_and(|m| !m.is_empty());
        if !has_input && !has_messages {
            return Err("at least one of `input` or `messages` must be provided".into());
        }
        if let Some(ref input) = self.input
            && input.len() > MAX_INPUT_BYTES
        {
            return Err(format!(
                "input exceeds maximum size of {MAX_INPUT_BYTES} bytes"
            ));
        }
        if let Some(ref fd) = self.function_description
            && fd.len() > MAX_FUNCTION_DESCRIPTION_BYTES
        {
            return Err(format!(
                "function_description exceeds maximum size of {MAX_FUNCTION_DESCRIPTION_BYTES} bytes"
            ));
        }
        Ok(())
    }
}
