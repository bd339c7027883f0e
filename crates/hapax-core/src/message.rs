use serde::{Deserialize, Serialize};

/// Who produced a message in a [`Prompt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message within a [`Prompt`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A provider-neutral conversation: an ordered sequence of `{role, content}`
/// messages (§3 Data Model).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Prompt {
    pub messages: Vec<PromptMessage>,
}

impl Prompt {
    pub fn new(messages: Vec<PromptMessage>) -> Self {
        Self { messages }
    }

    /// The deduplication key for the provider manager's single-flight group
    /// (§4.2): the first message's content and role, concatenated, with no
    /// nonce — identical prompts collapse onto the same key.
    pub fn dedup_key(&self) -> String {
        match self.messages.first() {
            Some(m) => format!("{:?}:{}", m.role, m.content),
            None => "<empty>".to_string(),
        }
    }
}
