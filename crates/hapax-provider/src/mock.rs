//! A queued-response test double for `Provider`, grounded on the LLM
//! crate's `MockProvider`. Used throughout `hapax-provider`'s and
//! `hapax-server`'s own test suites to drive failover, retry, and breaker
//! scenarios deterministically.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use hapax_core::{HapaxError, Prompt};

use crate::provider::{GenerateResponse, Provider};

/// One queued outcome for `MockProvider::generate`.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Ok(String),
    Err(HapaxError),
}

pub struct MockProvider {
    name: String,
    model: String,
    responses: Mutex<VecDeque<MockOutcome>>,
    /// The most recently returned outcome, replayed once `responses` runs
    /// dry so tests don't have to pad the queue out. Tracked separately
    /// from `responses` so every queued outcome is consumed exactly once in
    /// order — an outcome pushed after the queue has drained down to its
    /// last entry is still returned next, rather than being stuck behind a
    /// repeating one that was never actually removed.
    last: Mutex<Option<MockOutcome>>,
    recorded: Mutex<Vec<Prompt>>,
}

impl MockProvider {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            responses: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
            recorded: Mutex::new(Vec::new()),
        }
    }

    /// Queue an outcome in call order; the last-returned outcome repeats
    /// once the queue is exhausted so tests don't need to pad it out.
    pub fn push(&self, outcome: MockOutcome) -> &Self {
        self.responses.lock().push_back(outcome);
        self
    }

    pub fn push_ok(&self, content: impl Into<String>) -> &Self {
        self.push(MockOutcome::Ok(content.into()))
    }

    pub fn push_err(&self, err: HapaxError) -> &Self {
        self.push(MockOutcome::Err(err))
    }

    pub fn recorded_prompts(&self) -> Vec<Prompt> {
        self.recorded.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.recorded.lock().len()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &Prompt) -> Result<GenerateResponse, HapaxError> {
        self.recorded.lock().push(prompt.clone());

        let popped = self.responses.lock().pop_front();
        let outcome = match popped {
            Some(outcome) => {
                *self.last.lock() = Some(outcome.clone());
                outcome
            }
            None => match self.last.lock().clone() {
                Some(outcome) => outcome,
                None => MockOutcome::Ok("mock response".into()),
            },
        };

        match outcome {
            MockOutcome::Ok(content) => Ok(GenerateResponse {
                content,
                model: self.model.clone(),
            }),
            MockOutcome::Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_queued_outcomes_in_order() {
        let provider = MockProvider::new("mock", "mock-1");
        provider.push_ok("first");
        provider.push_err(HapaxError::Provider("second failed".into()));

        let prompt = Prompt::default();
        let first = provider.generate(&prompt).await.unwrap();
        assert_eq!(first.content, "first");

        let second = provider.generate(&prompt).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn repeats_the_last_queued_outcome_once_exhausted() {
        let provider = MockProvider::new("mock", "mock-1");
        provider.push_ok("steady");

        for _ in 0..3 {
            let response = provider.generate(&Prompt::default()).await.unwrap();
            assert_eq!(response.content, "steady");
        }
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn records_every_prompt_it_received() {
        let provider = MockProvider::new("mock", "mock-1");
        let mut prompt = Prompt::default();
        prompt.messages.push(hapax_core::PromptMessage::new(hapax_core::Role::User, "hi"));
        provider.generate(&prompt).await.unwrap();
        assert_eq!(provider.recorded_prompts().len(), 1);
    }
}
