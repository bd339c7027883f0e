//! The request processor (§4.9): template expansion, prompt assembly,
//! provider dispatch, and response formatting.
//!
//! Template rendering itself is treated as an external collaborator the
//! processor consumes through a small registry rather than a general
//! engine — named templates are plain `{{field}}` placeholder strings.

use std::collections::HashMap;
use std::sync::Arc;

use hapax_core::{
    CompletionRequest, CompletionResponse, HapaxError, Prompt, PromptMessage, RequestKind, Role,
};
use hapax_provider::ProviderManager;

/// A tiny placeholder-substitution template store, keyed by name. Looked up
/// by [`RequestKind`] via [`template_name_for`].
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: HashMap<String, String>,
}

impl TemplateRegistry {
    /// The built-in templates: `default` passes `input` through untouched,
    /// `function` appends the function description as a second paragraph.
    pub fn with_defaults() -> Self {
        let mut templates = HashMap::new();
        templates.insert("default".to_string(), "{{input}}".to_string());
        templates.insert(
            "function".to_string(),
            "{{input}}\n\n{{function_description}}".to_string(),
        );
        Self { templates }
    }

    pub fn register(&mut self, name: impl Into<String>, template: impl Into<String>) {
        self.templates.insert(name.into(), template.into());
    }

    /// Expand `name`'s template over `request`'s fields. Falls back to the
    /// `default` template if `name` is not registered.
    pub fn expand(&self, name: &str, request: &CompletionRequest) -> String {
        let template = self
            .templates
            .get(name)
            .or_else(|| self.templates.get("default"))
            .map(String::as_str)
            .unwrap_or("{{input}}");

        template
            .replace("{{input}}", request.input.as_deref().unwrap_or(""))
            .replace(
                "{{function_description}}",
                request.function_description.as_deref().unwrap_or(""),
            )
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Which registered template a [`RequestKind`] selects (§4.9 "plugin-style
/// request types... dispatch is a switch on the tag").
pub fn template_name_for(kind: RequestKind) -> &'static str {
    match kind {
        RequestKind::Default | RequestKind::Chat => "default",
        RequestKind::Function => "function",
    }
}

/// Response-formatting options applied after the provider call returns
/// (§4.9: `trim_whitespace`, `clean_json`, `max_length`).
#[derive(Debug, Clone, Copy, Default)]
pub struct FormattingOptions {
    pub trim_whitespace: bool,
    pub clean_json: bool,
    pub max_length: Option<usize>,
}

/// Strip a single leading/trailing fenced-code block (` ```lang\n...\n``` `)
/// if the content is wrapped in one; otherwise return it unchanged.
fn clean_json(content: &str) -> String {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return content.to_string();
    };
    let Some(end) = rest.rfind("```") else {
        return content.to_string();
    };
    let body = &rest[..end];
    // Drop an optional language tag on the fence's first line (e.g. "json").
    let body = body.strip_prefix("json").unwrap_or(body);
    body.trim().to_string()
}

/// Truncate `content` to at most `max_bytes` bytes, respecting UTF-8
/// character boundaries.
fn truncate_bytes(content: &str, max_bytes: usize) -> String {
    if content.len() <= max_bytes {
        return content.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !content.is_char_boundary(end) {
        end -= 1;
    }
    content[..end].to_string()
}

pub fn format_response(content: String, options: FormattingOptions) -> String {
    let mut out = content;
    if options.clean_json {
        out = clean_json(&out);
    }
    if options.trim_whitespace {
        out = out.trim().to_string();
    }
    if let Some(max) = options.max_length {
        out = truncate_bytes(&out, max);
    }
    out
}

/// Assemble the outbound [`Prompt`] (§4.9): an optional configured system
/// message, then either the request's own message list or a single
/// synthesized user message carrying the expanded template output.
fn assemble_prompt(
    system_prompt: Option<&str>,
    request: &CompletionRequest,
    expanded_input: String,
) -> Prompt {
    let mut messages = Vec::new();
    if let Some(system) = system_prompt {
        messages.push(PromptMessage::new(Role::System, system));
    }

    match &request.messages {
        Some(provided) if !provided.is_empty() => messages.extend(provided.iter().cloned()),
        _ => messages.push(PromptMessage::new(Role::User, expanded_input)),
    }

    Prompt::new(messages)
}

pub struct Processor {
    pub templates: TemplateRegistry,
    pub system_prompt: Option<String>,
    pub formatting: FormattingOptions,
}

impl Processor {
    pub fn new(system_prompt: Option<String>, formatting: FormattingOptions) -> Self {
        Self {
            templates: TemplateRegistry::with_defaults(),
            system_prompt,
            formatting,
        }
    }

    /// `process(ctx, request) -> response` (§4.9 Contract).
    pub async fn process(
        &self,
        manager: &Arc<ProviderManager>,
        kind: RequestKind,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, HapaxError> {
        request
            .validate()
            .map_err(HapaxError::Validation)?;

        let template_name = template_name_for(kind);
        let expanded = self.templates.expand(template_name, &request);

        let prompt = assemble_prompt(self.system_prompt.as_deref(), &request, expanded);

        let result = manager.generate(prompt).await?;
        let content = format_response(result.content, self.formatting);

        Ok(CompletionResponse {
            content,
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hapax_provider::{BreakerConfig, MockProvider};

    fn manager_with_mock(outcome_content: &str) -> (Arc<ProviderManager>, Arc<MockProvider>) {
        let mock = Arc::new(MockProvider::new("primary", "test-model"));
        mock.push_ok(outcome_content.to_string());
        let manager = ProviderManager::new();
        manager.add_provider(
            "primary".to_string(),
            mock.clone(),
            BreakerConfig::default(),
        );
        (manager, mock)
    }

    #[test]
    fn default_template_passes_input_through() {
        let registry = TemplateRegistry::with_defaults();
        let req = CompletionRequest {
            input: Some("Hello".to_string()),
            messages: None,
            function_description: None,
        };
        assert_eq!(registry.expand("default", &req), "Hello");
    }

    #[test]
    fn function_template_appends_description() {
        let registry = TemplateRegistry::with_defaults();
        let req = CompletionRequest {
            input: Some("Hello".to_string()),
            messages: None,
            function_description: Some("lookup_weather(city)".to_string()),
        };
        assert_eq!(
            registry.expand("function", &req),
            "Hello\n\nlookup_weather(city)"
        );
    }

    #[test]
    fn unknown_template_name_falls_back_to_default() {
        let registry = TemplateRegistry::with_defaults();
        let req = CompletionRequest {
            input: Some("Hi".to_string()),
            messages: None,
            function_description: None,
        };
        assert_eq!(registry.expand("nonexistent", &req), "Hi");
    }

    #[test]
    fn clean_json_strips_fenced_code_markers() {
        let wrapped = "```json\n{\"a\":1}\n```";
        assert_eq!(clean_json(wrapped), "{\"a\":1}");
    }

    #[test]
    fn clean_json_leaves_unfenced_content_untouched() {
        assert_eq!(clean_json("plain text"), "plain text");
    }

    #[test]
    fn max_length_truncates_to_byte_count() {
        let opts = FormattingOptions {
            max_length: Some(5),
            ..Default::default()
        };
        assert_eq!(format_response("Hello, world".to_string(), opts), "Hello");
    }

    #[test]
    fn trim_whitespace_strips_leading_and_trailing() {
        let opts = FormattingOptions {
            trim_whitespace: true,
            ..Default::default()
        };
        assert_eq!(format_response("  hi  ".to_string(), opts), "hi");
    }

    #[test]
    fn assembles_system_message_ahead_of_synthesized_user_message() {
        let req = CompletionRequest {
            input: Some("hello".to_string()),
            messages: None,
            function_description: None,
        };
        let prompt = assemble_prompt(Some("You are helpful."), &req, "hello".to_string());
        assert_eq!(prompt.messages.len(), 2);
        assert_eq!(prompt.messages[0].role, Role::System);
        assert_eq!(prompt.messages[1].role, Role::User);
    }

    #[test]
    fn provided_message_list_wins_over_synthesized_input() {
        let req = CompletionRequest {
            input: Some("ignored".to_string()),
            messages: Some(vec![PromptMessage::new(Role::User, "explicit")]),
            function_description: None,
        };
        let prompt = assemble_prompt(None, &req, "ignored-expanded".to_string());
        assert_eq!(prompt.messages.len(), 1);
        assert_eq!(prompt.messages[0].content, "explicit");
    }

    #[tokio::test]
    async fn process_runs_the_default_path_end_to_end() {
        let (manager, _mock) = manager_with_mock("World");
        let processor = Processor::new(None, FormattingOptions::default());
        let request = CompletionRequest {
            input: Some("Hello".to_string()),
            messages: None,
            function_description: None,
        };
        let response = processor
            .process(&manager, RequestKind::Default, request)
            .await
            .unwrap();
        assert_eq!(response.content, "World");
    }

    #[tokio::test]
    async fn process_rejects_an_empty_request() {
        let (manager, _mock) = manager_with_mock("unused");
        let processor = Processor::new(None, FormattingOptions::default());
        let request = CompletionRequest::default();
        let err = processor
            .process(&manager, RequestKind::Default, request)
            .await
            .unwrap_err();
        assert!(matches!(err, HapaxError::Validation(_)));
    }
}
