//! Outreach message generation through the OpenRouter chat completions API.

use std::time::Duration;

use outreach_core::MessageGenerator;
use outreach_shared::{
    AppConfig, MessageInput, MessageResult, OpenRouterConfig, Result, StageError,
    openrouter_api_key,
};
use reqwest::{Client, header};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use crate::http::{build_client, send_error, status_error};

const SYSTEM_PROMPT: &str = "You write short, friendly first-contact messages that a company \
could send through another company's website contact form. Write plain text only: no subject \
line, no placeholders, no markdown. Keep it under 120 words and end with a clear, low-pressure \
call to action.";

/// Confidence when the model stopped on its own.
const CONFIDENCE_COMPLETE: f64 = 0.9;
/// Confidence when the completion was cut off by the token limit.
const CONFIDENCE_TRUNCATED: f64 = 0.5;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenRouterGenerator {
    client: Client,
    api_key: String,
    model: String,
    endpoint: Url,
}

impl OpenRouterGenerator {
    pub fn new(config: &OpenRouterConfig, api_key: String, timeout: Duration) -> Result<Self> {
        let base = config.base_url.trim_end_matches('/');
        let endpoint = Url::parse(&format!("{base}/chat/completions")).map_err(|e| {
            outreach_shared::OutreachError::config(format!(
                "invalid openrouter.base_url {}: {e}",
                config.base_url
            ))
        })?;
        Ok(Self {
            // The endpoint is operator configuration, not scraped input
            client: build_client(timeout, true)?,
            api_key,
            model: config.default_model.clone(),
            endpoint,
        })
    }

    /// Build from the app config, reading the key from the configured env var.
    pub fn from_config(config: &AppConfig, timeout: Duration) -> Result<Self> {
        let api_key = openrouter_api_key(config)?;
        Self::new(&config.openrouter, api_key, timeout)
    }
}

impl MessageGenerator for OpenRouterGenerator {
    #[instrument(skip_all, fields(company = %input.company_name, model = %self.model))]
    async fn generate(&self, input: &MessageInput) -> std::result::Result<MessageResult, StageError> {
        let prompt = user_prompt(input);
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: 0.7,
            max_tokens: 400,
        };

        let response = self
            .client
            .post(self.endpoint.as_str())
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| send_error(&self.endpoint, e))?;
        if !response.status().is_success() {
            return Err(status_error(&self.endpoint, &response));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| StageError::transient(format!("malformed completion response: {e}")))?;
        let Some(choice) = body.choices.into_iter().next() else {
            return Err(StageError::transient("completion had no choices"));
        };

        let message = clean_message(choice.message.content.as_deref().unwrap_or(""));
        if message.is_empty() {
            return Err(StageError::permanent("model returned an empty message"));
        }
        let confidence = match choice.finish_reason.as_deref() {
            Some("length") => CONFIDENCE_TRUNCATED,
            _ => CONFIDENCE_COMPLETE,
        };
        debug!(chars = message.len(), confidence, "message generated");
        Ok(MessageResult::generated(message, confidence))
    }
}

fn user_prompt(input: &MessageInput) -> String {
    let mut prompt = format!(
        "Write a {} outreach message to {}.",
        input.message_type, input.company_name
    );
    if let Some(industry) = &input.industry {
        prompt.push_str(&format!("\nIndustry: {industry}"));
    }
    if let Some(business_type) = &input.business_type {
        prompt.push_str(&format!("\nBusiness type: {business_type}"));
    }
    if let Some(about) = &input.about_content {
        prompt.push_str(&format!("\nAbout them: {about}"));
    }
    prompt
}

/// Trim whitespace and a pair of wrapping quotes the model sometimes adds.
fn clean_message(raw: &str) -> String {
    let trimmed = raw.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed);
    unquoted.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header as header_is, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn input() -> MessageInput {
        MessageInput {
            company_name: "Acme Widgets".into(),
            industry: Some("Manufacturing".into()),
            business_type: None,
            about_content: Some("Industrial widgets for small factories.".into()),
            message_type: "partnership".into(),
        }
    }

    fn generator(server: &MockServer) -> OpenRouterGenerator {
        let config = OpenRouterConfig {
            base_url: format!("{}/api/v1/", server.uri()),
            default_model: "test/model".into(),
            ..OpenRouterConfig::default()
        };
        OpenRouterGenerator::new(&config, "sk-test".into(), Duration::from_secs(5)).unwrap()
    }

    fn completion(content: &str, finish_reason: &str) -> serde_json::Value {
        json!({
            "id": "gen-1",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": finish_reason
            }]
        })
    }

    #[test]
    fn prompt_includes_known_attributes() {
        let prompt = user_prompt(&input());
        assert!(prompt.starts_with("Write a partnership outreach message to Acme Widgets."));
        assert!(prompt.contains("Industry: Manufacturing"));
        assert!(!prompt.contains("Business type"));
    }

    #[test]
    fn clean_message_strips_wrapping_quotes() {
        assert_eq!(clean_message("  \"Hi there\"\n"), "Hi there");
        assert_eq!(clean_message("Say \"hi\""), "Say \"hi\"");
    }

    #[tokio::test]
    async fn generates_message_from_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/chat/completions"))
            .and(header_is("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({ "model": "test/model" })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion("Hello Acme, let's build together.", "stop")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let result = generator(&server).generate(&input()).await.unwrap();
        assert_eq!(result.message.as_deref(), Some("Hello Acme, let's build together."));
        assert_eq!(result.confidence, Some(CONFIDENCE_COMPLETE));
    }

    #[tokio::test]
    async fn truncated_completion_has_lower_confidence() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("Hello Acme", "length")))
            .mount(&server)
            .await;

        let result = generator(&server).generate(&input()).await.unwrap();
        assert_eq!(result.confidence, Some(CONFIDENCE_TRUNCATED));
    }

    #[tokio::test]
    async fn api_failures_are_classified() {
        let server = MockServer::start().await;
        let g = generator(&server);

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        let err = g.generate(&input()).await.unwrap_err();
        assert!(matches!(err, StageError::ResourceExhausted { .. }));

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        let err = g.generate(&input()).await.unwrap_err();
        assert!(matches!(err, StageError::Permanent(_)));

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("   ", "stop")))
            .mount(&server)
            .await;
        let err = g.generate(&input()).await.unwrap_err();
        assert!(err.reason().contains("empty message"));
    }
}
