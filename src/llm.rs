//! Chat-completion client.
//!
//! The executor makes exactly one call per chunk delivery. There is no
//! automatic retry here: throttling (429) is handled by requeueing the chunk
//! message, so the client only reports what the service said.

use std::time::Duration;

use async_trait::async_trait;
use docflow_core::error::PipelineError;
use docflow_core::models::TokenUsage;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
}

impl ChatRequest {
    /// System message from configuration; the user turn is the prompt
    /// followed by the chunk text.
    pub fn build(config: &LlmConfig, prompt: &str, input_text: &str) -> Self {
        Self {
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: config.system_message.clone(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: format!("{}\ninput text:{}", prompt, input_text),
                },
            ],
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    message: Option<ChatMessageBody>,
}

#[derive(Debug, Deserialize)]
struct ChatMessageBody {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    completion_tokens: i64,
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    total_tokens: i64,
}

/// Raw HTTP reply from the completion endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionReply {
    pub status: u16,
    pub body: String,
}

/// What a completion reply means for the chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    Completed {
        content: String,
        usage: TokenUsage,
        response: serde_json::Value,
    },
    ContentFiltered,
    /// HTTP 200 with a finish reason other than `stop` or `content_filter`.
    Unfinished { finish_reason: String },
    Throttled,
    BadRequest { body: String },
    Failed { status: u16, body: String },
}

impl CompletionReply {
    pub fn interpret(&self) -> Result<CompletionOutcome, PipelineError> {
        match self.status {
            200 => {}
            429 => return Ok(CompletionOutcome::Throttled),
            400 => {
                return Ok(CompletionOutcome::BadRequest {
                    body: self.body.clone(),
                })
            }
            status => {
                return Ok(CompletionOutcome::Failed {
                    status,
                    body: self.body.clone(),
                })
            }
        }

        let response: serde_json::Value = serde_json::from_str(&self.body).map_err(|e| {
            PipelineError::ServiceAnomaly(format!("unreadable completion response: {}", e))
        })?;
        let parsed: ChatResponse = serde_json::from_value(response.clone()).map_err(|e| {
            PipelineError::ServiceAnomaly(format!("unexpected completion response: {}", e))
        })?;
        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            PipelineError::ServiceAnomaly("completion response has no choices".to_string())
        })?;

        match choice.finish_reason.as_deref() {
            Some("stop") => {
                let usage = parsed
                    .usage
                    .map(|u| TokenUsage {
                        completion_tokens: u.completion_tokens,
                        prompt_tokens: u.prompt_tokens,
                        total_tokens: u.total_tokens,
                    })
                    .unwrap_or_default();
                Ok(CompletionOutcome::Completed {
                    content: choice
                        .message
                        .and_then(|m| m.content)
                        .unwrap_or_default(),
                    usage,
                    response,
                })
            }
            Some("content_filter") => Ok(CompletionOutcome::ContentFiltered),
            other => Ok(CompletionOutcome::Unfinished {
                finish_reason: other.unwrap_or("none").to_string(),
            }),
        }
    }
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<CompletionReply, PipelineError>;
}

/// Azure OpenAI deployment endpoint.
pub struct AzureOpenAiClient {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl AzureOpenAiClient {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let url = format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            config.endpoint.trim_end_matches('/'),
            config.deployment_id,
            config.api_version
        );
        Ok(Self {
            client,
            url,
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl CompletionService for AzureOpenAiClient {
    async fn complete(&self, request: &ChatRequest) -> Result<CompletionReply, PipelineError> {
        let response = self
            .client
            .post(&self.url)
            .header("api-key", &self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| PipelineError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| PipelineError::Transport(e.to_string()))?;
        Ok(CompletionReply { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(status: u16, body: &str) -> CompletionReply {
        CompletionReply {
            status,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_request_concatenates_prompt_and_input() {
        let config = LlmConfig {
            system_message: "be brief".to_string(),
            max_tokens: 50,
            ..Default::default()
        };
        let request = ChatRequest::build(&config, "Summarise:", "the text");
        assert_eq!(request.messages[0].role, "system");
        assert_eq!(request.messages[0].content, "be brief");
        assert_eq!(request.messages[1].content, "Summarise:\ninput text:the text");
        assert_eq!(request.max_tokens, 50);

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["top_p"], 1.0);
    }

    #[test]
    fn test_interpret_stop() {
        let body = r#"{"choices":[{"finish_reason":"stop","message":{"role":"assistant","content":"short"}}],
                       "usage":{"completion_tokens":3,"prompt_tokens":40,"total_tokens":43}}"#;
        match reply(200, body).interpret().unwrap() {
            CompletionOutcome::Completed {
                content, usage, ..
            } => {
                assert_eq!(content, "short");
                assert_eq!(usage.total_tokens, 43);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_interpret_non_success() {
        let filtered = r#"{"choices":[{"finish_reason":"content_filter","message":{}}]}"#;
        assert_eq!(
            reply(200, filtered).interpret().unwrap(),
            CompletionOutcome::ContentFiltered
        );
        assert_eq!(
            reply(429, "slow down").interpret().unwrap(),
            CompletionOutcome::Throttled
        );
        assert_eq!(
            reply(400, "bad").interpret().unwrap(),
            CompletionOutcome::BadRequest {
                body: "bad".to_string()
            }
        );
        assert!(matches!(
            reply(500, "").interpret().unwrap(),
            CompletionOutcome::Failed { status: 500, .. }
        ));
        let length = r#"{"choices":[{"finish_reason":"length","message":{"content":"cut"}}]}"#;
        assert!(matches!(
            reply(200, length).interpret().unwrap(),
            CompletionOutcome::Unfinished { .. }
        ));
        assert!(reply(200, r#"{"choices":[]}"#).interpret().is_err());
    }
}
