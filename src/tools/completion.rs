//! Completion tool: single-turn requests to a hosted chat-completion endpoint.

use crate::config::CompletionConfig;
use crate::error::{AgentError, Result};
use crate::tools::registry::{
    Capability, ParamSpec, ParamType, ToolDescriptor, ToolHandler, ToolInput, ToolOutput,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Client for an OpenAI-compatible chat-completion endpoint.
pub struct CompletionClient {
    client: reqwest::Client,
    config: CompletionConfig,
}

impl CompletionClient {
    pub fn new(config: CompletionConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Runs one single-turn completion.
    pub async fn complete(
        &self,
        prompt: &str,
        max_tokens: Option<u32>,
        temperature: Option<f64>,
    ) -> Result<String> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user".into(),
                content: prompt.to_string(),
            }],
            max_tokens: max_tokens.unwrap_or(self.config.max_tokens),
            temperature,
        };

        let url = format!("{}/chat/completions", self.config.base_url);
        debug!("Completion request to {}", url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AgentError::NetworkTimeout(self.config.request_timeout.as_millis() as u64)
                } else {
                    AgentError::Completion(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    AgentError::Completion("completion endpoint rejected the API key".into())
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    AgentError::Completion("completion endpoint rate limited the request".into())
                }
                _ => AgentError::Completion(format!("HTTP {status}: {detail}")),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Completion(format!("malformed response: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| AgentError::Completion("response contained no choices".into()))
    }
}

/// Conversational fallback and general-purpose completion tool.
pub struct CompletionTool {
    client: CompletionClient,
}

impl CompletionTool {
    pub fn new(config: CompletionConfig) -> Self {
        Self {
            client: CompletionClient::new(config),
        }
    }
}

#[async_trait]
impl ToolHandler for CompletionTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "completion".into(),
            capability: Capability::Completion,
            description: "Answer with a single-turn language-model completion.".into(),
            input_schema: vec![
                ParamSpec::required("prompt", ParamType::String, "Prompt text"),
                ParamSpec::optional("max_tokens", ParamType::Integer, "Response token cap"),
                ParamSpec::optional("temperature", ParamType::Number, "Sampling temperature"),
            ],
        }
    }

    // A completion produces no side effects; retrying a failed call is safe.
    fn idempotent(&self) -> bool {
        true
    }

    async fn prepare(&self, text: &str) -> Result<Value> {
        Ok(json!({ "prompt": text }))
    }

    #[instrument(skip(self, input), fields(tool = "completion"))]
    async fn invoke(&self, input: ToolInput) -> Result<ToolOutput> {
        let prompt = input
            .str_arg("prompt")
            .ok_or_else(|| AgentError::InvalidInput("parameter 'prompt' is required".into()))?;

        // Earlier chain steps become context so compound requests can build
        // on tool results.
        let prompt = if input.context.is_empty() {
            prompt.to_string()
        } else {
            let context = input
                .context
                .iter()
                .map(Value::to_string)
                .collect::<Vec<_>>()
                .join("\n");
            format!("Context from previous steps:\n{context}\n\nRequest: {prompt}")
        };

        let max_tokens = input
            .args
            .get("max_tokens")
            .and_then(Value::as_u64)
            .map(|v| v as u32);
        let temperature = input.args.get("temperature").and_then(Value::as_f64);

        let content = self.client.complete(&prompt, max_tokens, temperature).await?;
        Ok(ToolOutput::Text(content))
    }
}
