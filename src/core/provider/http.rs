#![allow(clippy::result_large_err)]

use super::partial_json::parse_partial;
use super::{LlmProvider, StructuredRequest};
use crate::core::config::ProviderConfig;
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::executor::{TaskError, TaskErrorKind};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::env;
use std::time::Duration;

const MAX_ERROR_BODY: usize = 512;

/// Client for any endpoint speaking the OpenAI chat-completions protocol with
/// `response_format: json_schema`.
#[derive(Clone)]
pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        default_model: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| {
                AppError::new(
                    ErrorCategory::ProviderError,
                    format!("failed to build HTTP client: {}", err),
                )
                .with_code("JF-PROVIDER-001")
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            default_model: default_model.into(),
        })
    }

    /// Build from configuration; the API key is read from `api_key_env` when set.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, AppError> {
        let api_key = env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
        if api_key.is_none() {
            tracing::debug!(
                env = %config.api_key_env,
                "no provider API key found; requests are sent unauthenticated"
            );
        }
        Self::new(
            config.base_url.clone(),
            api_key,
            config.model.clone(),
            config.request_timeout()?,
        )
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn body(&self, request: &StructuredRequest, stream: bool) -> Value {
        json!({
            "model": request.model.clone().unwrap_or_else(|| self.default_model.clone()),
            "messages": [
                {"role": "system", "content": request.system_prompt},
                {"role": "user", "content": request.user_prompt},
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": request.schema_name,
                    "schema": request.schema,
                },
            },
            "stream": stream,
        })
    }

    async fn send(
        &self,
        request: &StructuredRequest,
        stream: bool,
    ) -> Result<reqwest::Response, TaskError> {
        let mut builder = self.client.post(self.endpoint()).json(&self.body(request, stream));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    async fn generate_structured_output(
        &self,
        request: StructuredRequest,
    ) -> Result<Value, TaskError> {
        let response = self.send(&request, false).await?;
        let payload: Value = response.json().await.map_err(|err| {
            TaskError::new(
                TaskErrorKind::MalformedOutput,
                format!("provider response is not JSON: {}", err),
            )
        })?;
        let message = &payload["choices"][0]["message"];
        if let Some(refusal) = message["refusal"].as_str() {
            return Err(
                TaskError::new(TaskErrorKind::Provider, format!("model refused: {}", refusal))
                    .retryable(false),
            );
        }
        let content = message["content"].as_str().ok_or_else(|| {
            TaskError::new(
                TaskErrorKind::MalformedOutput,
                "provider response has no message content",
            )
        })?;
        parse_content(content)
    }

    async fn stream_structured_output(
        &self,
        request: StructuredRequest,
        on_partial: &(dyn Fn(Value) + Send + Sync),
    ) -> Result<Value, TaskError> {
        let response = self.send(&request, true).await?;
        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut content = String::new();
        let mut last_partial: Option<Value> = None;

        'read: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(transport_error)?;
            buffer.extend_from_slice(&chunk);
            while let Some(newline) = buffer.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&line);
                let Some(data) = line.trim().strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    break 'read;
                }
                let event: Value = serde_json::from_str(data).map_err(|err| {
                    TaskError::new(
                        TaskErrorKind::MalformedOutput,
                        format!("invalid stream event: {}", err),
                    )
                })?;
                let Some(delta) = event["choices"][0]["delta"]["content"].as_str() else {
                    continue;
                };
                content.push_str(delta);
                if let Some(partial) = parse_partial(&content) {
                    if last_partial.as_ref() != Some(&partial) {
                        on_partial(partial.clone());
                        last_partial = Some(partial);
                    }
                }
            }
        }

        parse_content(&content)
    }
}

fn parse_content(content: &str) -> Result<Value, TaskError> {
    serde_json::from_str(content.trim()).map_err(|err| {
        TaskError::new(
            TaskErrorKind::MalformedOutput,
            format!("model output is not valid JSON: {}", err),
        )
    })
}

fn transport_error(err: reqwest::Error) -> TaskError {
    if err.is_timeout() {
        TaskError::new(TaskErrorKind::Timeout, format!("provider request timed out: {}", err))
    } else {
        TaskError::new(TaskErrorKind::Network, format!("provider request failed: {}", err))
    }
}

/// Map a non-success HTTP status to a task error kind.
pub fn status_error(status: StatusCode, body: &str) -> TaskError {
    let snippet: String = body.chars().take(MAX_ERROR_BODY).collect();
    let message = format!("provider returned {}: {}", status, snippet.trim());
    let kind = match status.as_u16() {
        429 => TaskErrorKind::RateLimited,
        401 | 403 => TaskErrorKind::Auth,
        400 | 404 | 422 => TaskErrorKind::InvalidInput,
        408 => TaskErrorKind::Timeout,
        _ if status.is_server_error() => TaskErrorKind::Provider,
        _ => return TaskError::new(TaskErrorKind::Provider, message).retryable(false),
    };
    TaskError::new(kind, message)
}
