//! LLM provider collaborators used by the built-in task executors.

pub mod http;
pub mod partial_json;

pub use http::OpenAiCompatibleProvider;

use crate::core::workflow::executor::TaskError;
use async_trait::async_trait;
use serde_json::Value;

/// One structured-output generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredRequest {
    /// JSON schema the provider must conform to.
    pub schema: Value,
    pub schema_name: String,
    pub system_prompt: String,
    pub user_prompt: String,
    /// Provider default when `None`.
    pub model: Option<String>,
}

#[async_trait]
pub trait LlmProvider: Send + Sync + 'static {
    async fn generate_structured_output(&self, request: StructuredRequest)
        -> Result<Value, TaskError>;

    /// Streaming variant. `on_partial` is called zero or more times with
    /// best-effort partial values, always before the call resolves.
    async fn stream_structured_output(
        &self,
        request: StructuredRequest,
        on_partial: &(dyn Fn(Value) + Send + Sync),
    ) -> Result<Value, TaskError> {
        let _ = on_partial;
        self.generate_structured_output(request).await
    }
}
