use crate::core::provider::{LlmProvider, StructuredRequest};
use crate::core::workflow::contract::{OutputType, TaskKind};
use crate::core::workflow::executor::{
    PartialSink, TaskError, TaskErrorKind, TaskExecutor, TaskOutput, TaskRequest,
};
use crate::core::workflow::state::JobId;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::{AbortHandle, Abortable};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();

fn placeholder() -> &'static Regex {
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").expect("placeholder pattern compiles")
    })
}

/// Prompt pair plus the structured output type requested from the model.
#[derive(Debug, Clone)]
pub struct PromptSpec {
    pub system: String,
    /// `{{key}}` placeholders are replaced with the task input of that name.
    pub user_template: String,
    pub output: OutputType,
}

impl PromptSpec {
    pub fn new(
        system: impl Into<String>,
        user_template: impl Into<String>,
        output: OutputType,
    ) -> Self {
        Self {
            system: system.into(),
            user_template: user_template.into(),
            output,
        }
    }

    /// Render the user prompt. Strings are inserted verbatim, anything else as pretty JSON.
    pub fn render(&self, input: &Map<String, Value>) -> Result<String, TaskError> {
        let mut missing = Vec::new();
        let rendered = placeholder().replace_all(&self.user_template, |caps: &regex::Captures| {
            let key = &caps[1];
            match input.get(key) {
                Some(Value::String(text)) => text.clone(),
                Some(other) => serde_json::to_string_pretty(other).unwrap_or_default(),
                None => {
                    missing.push(key.to_string());
                    String::new()
                }
            }
        });
        if !missing.is_empty() {
            return Err(TaskError::new(
                TaskErrorKind::InvalidInput,
                format!("prompt references missing inputs: {}", missing.join(", ")),
            ));
        }
        Ok(rendered.into_owned())
    }
}

/// Executor that answers a task kind with one structured LLM call.
///
/// Streaming contracts receive a live sink and forward every partial value
/// to it; other contracts get a detached sink and a plain generate call.
/// In-flight calls are tracked per run, so a superseded run's call and its
/// successor's never share a handle.
pub struct LlmTaskExecutor {
    provider: Arc<dyn LlmProvider>,
    prompts: DashMap<TaskKind, PromptSpec>,
    model: Option<String>,
    in_flight: DashMap<CallKey, AbortHandle>,
}

type CallKey = (JobId, Uuid, TaskKind);

impl LlmTaskExecutor {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            prompts: DashMap::new(),
            model: None,
            in_flight: DashMap::new(),
        }
    }

    pub fn with_prompt(self, kind: impl Into<TaskKind>, prompt: PromptSpec) -> Self {
        self.prompts.insert(kind.into(), prompt);
        self
    }

    /// Override the provider's default model for every call.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<TaskKind> = self.prompts.iter().map(|e| e.key().clone()).collect();
        kinds.sort();
        kinds
    }

    /// Abort every in-flight call for `kind` on `job_id`, whichever run issued
    /// it. Returns whether any was running.
    pub fn cancel(&self, job_id: &JobId, kind: &TaskKind) -> bool {
        let keys: Vec<CallKey> = self
            .in_flight
            .iter()
            .filter(|entry| {
                let (job, _, task) = entry.key();
                job == job_id && task == kind
            })
            .map(|entry| entry.key().clone())
            .collect();
        let mut cancelled = false;
        for key in keys {
            cancelled |= self.abort(&key);
        }
        cancelled
    }

    /// Abort the call for `kind` issued by run `run_id` only.
    pub fn cancel_run(&self, job_id: &JobId, run_id: Uuid, kind: &TaskKind) -> bool {
        self.abort(&(job_id.clone(), run_id, kind.clone()))
    }

    fn abort(&self, key: &CallKey) -> bool {
        let Some((_, handle)) = self.in_flight.remove(key) else {
            return false;
        };
        handle.abort();
        let (job_id, run_id, kind) = key;
        tracing::info!(job_id = %job_id, run_id = %run_id, task = %kind, "cancelled provider call");
        true
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[async_trait]
impl TaskExecutor for LlmTaskExecutor {
    async fn execute(
        &self,
        request: TaskRequest,
        partials: PartialSink,
    ) -> Result<TaskOutput, TaskError> {
        let prompt = self
            .prompts
            .get(&request.kind)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                TaskError::new(
                    TaskErrorKind::Internal,
                    format!("no prompt registered for {}", request.kind),
                )
                .retryable(false)
            })?;
        let structured = StructuredRequest {
            schema: prompt.output.schema.clone(),
            schema_name: prompt.output.name.clone(),
            system_prompt: prompt.system.clone(),
            user_prompt: prompt.render(&request.input)?,
            model: self.model.clone(),
        };

        let (handle, registration) = AbortHandle::new_pair();
        let slot = (request.job_id.clone(), request.run_id, request.kind.clone());
        self.in_flight.insert(slot.clone(), handle);

        let provider = self.provider.clone();
        let call = async move {
            if partials.is_detached() {
                return provider.generate_structured_output(structured).await;
            }
            let on_partial = move |partial: Value| partials.emit(partial);
            provider
                .stream_structured_output(structured, &on_partial)
                .await
        };
        tracing::debug!(
            job_id = %request.job_id,
            task = %request.kind,
            attempt = request.attempt,
            "calling provider"
        );
        let outcome = Abortable::new(call, registration).await;
        self.in_flight.remove(&slot);

        let value = match outcome {
            Ok(result) => result?,
            Err(_aborted) => {
                return Err(TaskError::new(
                    TaskErrorKind::Cancelled,
                    format!("{} was cancelled", request.kind),
                ))
            }
        };
        let model = self.model.clone().map(Value::String).unwrap_or(Value::Null);
        Ok(TaskOutput::new(value).with_auxiliary(json!({ "model": model })))
    }
}
