//! Request pipeline: directives → prompt → backend stream → OpenAI chunks.
//!
//! The backend resends the full text generated so far on every event.
//! `StreamState` keeps per-request cursors so each chunk carries only the new
//! characters, and wraps reasoning text in `<thinking>` markers when the
//! caller asked to see it.

use std::sync::Arc;

use futures_util::stream::{BoxStream, StreamExt};
use uuid::Uuid;

use crate::backend::{BackendArguments, BackendEvent, ANY_LLM_ENDPOINT};
use crate::config::is_reasoning_model;
use crate::credentials::{mask_credential, CredentialPool};
use crate::directives::{extract_features, DirectiveError, FeatureFlag};
use crate::models::{ChatCompletion, ChatCompletionChunk, ChatMessage, FinishReason};
use crate::prompt::{PromptAssembler, PromptError};
use crate::util::unix_timestamp;

pub const THINKING_OPEN: &str = "<thinking>\n";
pub const THINKING_CLOSE: &str = "</thinking>\n";

pub type ChunkStream = BoxStream<'static, ChatCompletionChunk>;

/// Failures detected before the backend is called.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Directive(#[from] DirectiveError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
}

/// Per-request cursor over the backend's cumulative text.
#[derive(Debug, Clone, Default)]
pub struct StreamState {
    reasoning_cursor: usize,
    output_cursor: usize,
    in_reasoning: bool,
    show_reasoning: bool,
}

impl StreamState {
    pub fn new(show_reasoning: bool) -> Self {
        Self {
            show_reasoning,
            ..Self::default()
        }
    }

    pub fn reasoning_cursor(&self) -> usize {
        self.reasoning_cursor
    }

    pub fn output_cursor(&self) -> usize {
        self.output_cursor
    }

    pub fn in_reasoning(&self) -> bool {
        self.in_reasoning
    }

    /// Characters of `cumulative` past `cursor`; the cursor moves by exactly
    /// the number of characters returned.
    fn take_increment(cumulative: Option<&str>, cursor: &mut usize) -> String {
        let Some(text) = cumulative else {
            return String::new();
        };
        let increment: String = text.chars().skip(*cursor).collect();
        *cursor += increment.chars().count();
        increment
    }

    /// Content to emit for `event`, or `None` when nothing new arrived.
    pub fn advance(&mut self, event: &BackendEvent) -> Option<String> {
        let reasoning = Self::take_increment(event.reasoning.as_deref(), &mut self.reasoning_cursor);
        let output = Self::take_increment(event.output.as_deref(), &mut self.output_cursor);

        let mut content = String::new();
        if self.show_reasoning && !reasoning.is_empty() {
            if !self.in_reasoning {
                self.in_reasoning = true;
                content.push_str(THINKING_OPEN);
            }
            content.push_str(&reasoning);
        }
        if !output.is_empty() {
            if self.in_reasoning {
                self.in_reasoning = false;
                content.push_str(THINKING_CLOSE);
            }
            content.push_str(&output);
        }

        (!content.is_empty()).then_some(content)
    }
}

/// Everything needed to call the backend for one request.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub arguments: BackendArguments,
    pub show_reasoning: bool,
}

/// Shared entry point used by the HTTP layer.
pub struct ChatEngine {
    pool: Arc<CredentialPool>,
    assembler: Arc<dyn PromptAssembler>,
}

impl ChatEngine {
    pub fn new(pool: Arc<CredentialPool>, assembler: Arc<dyn PromptAssembler>) -> Self {
        Self { pool, assembler }
    }

    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    pub fn assembler(&self) -> &dyn PromptAssembler {
        self.assembler.as_ref()
    }

    /// Run directive extraction and prompt assembly.
    ///
    /// Reasoning is shown when requested explicitly, when the first message
    /// carries the reasoning flag, or by default for reasoning models.
    pub fn prepare(
        &self,
        mut messages: Vec<ChatMessage>,
        model: &str,
        reasoning: Option<bool>,
    ) -> Result<PreparedRequest, RequestError> {
        let features = extract_features(&mut messages)?;
        let bundle = self.assembler.assemble(&messages, &features)?;
        let show_reasoning = reasoning.unwrap_or_else(|| is_reasoning_model(model))
            || features.is_enabled(FeatureFlag::Reasoning);

        tracing::debug!("System Prompt: \n{}", bundle.system_prompt);
        tracing::debug!("User Prompt: \n{}", bundle.user_prompt);

        Ok(PreparedRequest {
            arguments: BackendArguments {
                prompt: bundle.user_prompt,
                system_prompt: bundle.system_prompt,
                reasoning: show_reasoning,
                model: model.to_string(),
            },
            show_reasoning,
        })
    }

    /// Stream OpenAI chunks for `messages`.
    ///
    /// The stream always ends with exactly one chunk whose `finish_reason` is
    /// `stop` or `error`; failures never surface as stream errors. Dropping the
    /// stream cancels the in-flight backend read.
    pub fn send_message(
        &self,
        messages: Vec<ChatMessage>,
        credential: Option<&str>,
        model: &str,
        reasoning: Option<bool>,
    ) -> ChunkStream {
        // Rotation only advances for requests that will reach the backend.
        let ready = self
            .prepare(messages, model, reasoning)
            .map(|prepared| (prepared, self.pool.select(credential)));
        let request_id = format!("chatcmpl-{}", Uuid::new_v4());
        let model = model.to_string();

        if let Ok((_, client)) = &ready {
            tracing::info!(
                request_id = %request_id,
                model = %model,
                credential = %client.credential().map(mask_credential).unwrap_or_else(|| "anonymous".into()),
                "chat completion requested"
            );
        }

        async_stream::stream! {
            let mut failure: Option<String> = None;

            match ready {
                Err(err) => {
                    tracing::warn!(request_id = %request_id, "request rejected before backend call: {}", err);
                    failure = Some(err.to_string());
                }
                Ok((prepared, client)) => match client.stream(ANY_LLM_ENDPOINT, &prepared.arguments).await {
                    Err(err) => {
                        tracing::error!(request_id = %request_id, "backend call failed: {}", err);
                        failure = Some(err.to_string());
                    }
                    Ok(mut events) => {
                        let mut state = StreamState::new(prepared.show_reasoning);
                        while let Some(item) = events.next().await {
                            match item {
                                Ok(event) => {
                                    if let Some(message) = event.error_message() {
                                        tracing::error!(request_id = %request_id, "backend reported error: {}", message);
                                        failure = Some(message.to_string());
                                        break;
                                    }
                                    if let Some(content) = state.advance(&event) {
                                        tracing::debug!(request_id = %request_id, "{}", content);
                                        yield ChatCompletionChunk::new(&request_id, unix_timestamp(), &model, content, None);
                                    }
                                }
                                Err(err) => {
                                    tracing::warn!(request_id = %request_id, "backend stream interrupted: {}", err);
                                    failure = Some(err.to_string());
                                    break;
                                }
                            }
                        }
                    }
                },
            }

            let last = match failure {
                Some(message) => ChatCompletionChunk::new(
                    &request_id,
                    unix_timestamp(),
                    &model,
                    format!("ERROR: {message}"),
                    Some(FinishReason::Error),
                ),
                None => ChatCompletionChunk::new(&request_id, unix_timestamp(), &model, "", Some(FinishReason::Stop)),
            };
            yield last;
        }
        .boxed()
    }

    /// Run `send_message` to completion and fold it into one response.
    pub async fn send_message_sync(
        &self,
        messages: Vec<ChatMessage>,
        credential: Option<&str>,
        model: &str,
        reasoning: Option<bool>,
    ) -> ChatCompletion {
        let chunks = self.send_message(messages, credential, model, reasoning);
        collect_completion(chunks, model).await
    }
}

/// Concatenate a chunk stream into a non-streaming completion.
///
/// An error chunk replaces the content with its own text; `id` and `created`
/// come from the last chunk observed.
pub async fn collect_completion(mut chunks: ChunkStream, model: &str) -> ChatCompletion {
    let mut content = String::new();
    let mut error: Option<String> = None;
    let mut last: Option<ChatCompletionChunk> = None;

    while let Some(chunk) = chunks.next().await {
        content.push_str(chunk.content());
        if chunk.finish_reason() == Some(FinishReason::Error) {
            error = Some(chunk.content().to_string());
        }
        last = Some(chunk);
    }

    let (id, created) = match last {
        Some(chunk) => (chunk.id, chunk.created),
        None => (format!("chatcmpl-{}", Uuid::new_v4()), unix_timestamp()),
    };
    match error {
        Some(message) => ChatCompletion::new(id, created, model, message, FinishReason::Error),
        None => ChatCompletion::new(id, created, model, content, FinishReason::Stop),
    }
}
