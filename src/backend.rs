//! Backend client for the fal `any-llm` streaming endpoint.
//!
//! The call is a JSON POST to `{host}/{endpoint}/stream`; the response is a
//! Server-Sent Events body whose `data:` payloads carry the *cumulative*
//! `output` / `reasoning` text generated so far, or an `error`.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Deserializer, Serialize};

pub const ANY_LLM_ENDPOINT: &str = "fal-ai/any-llm";
pub const DEFAULT_FAL_RUN_HOST: &str = "https://fal.run";

/// Arguments accepted by the any-llm application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendArguments {
    pub prompt: String,
    pub system_prompt: String,
    pub reasoning: bool,
    pub model: String,
}

/// One decoded stream event. Text fields are cumulative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BackendEvent {
    #[serde(default, deserialize_with = "lenient_text")]
    pub error: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub reasoning: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub output: Option<String>,
}

impl BackendEvent {
    pub fn output(text: &str) -> Self {
        Self {
            output: Some(text.to_string()),
            ..Self::default()
        }
    }

    pub fn reasoning(reasoning: &str, output: &str) -> Self {
        Self {
            reasoning: Some(reasoning.to_string()),
            output: Some(output.to_string()),
            ..Self::default()
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Error text when the event reports a failure.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.is_empty())
    }
}

/// Accept strings as-is and render any other non-null JSON value as text.
fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed stream event: {0}")]
    Decode(String),
}

pub type EventStream = BoxStream<'static, Result<BackendEvent, BackendError>>;

/// A handle able to start one streaming completion.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn stream(
        &self,
        endpoint: &str,
        arguments: &BackendArguments,
    ) -> Result<EventStream, BackendError>;

    /// Credential this client authenticates with, if any.
    fn credential(&self) -> Option<&str> {
        None
    }
}

/// reqwest-backed fal client bound to one credential.
#[derive(Clone)]
pub struct FalClient {
    http: reqwest::Client,
    base_url: String,
    credential: Option<String>,
}

impl FalClient {
    pub fn new(http: reqwest::Client, base_url: &str, credential: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credential: credential.filter(|c| !c.trim().is_empty()),
        }
    }

    fn stream_url(&self, endpoint: &str) -> String {
        format!("{}/{}/stream", self.base_url, endpoint.trim_matches('/'))
    }
}

#[async_trait]
impl BackendClient for FalClient {
    async fn stream(
        &self,
        endpoint: &str,
        arguments: &BackendArguments,
    ) -> Result<EventStream, BackendError> {
        let url = self.stream_url(endpoint);
        let mut rb = self
            .http
            .post(&url)
            .header(http::header::ACCEPT, "text/event-stream")
            .header(http::header::CONTENT_TYPE, "application/json")
            .json(arguments);
        if let Some(key) = &self.credential {
            rb = rb.header(http::header::AUTHORIZATION, format!("Key {key}"));
        }

        let resp = rb
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Rejected {
                status: status.as_u16(),
                message: rejection_message(&body),
            });
        }

        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| BackendError::Transport(e.to_string())))
            .boxed();
        Ok(SseEventStream::new(body).boxed())
    }

    fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }
}

/// Pull a human readable message out of an error body (`detail` when JSON).
fn rejection_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        match value.get("detail") {
            Some(serde_json::Value::String(s)) => return s.clone(),
            Some(other) if !other.is_null() => return other.to_string(),
            _ => {}
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "empty response body".to_string()
    } else {
        trimmed.to_string()
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|idx| idx + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

/// Splits an SSE byte stream into frames and decodes each `data:` payload.
///
/// Frames without data (comments, keep-alives) are skipped. A body error or an
/// undecodable frame yields one `Err` and ends the stream.
pub struct SseEventStream<S> {
    inner: S,
    buffer: Vec<u8>,
    done: bool,
}

impl<S> SseEventStream<S>
where
    S: Stream<Item = Result<Bytes, BackendError>> + Unpin,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            done: false,
        }
    }

    /// Decode one frame; `None` when it carries no event.
    fn decode_frame(frame: &[u8]) -> Option<Result<BackendEvent, BackendError>> {
        let mut data_segments: Vec<&[u8]> = Vec::new();
        for line in frame.split(|&b| b == b'\n') {
            if let Some(rest) = line.strip_prefix(b"data:") {
                data_segments.push(trim_ascii(rest));
            }
        }
        if data_segments.is_empty() {
            return None;
        }
        let payload = data_segments.join(&b'\n');
        let payload = trim_ascii(&payload);
        if payload.is_empty() || payload == b"[DONE]" {
            return None;
        }
        Some(serde_json::from_slice::<BackendEvent>(payload).map_err(|e| {
            BackendError::Decode(format!(
                "{e}: {}",
                String::from_utf8_lossy(payload).chars().take(120).collect::<String>()
            ))
        }))
    }

    fn next_frame(&mut self) -> Option<Vec<u8>> {
        let pos = self.buffer.windows(2).position(|w| w == b"\n\n")?;
        let mut frame: Vec<u8> = self.buffer.drain(..pos + 2).collect();
        frame.truncate(pos);
        Some(frame)
    }
}

impl<S> Stream for SseEventStream<S>
where
    S: Stream<Item = Result<Bytes, BackendError>> + Unpin,
{
    type Item = Result<BackendEvent, BackendError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            while let Some(frame) = this.next_frame() {
                if let Some(item) = Self::decode_frame(&frame) {
                    if item.is_err() {
                        this.done = true;
                        this.buffer.clear();
                    }
                    return Poll::Ready(Some(item));
                }
            }

            if this.done {
                // A trailing frame without the blank-line terminator still counts.
                let remaining = std::mem::take(&mut this.buffer);
                return Poll::Ready(Self::decode_frame(&remaining));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buffer.extend(chunk.iter().copied().filter(|&b| b != b'\r'));
                }
                Poll::Ready(Some(Err(err))) => {
                    this.done = true;
                    this.buffer.clear();
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    this.done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn sse(chunks: Vec<&'static str>) -> SseEventStream<BoxStream<'static, Result<Bytes, BackendError>>> {
        let parts = chunks
            .into_iter()
            .map(|c| Ok(Bytes::from_static(c.as_bytes())))
            .collect::<Vec<_>>();
        SseEventStream::new(stream::iter(parts).boxed())
    }

    #[tokio::test]
    async fn decodes_frames_split_across_chunks() {
        let events: Vec<_> = sse(vec![
            ": keep-alive\n\n",
            "event: message\ndata: {\"output\": \"He\", \"partial\": true}\n",
            "\ndata: {\"output\": \"Hello\", \"reasoning\": null}\r\n\r\n",
            "data: {\"output\": \"Hello!\", \"error\": null}",
        ])
        .collect()
        .await;

        assert_eq!(
            events,
            vec![
                Ok(BackendEvent::output("He")),
                Ok(BackendEvent::output("Hello")),
                Ok(BackendEvent::output("Hello!")),
            ]
        );
    }

    #[tokio::test]
    async fn undecodable_frame_ends_the_stream() {
        let events: Vec<_> = sse(vec![
            "data: {\"output\": \"a\"}\n\n",
            "data: not json\n\n",
            "data: {\"output\": \"ab\"}\n\n",
        ])
        .collect()
        .await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], Ok(BackendEvent::output("a")));
        assert!(matches!(events[1], Err(BackendError::Decode(_))));
    }

    #[tokio::test]
    async fn body_error_is_forwarded_once() {
        let parts: Vec<Result<Bytes, BackendError>> = vec![
            Ok(Bytes::from_static(b"data: {\"output\": \"a\"}\n\n")),
            Err(BackendError::Transport("connection reset".into())),
            Ok(Bytes::from_static(b"data: {\"output\": \"ab\"}\n\n")),
        ];
        let events: Vec<_> = SseEventStream::new(stream::iter(parts)).collect().await;
        assert_eq!(
            events,
            vec![
                Ok(BackendEvent::output("a")),
                Err(BackendError::Transport("connection reset".into())),
            ]
        );
    }

    #[test]
    fn non_string_error_is_rendered_as_text() {
        let ev: BackendEvent =
            serde_json::from_str(r#"{"error": {"code": 7}, "output": ""}"#).unwrap();
        assert_eq!(ev.error_message(), Some(r#"{"code":7}"#));
        let ok: BackendEvent = serde_json::from_str(r#"{"error": "", "output": "x"}"#).unwrap();
        assert_eq!(ok.error_message(), None);
    }

    #[test]
    fn rejection_message_prefers_detail() {
        assert_eq!(
            rejection_message(r#"{"detail": "No user found for Key ID and Secret"}"#),
            "No user found for Key ID and Secret"
        );
        assert_eq!(rejection_message("  Unauthorized "), "Unauthorized");
        assert_eq!(rejection_message(""), "empty response body");
    }

    #[test]
    fn fal_client_ignores_blank_credentials() {
        let client = FalClient::new(reqwest::Client::new(), "https://fal.run/", Some("  ".into()));
        assert_eq!(client.credential(), None);
        assert_eq!(
            client.stream_url(ANY_LLM_ENDPOINT),
            "https://fal.run/fal-ai/any-llm/stream"
        );
    }
}
