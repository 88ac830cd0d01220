#![forbid(unsafe_code)]
#![doc = r#"
Falgate

Expose an OpenAI Chat Completions surface in front of fal.ai's `any-llm` application.

Crate highlights
- Library: `ChatEngine::send_message` (streaming chunks) and `ChatEngine::send_message_sync` (single completion).
- HTTP server (in `server`): `/v1/models`, `/v1/chat/completions` (SSE when `stream: true`), `/status`.
- Credential rotation across several fal keys (`API_KEYS`), or a per-request key via the bearer header.

Modules
- `models`: Chat Completions request/response data structures.
- `directives`: `<roleInfo>` block and feature flag extraction from the first message.
- `prompt`: Transcript → prompt pair assembly (simple or character-budgeted).
- `backend`: fal streaming client and SSE event decoding.
- `adapter`: Cumulative backend text → incremental OpenAI chunks, plus aggregation.
- `credentials`: Client pool with round-robin selection.
- `config`: CLI/env configuration and the advertised model list.
- `server`: Actix-web routes and handlers.
- `util`: Shared helpers (tracing, HTTP client, CORS, error responses).

Note: fal resends the whole generated text on every event; the adapter is the only place that turns it into deltas.
"#]

pub mod adapter;
pub mod backend;
pub mod config;
pub mod credentials;
pub mod directives;
pub mod models;
pub mod prompt;
pub mod server;
pub mod util;

pub use crate::adapter::{collect_completion, ChatEngine, ChunkStream, RequestError, StreamState};
pub use crate::backend::{
    BackendArguments, BackendClient, BackendError, BackendEvent, EventStream, FalClient,
};
pub use crate::config::{Config, MODELS};
pub use crate::credentials::{ClientFactory, CredentialPool};
pub use crate::directives::{extract_features, FeatureFlag, FeatureSet, RoleLabels};
pub use crate::prompt::{
    BudgetedAssembler, PromptAssembler, PromptBundle, PromptError, PromptStrategy,
    SimpleAssembler,
};
