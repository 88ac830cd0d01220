use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use tracing::warn;

use crate::adapter::ChunkStream;
use crate::config::MODELS;
use crate::models::{ChatCompletionRequest, ModelList};
use crate::util::{bearer_token, error_response, unix_timestamp, AppState};

/// Configure Actix-web routes with AppState.
pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .route("/status", web::get().to(status))
            .route("/v1/models", web::get().to(list_models))
            .route("/v1/chat/completions", web::post().to(chat_completions)),
    );
}

/// Service status endpoint exposing the active prompt strategy and pool size.
async fn status(state: web::Data<AppState>) -> impl Responder {
    let routes = vec!["/status", "/v1/models", "/v1/chat/completions"];

    web::Json(serde_json::json!({
        "name": "falgate",
        "version": env!("CARGO_PKG_VERSION"),
        "routes": routes,
        "credentials": state.engine.pool().len(),
        "auth_required": state.authorization_token.is_some(),
        "prompt": {
            "strategy": state.engine.assembler().name(),
            "char_limit": state.prompt_char_limit,
        },
    }))
}

async fn list_models() -> impl Responder {
    web::Json(ModelList::from_ids(MODELS, unix_timestamp()))
}

/// Encode chunks as SSE frames followed by the `[DONE]` sentinel.
pub fn sse_frames(chunks: ChunkStream) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    chunks
        .filter_map(|chunk| async move {
            match serde_json::to_vec(&chunk) {
                Ok(json) => {
                    let mut out = Vec::with_capacity(json.len() + 8);
                    out.extend_from_slice(b"data: ");
                    out.extend_from_slice(&json);
                    out.extend_from_slice(b"\n\n");
                    Some(Ok(Bytes::from(out)))
                }
                Err(err) => {
                    warn!("Failed to serialize chat chunk: {}", err);
                    None
                }
            }
        })
        .chain(stream::once(async {
            Ok(Bytes::from_static(b"data: [DONE]\n\n"))
        }))
}

/// OpenAI-compatible chat completions backed by fal any-llm.
async fn chat_completions(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<serde_json::Value>,
) -> impl Responder {
    let request = match serde_json::from_value::<ChatCompletionRequest>(body.into_inner()) {
        Ok(request) => request,
        Err(e) => {
            return error_response(
                http::StatusCode::BAD_REQUEST,
                &format!("Invalid chat request: {}", e),
            );
        }
    };
    if request.messages.is_empty() {
        return error_response(http::StatusCode::BAD_REQUEST, "messages must not be empty");
    }

    let client_bearer = bearer_token(
        req.headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok()),
    );

    // With a configured token the bearer authenticates the client and the pool
    // picks the credential; otherwise the bearer is the fal credential itself.
    let credential = match state.authorization_token.as_deref() {
        Some(expected) => {
            if client_bearer.as_deref() != Some(expected) {
                warn!("Rejected chat request with missing or invalid bearer");
                return error_response(http::StatusCode::UNAUTHORIZED, "Invalid API key");
            }
            None
        }
        None => client_bearer,
    };

    let ChatCompletionRequest {
        model,
        messages,
        stream,
        reasoning,
    } = request;

    if stream {
        let chunks = state
            .engine
            .send_message(messages, credential.as_deref(), &model, reasoning);
        HttpResponse::Ok()
            .insert_header(("content-type", "text/event-stream"))
            .insert_header(("cache-control", "no-cache"))
            .insert_header(("connection", "keep-alive"))
            .streaming(sse_frames(chunks))
    } else {
        let completion = state
            .engine
            .send_message_sync(messages, credential.as_deref(), &model, reasoning)
            .await;
        HttpResponse::Ok().json(completion)
    }
}
