// src/handlers/chat.rs
use crate::error::ApiError;
use crate::gemini_client::{Content, GeminiClient, GeminiError, GenerateContentRequest, GenerationConfig};
use crate::middleware::auth::{auth_middleware, CurrentUser};
use crate::models::chat::{ChatMessage, ChatRequest, ChatResponse, Role};
use crate::prompts;
use crate::sse::StreamFrame;
use crate::SharedState;
use axum::{
    body::Body,
    extract::Extension,
    http::header,
    response::{Json, Response},
    routing::post,
    Router,
};
use futures::stream::{self, Stream, StreamExt};
use std::convert::Infallible;

/// Rough chars-per-token ratio used to keep requests under the input budget.
const CHARS_PER_TOKEN: usize = 4;

pub fn chat_routes() -> Router {
    Router::new()
        .route("/api/chat/chat", post(chat_stream))
        .route("/api/chat/chat/sync", post(chat_sync))
        .layer(axum::middleware::from_fn(auth_middleware))
}

async fn chat_stream(
    Extension(state): Extension<SharedState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(payload): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let gemini = gemini_client(&state)?;
    let request = build_request(&state, &payload)?;
    tracing::info!(user_id = %user.id, history = request.contents.len(), "streaming chat request");

    let upstream = gemini.stream_generate_content(&request).await.map_err(|e| {
        ApiError::Internal(format!("Error processing chat message: {}", e))
    })?;

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(sse_frames(upstream)))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

async fn chat_sync(
    Extension(state): Extension<SharedState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let gemini = gemini_client(&state)?;
    let request = build_request(&state, &payload)?;
    tracing::info!(user_id = %user.id, history = request.contents.len(), "sync chat request");

    let reply = gemini
        .generate_text(&request)
        .await
        .map_err(|e| ApiError::Internal(format!("Error processing chat message: {}", e)))?;

    let history = payload.conversation_history.unwrap_or_default();
    Ok(Json(ChatResponse::after_exchange(&history, &payload.message, reply)))
}

fn gemini_client(state: &SharedState) -> Result<&GeminiClient, ApiError> {
    state.gemini_client.as_ref().ok_or_else(|| {
        ApiError::ServiceUnavailable(
            "Gemini API key not configured. Please set GEMINI_API_KEY in your .env file.".to_string(),
        )
    })
}

fn build_request(state: &SharedState, payload: &ChatRequest) -> Result<GenerateContentRequest, ApiError> {
    if payload.message.trim().is_empty() {
        return Err(ApiError::BadRequest("Message cannot be empty".to_string()));
    }

    let history = payload.conversation_history.as_deref().unwrap_or_default();
    Ok(GenerateContentRequest {
        contents: build_contents(history, &payload.message, state.settings.chat_max_input_tokens),
        system_instruction: Some(Content::text(None, prompts::SYSTEM_INSTRUCTIONS)),
        generation_config: Some(GenerationConfig {
            max_output_tokens: state.settings.chat_max_output_tokens,
        }),
    })
}

fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Turns client history plus the new message into Gemini contents.
///
/// The canonical greeting is dropped, the oldest turns are dropped until the
/// estimate fits `max_input_tokens`, and the kept history never starts with a
/// model turn.
pub fn build_contents(history: &[ChatMessage], message: &str, max_input_tokens: usize) -> Vec<Content> {
    let filtered: Vec<&ChatMessage> = history
        .iter()
        .filter(|m| !(m.role == Role::Assistant && m.content.contains(prompts::GREETING_MARKER)))
        .collect();

    if filtered.is_empty() {
        return vec![
            Content::text(Some(Role::Assistant.as_gemini_role()), prompts::INITIAL_GREETING),
            Content::text(Some(Role::User.as_gemini_role()), message),
        ];
    }

    let budget = max_input_tokens
        .saturating_sub(estimate_tokens(prompts::SYSTEM_INSTRUCTIONS))
        .saturating_sub(estimate_tokens(message));

    let mut kept = Vec::new();
    let mut used = 0;
    for msg in filtered.iter().rev() {
        let cost = estimate_tokens(&msg.content);
        if used + cost > budget {
            break;
        }
        used += cost;
        kept.push(*msg);
    }
    kept.reverse();

    let dropped = filtered.len() - kept.len();
    if dropped > 0 {
        tracing::debug!(dropped, "truncated chat history to fit the input token budget");
    }

    let start = kept.iter().position(|m| m.role == Role::User).unwrap_or(kept.len());
    kept[start..]
        .iter()
        .map(|m| Content::text(Some(m.role.as_gemini_role()), m.content.clone()))
        .chain(std::iter::once(Content::text(Some(Role::User.as_gemini_role()), message)))
        .collect()
}

/// Wraps upstream text fragments into chat frames: one frame per fragment,
/// then exactly one `done` frame (carrying `error` if the upstream failed).
pub fn sse_frames<S>(upstream: S) -> impl Stream<Item = Result<String, Infallible>> + Send
where
    S: Stream<Item = Result<String, GeminiError>> + Send + Unpin + 'static,
{
    stream::unfold(
        (upstream, String::new(), false),
        |(mut upstream, mut full, finished)| async move {
            if finished {
                return None;
            }
            let frame = match upstream.next().await {
                Some(Ok(text)) => {
                    full.push_str(&text);
                    return Some((Ok(StreamFrame::chunk(text).encode()), (upstream, full, false)));
                }
                Some(Err(e)) => {
                    let message = format!("Error in streaming: {}", e);
                    tracing::error!("{}", message);
                    StreamFrame::failed(message, full.clone())
                }
                None => StreamFrame::done(full.clone()),
            };
            Some((Ok(frame.encode()), (upstream, full, true)))
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::FrameDecoder;

    fn decode_all(frames: Vec<String>) -> Vec<StreamFrame> {
        let mut decoder = FrameDecoder::new();
        frames
            .iter()
            .flat_map(|f| decoder.push(f.as_bytes()))
            .map(|p| serde_json::from_str(&p).unwrap())
            .collect()
    }

    #[test]
    fn test_empty_history_seeds_greeting() {
        let contents = build_contents(&[], "What is eczema?", 8000);
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0].role.as_deref(), Some("model"));
        assert_eq!(contents[1].role.as_deref(), Some("user"));
    }

    #[test]
    fn test_greeting_is_filtered_and_roles_mapped() {
        let history = vec![
            ChatMessage::assistant(prompts::INITIAL_GREETING),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
        ];
        let contents = build_contents(&history, "next", 8000);
        let roles: Vec<_> = contents.iter().map(|c| c.role.clone().unwrap()).collect();
        assert_eq!(roles, vec!["user", "model", "user"]);
    }

    #[test]
    fn test_oldest_turns_dropped_to_fit_budget() {
        let system = estimate_tokens(prompts::SYSTEM_INSTRUCTIONS);
        let history = vec![
            ChatMessage::user("a".repeat(400)),
            ChatMessage::assistant("b".repeat(400)),
            ChatMessage::user("c".repeat(40)),
            ChatMessage::assistant("d".repeat(40)),
        ];
        // Room for the last two turns (10 tokens each) and the message.
        let contents = build_contents(&history, "q", system + 1 + 25);
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0].parts[0].text.as_deref(), Some("c".repeat(40).as_str()));
    }

    #[tokio::test]
    async fn test_frames_end_with_single_done() {
        let upstream = stream::iter(vec![Ok("Eczema".to_string()), Ok(" is".to_string())]);
        let frames: Vec<String> = sse_frames(upstream).map(|f| f.unwrap()).collect().await;
        let decoded = decode_all(frames);

        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].chunk.as_deref(), Some("Eczema"));
        assert!(!decoded[1].done);
        assert!(decoded[2].done);
        assert_eq!(decoded[2].full_response.as_deref(), Some("Eczema is"));
    }

    #[tokio::test]
    async fn test_upstream_error_becomes_error_frame() {
        let upstream = stream::iter(vec![
            Ok("partial".to_string()),
            Err(GeminiError::Api("quota".to_string())),
            Ok("never sent".to_string()),
        ]);
        let frames: Vec<String> = sse_frames(upstream).map(|f| f.unwrap()).collect().await;
        let decoded = decode_all(frames);

        assert_eq!(decoded.len(), 2);
        assert!(decoded[1].done);
        assert!(decoded[1].error.as_deref().unwrap().contains("quota"));
        assert_eq!(decoded[1].full_response.as_deref(), Some("partial"));
    }
}
