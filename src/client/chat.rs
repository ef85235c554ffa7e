//! Chat transport: streamed replies over `POST /api/chat/chat`, with the
//! synchronous endpoint as the fallback when nobody wants fragments.

use bytes::Bytes;
use futures::{Stream, StreamExt};

use super::error::ClientError;
use super::gateway::{ApiGateway, ApiRequest};
use crate::models::chat::{ChatMessage, ChatRequest, ChatResponse};
use crate::sse::{FrameDecoder, StreamFrame};

/// Receives `(fragment, completed)`. The last call always has
/// `completed == true` and an empty fragment.
pub type ChunkCallback<'a> = &'a mut (dyn FnMut(&str, bool) + Send);

#[derive(Clone)]
pub struct ChatTransport {
    gateway: ApiGateway,
}

impl ChatTransport {
    pub fn new(gateway: ApiGateway) -> Self {
        Self { gateway }
    }

    /// Streams when a callback is supplied, otherwise uses the sync endpoint.
    pub async fn send(
        &self,
        message: &str,
        history: &[ChatMessage],
        on_chunk: Option<ChunkCallback<'_>>,
    ) -> Result<ChatResponse, ClientError> {
        match on_chunk {
            Some(on_chunk) => self.send_streaming(message, history, on_chunk).await,
            None => self.send_sync(message, history).await,
        }
    }

    pub async fn send_streaming(
        &self,
        message: &str,
        history: &[ChatMessage],
        on_chunk: ChunkCallback<'_>,
    ) -> Result<ChatResponse, ClientError> {
        let request = chat_request("/api/chat/chat", message, history)?;
        let response = self.gateway.open_stream(request).await?;
        tracing::debug!(history_len = history.len(), "chat stream opened");

        consume_frames(response.bytes_stream(), message, history, on_chunk).await
    }

    pub async fn send_sync(&self, message: &str, history: &[ChatMessage]) -> Result<ChatResponse, ClientError> {
        let request = chat_request("/api/chat/chat/sync", message, history)?;
        self.gateway.request_as(request).await
    }
}

fn chat_request(path: &str, message: &str, history: &[ChatMessage]) -> Result<ApiRequest, ClientError> {
    if message.trim().is_empty() {
        return Err(ClientError::Validation("Message cannot be empty".to_string()));
    }
    ApiRequest::post(path).json(&ChatRequest {
        message: message.to_string(),
        conversation_history: Some(history.to_vec()),
    })
}

/// Reads a frame stream to the end and assembles the reply.
///
/// The stream is owned here, so the underlying body is released on every
/// return path. A stream that ends without a `done` frame resolves with
/// whatever text arrived.
pub async fn consume_frames<S, E>(
    stream: S,
    message: &str,
    history: &[ChatMessage],
    on_chunk: ChunkCallback<'_>,
) -> Result<ChatResponse, ClientError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<ClientError>,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = FrameDecoder::new();
    let mut reply = String::new();

    while let Some(read) = stream.next().await {
        let bytes = read.map_err(Into::into)?;
        for payload in decoder.push(&bytes) {
            if apply_payload(&payload, &mut reply, on_chunk)? {
                return Ok(ChatResponse::after_exchange(history, message, reply));
            }
        }
    }

    if let Some(payload) = decoder.finish() {
        if apply_payload(&payload, &mut reply, on_chunk)? {
            return Ok(ChatResponse::after_exchange(history, message, reply));
        }
    }

    tracing::warn!(reply_len = reply.len(), "chat stream ended without a completion frame");
    on_chunk("", true);
    Ok(ChatResponse::after_exchange(history, message, reply))
}

/// Applies one frame. Returns `true` once the reply is complete.
fn apply_payload(payload: &str, reply: &mut String, on_chunk: ChunkCallback<'_>) -> Result<bool, ClientError> {
    let frame: StreamFrame = match serde_json::from_str(payload) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, payload, "skipping malformed chat frame");
            return Ok(false);
        }
    };

    if let Some(error) = frame.error {
        on_chunk("", true);
        return Err(ClientError::Stream(error));
    }

    if let Some(fragment) = frame.chunk.filter(|c| !c.is_empty()) {
        reply.push_str(&fragment);
        on_chunk(&fragment, false);
    }

    if frame.done {
        if let Some(full) = frame.full_response {
            *reply = full;
        }
        on_chunk("", true);
        return Ok(true);
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::events::EventBus;
    use crate::client::store::MemoryStore;
    use crate::models::chat::Role;
    use futures::stream;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn frames(parts: &[StreamFrame]) -> String {
        parts.iter().map(StreamFrame::encode).collect()
    }

    fn eczema_body(done: Option<StreamFrame>) -> String {
        let mut parts = vec![
            StreamFrame::chunk("Eczema"),
            StreamFrame::chunk(" is"),
            StreamFrame::chunk(" a skin condition."),
        ];
        parts.extend(done);
        frames(&parts)
    }

    fn reads(body: &str, cuts: &[usize]) -> Vec<Result<Bytes, ClientError>> {
        let bytes = body.as_bytes();
        let mut out = Vec::new();
        let mut start = 0;
        for &cut in cuts.iter().chain(std::iter::once(&bytes.len())) {
            out.push(Ok(Bytes::copy_from_slice(&bytes[start..cut])));
            start = cut;
        }
        out
    }

    async fn consume(
        chunks: Vec<Result<Bytes, ClientError>>,
        history: &[ChatMessage],
    ) -> (Result<ChatResponse, ClientError>, Vec<(String, bool)>) {
        let mut calls = Vec::new();
        let mut record = |fragment: &str, done: bool| calls.push((fragment.to_string(), done));
        let result = consume_frames(stream::iter(chunks), "What is eczema?", history, &mut record).await;
        (result, calls)
    }

    #[tokio::test]
    async fn test_fragments_concatenate_and_history_grows_by_two() {
        let mut done = StreamFrame::done("");
        done.full_response = None;
        let history = vec![ChatMessage::assistant("Hello!")];

        let (result, calls) = consume(reads(&eczema_body(Some(done)), &[]), &history).await;
        let response = result.unwrap();

        assert_eq!(response.response, "Eczema is a skin condition.");
        assert_eq!(response.conversation_history.len(), history.len() + 2);
        assert_eq!(response.conversation_history[1], ChatMessage::user("What is eczema?"));
        assert_eq!(response.conversation_history[2].role, Role::Assistant);
        assert_eq!(
            calls,
            vec![
                ("Eczema".to_string(), false),
                (" is".to_string(), false),
                (" a skin condition.".to_string(), false),
                (String::new(), true),
            ]
        );
    }

    #[tokio::test]
    async fn test_full_response_overrides_accumulation() {
        let body = eczema_body(Some(StreamFrame::done("Eczema is an inflammatory skin condition.")));
        let (result, _) = consume(reads(&body, &[]), &[]).await;
        assert_eq!(result.unwrap().response, "Eczema is an inflammatory skin condition.");
    }

    #[tokio::test]
    async fn test_missing_done_frame_still_resolves() {
        let (result, calls) = consume(reads(&eczema_body(None), &[]), &[]).await;
        assert_eq!(result.unwrap().response, "Eczema is a skin condition.");
        assert_eq!(calls.last(), Some(&(String::new(), true)));
    }

    #[tokio::test]
    async fn test_unterminated_trailing_frame_is_parsed() {
        let mut body = eczema_body(None);
        body.push_str("data: {\"chunk\":\"!\"}");
        let (result, _) = consume(reads(&body, &[]), &[]).await;
        assert_eq!(result.unwrap().response, "Eczema is a skin condition.!");
    }

    #[tokio::test]
    async fn test_result_independent_of_read_boundaries() {
        let body = eczema_body(Some(StreamFrame::done("Eczema is a skin condition.")));
        let (whole, whole_calls) = consume(reads(&body, &[]), &[]).await;
        let whole = whole.unwrap();

        for cut in 1..body.len() {
            let (split, split_calls) = consume(reads(&body, &[cut]), &[]).await;
            assert_eq!(split.unwrap(), whole, "cut at {}", cut);
            assert_eq!(split_calls, whole_calls, "cut at {}", cut);
        }

        let every_byte: Vec<usize> = (1..body.len()).collect();
        let (bytewise, _) = consume(reads(&body, &every_byte), &[]).await;
        assert_eq!(bytewise.unwrap(), whole);
    }

    #[tokio::test]
    async fn test_error_frame_fails_after_completion_callback() {
        let body = frames(&[
            StreamFrame::chunk("Partial"),
            StreamFrame::failed("Gemini quota exceeded", "Partial"),
        ]);
        let (result, calls) = consume(reads(&body, &[]), &[]).await;

        match result {
            Err(ClientError::Stream(message)) => assert_eq!(message, "Gemini quota exceeded"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(calls.last(), Some(&(String::new(), true)));
    }

    #[tokio::test]
    async fn test_malformed_frames_are_skipped() {
        let body = format!(
            "data: not json\n\n: keep-alive\n\n{}",
            eczema_body(Some(StreamFrame::done("Eczema is a skin condition.")))
        );
        let (result, _) = consume(reads(&body, &[]), &[]).await;
        assert_eq!(result.unwrap().response, "Eczema is a skin condition.");
    }

    #[tokio::test]
    async fn test_read_error_rejects() {
        let chunks = vec![
            Ok(Bytes::from(StreamFrame::chunk("Ecz").encode())),
            Err(ClientError::Stream("connection reset".to_string())),
        ];
        let (result, _) = consume(chunks, &[]).await;
        assert!(matches!(result, Err(ClientError::Stream(_))));
    }

    fn transport(server: &MockServer) -> ChatTransport {
        ChatTransport::new(ApiGateway::new(server.uri(), Arc::new(MemoryStore::new()), EventBus::new()))
    }

    #[tokio::test]
    async fn test_streaming_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat/chat"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(eczema_body(Some(StreamFrame::done("Eczema is a skin condition.")))),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut fragments = String::new();
        let mut on_chunk = |fragment: &str, _done: bool| fragments.push_str(fragment);
        let response = transport(&server)
            .send("What is eczema?", &[], Some(&mut on_chunk))
            .await
            .unwrap();

        assert_eq!(response.response, "Eczema is a skin condition.");
        assert_eq!(fragments, "Eczema is a skin condition.");
    }

    #[tokio::test]
    async fn test_without_callback_uses_sync_endpoint() {
        let server = MockServer::start().await;
        let reply = ChatResponse::after_exchange(&[], "Hi", "Hello there.".to_string());
        Mock::given(method("POST"))
            .and(path("/api/chat/chat/sync"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&reply))
            .expect(1)
            .mount(&server)
            .await;

        let response = transport(&server).send("Hi", &[], None).await.unwrap();
        assert_eq!(response, reply);
    }

    #[tokio::test]
    async fn test_blank_message_never_hits_network() {
        let server = MockServer::start().await;
        let err = transport(&server).send("   ", &[], None).await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
