use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

use crate::sse::FrameDecoder;

#[derive(Error, Debug)]
pub enum GeminiError {
    #[error("Gemini request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Gemini API error: {0}")]
    Api(String),
    #[error("error decoding response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Gemini returned no text")]
    EmptyResponse,
}

#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl Content {
    pub fn text(role: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            parts: vec![Part { text: Some(text.into()) }],
            role: role.map(str::to_string),
        }
    }

    fn joined_text(&self) -> String {
        self.parts.iter().filter_map(|p| p.text.as_deref()).collect()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    pub max_output_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(rename = "promptFeedback")]
    pub prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Candidate {
    pub content: Option<Content>,
    #[serde(rename = "finishReason")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PromptFeedback {
    #[serde(rename = "blockReason")]
    pub block_reason: Option<String>,
}

impl GenerateContentResponse {
    /// Text of the first candidate, empty when there is none.
    pub fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(Content::joined_text)
            .unwrap_or_default()
    }
}

type StreamState = (
    BoxStream<'static, Result<bytes::Bytes, reqwest::Error>>,
    FrameDecoder,
    VecDeque<String>,
    bool,
);

impl GeminiClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn generate_content(
        &self,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse, GeminiError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        tracing::debug!(model = %self.model, contents = request.contents.len(), "Gemini generateContent");

        let response = self.client.post(&url).json(request).send().await?;
        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(GeminiError::Api(error_text));
        }

        let response_text = response.text().await?;
        serde_json::from_str::<GenerateContentResponse>(&response_text).map_err(|e| {
            tracing::error!("Failed to parse Gemini response: {}", e);
            GeminiError::Decode(e)
        })
    }

    /// Convenience wrapper returning only the generated text.
    pub async fn generate_text(&self, request: &GenerateContentRequest) -> Result<String, GeminiError> {
        let text = self.generate_content(request).await?.text();
        if text.trim().is_empty() {
            Err(GeminiError::EmptyResponse)
        } else {
            Ok(text)
        }
    }

    /// Streams text fragments as Gemini produces them (`alt=sse`).
    pub async fn stream_generate_content(
        &self,
        request: &GenerateContentRequest,
    ) -> Result<BoxStream<'static, Result<String, GeminiError>>, GeminiError> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, self.model, self.api_key
        );
        tracing::debug!(model = %self.model, contents = request.contents.len(), "Gemini streamGenerateContent");

        let response = self.client.post(&url).json(request).send().await?;
        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(GeminiError::Api(error_text));
        }

        let state: StreamState = (response.bytes_stream().boxed(), FrameDecoder::new(), VecDeque::new(), false);
        Ok(stream::unfold(state, |(mut bytes, mut decoder, mut queue, mut ended)| async move {
            loop {
                if let Some(text) = queue.pop_front() {
                    return Some((Ok(text), (bytes, decoder, queue, ended)));
                }
                if ended {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        for payload in decoder.push(&chunk) {
                            queue.extend(fragment_text(&payload));
                        }
                    }
                    Some(Err(e)) => {
                        ended = true;
                        return Some((Err(GeminiError::Http(e)), (bytes, decoder, queue, ended)));
                    }
                    None => {
                        ended = true;
                        if let Some(payload) = decoder.finish() {
                            queue.extend(fragment_text(&payload));
                        }
                    }
                }
            }
        })
        .boxed())
    }
}

/// Text carried by one streamed `GenerateContentResponse`, if any.
fn fragment_text(payload: &str) -> Option<String> {
    match serde_json::from_str::<GenerateContentResponse>(payload) {
        Ok(response) => Some(response.text()).filter(|t| !t.is_empty()),
        Err(e) => {
            tracing::warn!(error = %e, "skipping malformed Gemini stream payload");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> GenerateContentRequest {
        GenerateContentRequest {
            contents: vec![Content::text(Some("user"), "hi")],
            system_instruction: None,
            generation_config: Some(GenerationConfig { max_output_tokens: 64 }),
        }
    }

    #[test]
    fn test_request_serialization_uses_api_field_names() {
        let mut req = request();
        req.system_instruction = Some(Content::text(None, "be brief"));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 64);
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "be brief");
        assert!(json["systemInstruction"].get("role").is_none());
    }

    #[tokio::test]
    async fn test_generate_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/test-model:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": "Hello"}, {"text": " there"}]}}]
            })))
            .mount(&server)
            .await;

        let client = GeminiClient::new("k".into(), "test-model".into()).with_base_url(server.uri());
        assert_eq!(client.generate_text(&request()).await.unwrap(), "Hello there");
    }

    #[tokio::test]
    async fn test_stream_yields_fragments_and_skips_bad_payloads() {
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Ecz\"}]}}]}\r\n\r\n",
            "data: not-json\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"ema\"}]}}]}\r\n\r\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/test-model:streamGenerateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let client = GeminiClient::new("k".into(), "test-model".into()).with_base_url(server.uri());
        let fragments: Vec<String> = client
            .stream_generate_content(&request())
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(fragments, vec!["Ecz".to_string(), "ema".to_string()]);
    }

    #[tokio::test]
    async fn test_api_error_surfaces_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad key"))
            .mount(&server)
            .await;

        let client = GeminiClient::new("k".into(), "test-model".into()).with_base_url(server.uri());
        match client.generate_content(&request()).await {
            Err(GeminiError::Api(body)) => assert_eq!(body, "bad key"),
            other => panic!("unexpected {:?}", other.map(|r| r.text())),
        }
    }
}
