//! Per-user conversation history.
//!
//! Committed messages live in `messages` and are persisted under
//! `chat_history_<identity>` after every change. A reply that is still
//! streaming is held apart in `in_progress` and never reaches storage or the
//! history sent with the next request.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::chat::{ChatTransport, ChunkCallback};
use super::error::ClientError;
use super::store::KeyValueStore;
use crate::models::chat::{ChatMessage, Role};
use crate::prompts::INITIAL_GREETING;

const HISTORY_KEY_PREFIX: &str = "chat_history_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// Set only on the reply that is still streaming.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: Role,
    pub content: String,
}

impl ConversationMessage {
    pub fn greeting() -> Self {
        Self {
            id: None,
            role: Role::Assistant,
            content: INITIAL_GREETING.to_string(),
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.id.is_some()
    }
}

impl From<&ConversationMessage> for ChatMessage {
    fn from(message: &ConversationMessage) -> Self {
        ChatMessage {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

pub fn history_key(identity: &str) -> String {
    format!("{}{}", HISTORY_KEY_PREFIX, identity)
}

pub struct ConversationManager {
    store: Arc<dyn KeyValueStore>,
    identity: Option<String>,
    messages: Vec<ConversationMessage>,
    in_progress: Option<ConversationMessage>,
}

impl ConversationManager {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            identity: None,
            messages: vec![ConversationMessage::greeting()],
            in_progress: None,
        }
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Switches to `identity` and loads its saved history. Missing history
    /// starts from the greeting; unreadable history is discarded.
    pub fn load_for(&mut self, identity: &str) {
        let key = history_key(identity);
        self.identity = Some(identity.to_string());
        self.in_progress = None;

        self.messages = match self.store.get(&key) {
            None => vec![ConversationMessage::greeting()],
            Some(raw) => match serde_json::from_str::<Vec<ConversationMessage>>(&raw) {
                Ok(saved) if !saved.is_empty() => saved
                    .into_iter()
                    .map(|mut m| {
                        m.id = None;
                        m
                    })
                    .collect(),
                Ok(_) => vec![ConversationMessage::greeting()],
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "discarding corrupt chat history");
                    if let Err(e) = self.store.remove(&key) {
                        tracing::error!(key = %key, error = %e, "failed to remove corrupt chat history");
                    }
                    vec![ConversationMessage::greeting()]
                }
            },
        };
        tracing::debug!(messages = self.messages.len(), "conversation loaded");
    }

    /// Forgets the identity without touching its saved history.
    pub fn logout(&mut self) {
        self.identity = None;
        self.in_progress = None;
        self.messages = vec![ConversationMessage::greeting()];
    }

    /// Everything to display, the streaming reply last.
    pub fn messages(&self) -> Vec<ConversationMessage> {
        self.messages.iter().chain(self.in_progress.iter()).cloned().collect()
    }

    /// Committed messages only; this is what accompanies the next request.
    pub fn history(&self) -> Vec<ChatMessage> {
        self.messages.iter().map(ChatMessage::from).collect()
    }

    pub fn is_streaming(&self) -> bool {
        self.in_progress.is_some()
    }

    pub fn reset(&mut self) -> Result<(), ClientError> {
        self.in_progress = None;
        self.messages = vec![ConversationMessage::greeting()];
        self.persist()
    }

    pub fn push_user(&mut self, content: &str) -> Result<(), ClientError> {
        self.messages.push(ConversationMessage {
            id: None,
            role: Role::User,
            content: content.to_string(),
        });
        self.persist()
    }

    /// Opens the streaming reply and returns its id.
    pub fn begin_reply(&mut self) -> Result<String, ClientError> {
        if self.in_progress.is_some() {
            return Err(ClientError::Busy);
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.in_progress = Some(ConversationMessage {
            id: Some(id.clone()),
            role: Role::Assistant,
            content: String::new(),
        });
        Ok(id)
    }

    pub fn append_to_reply(&mut self, fragment: &str) {
        if let Some(reply) = self.in_progress.as_mut() {
            reply.content.push_str(fragment);
        }
    }

    /// Moves the streaming reply into history, optionally replacing its text.
    pub fn commit_reply(&mut self, final_text: Option<String>) -> Result<(), ClientError> {
        let Some(mut reply) = self.in_progress.take() else {
            return Ok(());
        };
        if let Some(text) = final_text {
            reply.content = text;
        }
        reply.id = None;
        self.messages.push(reply);
        self.persist()
    }

    pub fn abort_reply(&mut self) {
        if self.in_progress.take().is_some() {
            tracing::debug!("dropped incomplete reply");
        }
    }

    /// One full exchange: user message, streamed reply, commit. On failure the
    /// incomplete reply is removed; the user's message stays.
    pub async fn send(
        &mut self,
        transport: &ChatTransport,
        text: &str,
        mut on_update: Option<ChunkCallback<'_>>,
    ) -> Result<String, ClientError> {
        if self.is_streaming() {
            return Err(ClientError::Busy);
        }
        if text.trim().is_empty() {
            return Err(ClientError::Validation("Message cannot be empty".to_string()));
        }

        let history = self.history();
        self.push_user(text)?;
        self.begin_reply()?;

        let result = {
            let in_progress = &mut self.in_progress;
            let mut forward = |fragment: &str, done: bool| {
                if let Some(reply) = in_progress.as_mut() {
                    reply.content.push_str(fragment);
                }
                if let Some(callback) = on_update.as_mut() {
                    callback(fragment, done);
                }
            };
            transport.send_streaming(text, &history, &mut forward).await
        };

        match result {
            Ok(response) => {
                self.commit_reply(Some(response.response.clone()))?;
                Ok(response.response)
            }
            Err(e) => {
                tracing::warn!(error = %e, "chat exchange failed");
                self.abort_reply();
                Err(e)
            }
        }
    }

    fn persist(&self) -> Result<(), ClientError> {
        let Some(identity) = &self.identity else {
            return Ok(());
        };
        let raw = serde_json::to_string(&self.messages)?;
        self.store.set(&history_key(identity), &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::events::EventBus;
    use crate::client::gateway::ApiGateway;
    use crate::client::store::MemoryStore;
    use crate::sse::StreamFrame;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn manager() -> (ConversationManager, Arc<dyn KeyValueStore>) {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        (ConversationManager::new(store.clone()), store)
    }

    #[test]
    fn test_starts_with_greeting() {
        let (conversation, _) = manager();
        assert_eq!(conversation.messages(), vec![ConversationMessage::greeting()]);
    }

    #[test]
    fn test_corrupt_history_falls_back_and_is_removed() {
        let (mut conversation, store) = manager();
        store.set("chat_history_ada@example.com", "[{broken").unwrap();

        conversation.load_for("ada@example.com");
        assert_eq!(conversation.messages(), vec![ConversationMessage::greeting()]);
        assert_eq!(store.get("chat_history_ada@example.com"), None);
    }

    #[test]
    fn test_history_is_kept_per_identity() {
        let (mut conversation, store) = manager();
        conversation.load_for("ada@example.com");
        conversation.push_user("Is this mole normal?").unwrap();

        conversation.load_for("bob@example.com");
        assert_eq!(conversation.messages().len(), 1);
        assert_eq!(store.get("chat_history_bob@example.com"), None);

        conversation.load_for("ada@example.com");
        let messages = conversation.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "Is this mole normal?");
    }

    #[test]
    fn test_reset_is_idempotent_and_persisted() {
        let (mut conversation, store) = manager();
        conversation.load_for("ada@example.com");
        conversation.push_user("hello").unwrap();

        conversation.reset().unwrap();
        let first = conversation.messages();
        let saved_first = store.get("chat_history_ada@example.com");
        conversation.reset().unwrap();

        assert_eq!(first, vec![ConversationMessage::greeting()]);
        assert_eq!(conversation.messages(), first);
        assert_eq!(store.get("chat_history_ada@example.com"), saved_first);
    }

    #[test]
    fn test_single_in_progress_reply_excluded_from_history() {
        let (mut conversation, store) = manager();
        conversation.load_for("ada@example.com");
        conversation.push_user("What is acne?").unwrap();
        conversation.begin_reply().unwrap();
        conversation.append_to_reply("Acne is");

        assert!(matches!(conversation.begin_reply(), Err(ClientError::Busy)));
        assert_eq!(conversation.messages().iter().filter(|m| m.is_in_progress()).count(), 1);
        assert_eq!(conversation.history().len(), 2);
        assert!(!store.get("chat_history_ada@example.com").unwrap().contains("Acne is"));

        conversation.commit_reply(None).unwrap();
        assert!(!conversation.is_streaming());
        let history = conversation.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2], ChatMessage::assistant("Acne is"));
    }

    #[test]
    fn test_logout_keeps_saved_history() {
        let (mut conversation, store) = manager();
        conversation.load_for("ada@example.com");
        conversation.push_user("hi").unwrap();
        conversation.logout();

        assert_eq!(conversation.identity(), None);
        assert_eq!(conversation.messages().len(), 1);
        assert!(store.get("chat_history_ada@example.com").is_some());
    }

    fn transport(server: &MockServer, store: Arc<dyn KeyValueStore>) -> ChatTransport {
        ChatTransport::new(ApiGateway::new(server.uri(), store, EventBus::new()))
    }

    #[tokio::test]
    async fn test_send_commits_streamed_reply() {
        let server = MockServer::start().await;
        let body: String = [
            StreamFrame::chunk("Eczema"),
            StreamFrame::chunk(" is"),
            StreamFrame::chunk(" a skin condition."),
            StreamFrame::done("Eczema is a skin condition."),
        ]
        .iter()
        .map(StreamFrame::encode)
        .collect();
        Mock::given(method("POST"))
            .and(path("/api/chat/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let (mut conversation, store) = manager();
        conversation.load_for("ada@example.com");
        let transport = transport(&server, store.clone());

        let mut updates = 0;
        let mut on_update = |_: &str, _: bool| updates += 1;
        let reply = conversation
            .send(&transport, "What is eczema?", Some(&mut on_update))
            .await
            .unwrap();

        assert_eq!(reply, "Eczema is a skin condition.");
        assert_eq!(updates, 4);
        assert!(!conversation.is_streaming());
        assert_eq!(conversation.history().len(), 3);

        let saved: Vec<ConversationMessage> =
            serde_json::from_str(&store.get("chat_history_ada@example.com").unwrap()).unwrap();
        assert_eq!(saved.len(), 3);
        assert!(saved.iter().all(|m| m.id.is_none()));
    }

    #[tokio::test]
    async fn test_failed_send_rolls_back_reply_only() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat/chat"))
            .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({"detail": "Chat unavailable"})))
            .mount(&server)
            .await;

        let (mut conversation, store) = manager();
        conversation.load_for("ada@example.com");
        let transport = transport(&server, store);

        let err = conversation.send(&transport, "Hello?", None).await.unwrap_err();
        assert!(matches!(err, ClientError::Api { status: 503, .. }));
        assert!(!conversation.is_streaming());

        let messages = conversation.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::User);
    }
}
