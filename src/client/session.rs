//! Who is logged in, and with which token.
//!
//! `SessionStore` is the only writer of session state. The gateway never
//! calls into it; it learns about rejected tokens from the event bus.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::error::ClientError;
use super::events::SessionEvent;
use super::gateway::{ApiGateway, ApiRequest, TOKEN_KEY, USER_KEY};
use super::store::KeyValueStore;
use crate::models::auth::UserResponse;

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub user_id: String,
    pub display_name: String,
    pub email: String,
    pub token: String,
}

impl Session {
    pub fn new(token: impl Into<String>, user: &UserResponse) -> Self {
        Self {
            user_id: user.id.clone(),
            display_name: user.name.clone(),
            email: user.email.clone(),
            token: token.into(),
        }
    }
}

pub struct SessionStore {
    store: Arc<dyn KeyValueStore>,
    current: RwLock<Option<Session>>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            current: RwLock::new(None),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<Session>> {
        self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<Session>> {
        self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn current(&self) -> Option<Session> {
        self.read().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.read().is_some()
    }

    pub fn token(&self) -> Option<String> {
        self.read().as_ref().map(|s| s.token.clone())
    }

    /// Stored user record, if one survives from an earlier run.
    pub fn persisted_user(&self) -> Option<UserResponse> {
        let raw = self.store.get(USER_KEY)?;
        serde_json::from_str(&raw).ok()
    }

    /// Records a successful login or signup.
    pub fn establish(&self, token: &str, user: &UserResponse) -> Result<Session, ClientError> {
        self.store.set(TOKEN_KEY, token)?;
        self.store.set(USER_KEY, &serde_json::to_string(user)?)?;
        let session = Session::new(token, user);
        *self.write() = Some(session.clone());
        tracing::info!(user_id = %session.user_id, "session established");
        Ok(session)
    }

    /// Replaces the cached user record after a profile change; the token stays.
    pub fn update_user(&self, user: &UserResponse) -> Result<(), ClientError> {
        let mut current = self.write();
        let Some(session) = current.as_mut() else {
            return Ok(());
        };
        self.store.set(USER_KEY, &serde_json::to_string(user)?)?;
        *session = Session::new(session.token.clone(), user);
        Ok(())
    }

    pub fn clear(&self) {
        for key in [TOKEN_KEY, USER_KEY] {
            if let Err(e) = self.store.remove(key) {
                tracing::error!(key, error = %e, "failed to remove session key");
            }
        }
        if self.write().take().is_some() {
            tracing::info!("session cleared");
        }
    }

    /// Startup check: a persisted token is validated against the server
    /// before it is trusted. Any failure leaves the store unauthenticated.
    pub async fn restore(&self, gateway: &ApiGateway) -> Option<Session> {
        let token = self.store.get(TOKEN_KEY)?;

        match gateway.request_as::<UserResponse>(ApiRequest::get("/api/auth/me")).await {
            Ok(user) => match self.establish(&token, &user) {
                Ok(session) => Some(session),
                Err(e) => {
                    tracing::error!(error = %e, "could not persist restored session");
                    self.clear();
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "stored token could not be validated");
                self.clear();
                None
            }
        }
    }

    pub fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Invalidated => {
                // Storage was already wiped by the gateway.
                if self.write().take().is_some() {
                    tracing::info!("session invalidated by server");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::events::EventBus;
    use crate::client::store::MemoryStore;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn user() -> UserResponse {
        UserResponse {
            id: "u-1".to_string(),
            name: "Ada".to_string(),
            email: "ada@example.com".to_string(),
            birthdate: "1990-01-01".to_string(),
            gender: "female".to_string(),
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_establish_and_clear() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let sessions = SessionStore::new(store.clone());
        assert!(!sessions.is_authenticated());

        let session = sessions.establish("tok", &user()).unwrap();
        assert_eq!(session.display_name, "Ada");
        assert_eq!(store.get(TOKEN_KEY).as_deref(), Some("tok"));
        assert_eq!(sessions.persisted_user(), Some(user()));

        sessions.clear();
        assert_eq!(sessions.current(), None);
        assert_eq!(store.get(TOKEN_KEY), None);
        assert_eq!(store.get(USER_KEY), None);
    }

    #[test]
    fn test_update_user_keeps_token() {
        let sessions = SessionStore::new(Arc::new(MemoryStore::new()));
        sessions.establish("tok", &user()).unwrap();

        let mut renamed = user();
        renamed.name = "Ada L.".to_string();
        sessions.update_user(&renamed).unwrap();

        let current = sessions.current().unwrap();
        assert_eq!(current.display_name, "Ada L.");
        assert_eq!(current.token, "tok");
    }

    #[tokio::test]
    async fn test_restore_without_token_is_unauthenticated() {
        let server = MockServer::start().await;
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let gateway = ApiGateway::new(server.uri(), store.clone(), EventBus::new());
        let sessions = SessionStore::new(store);

        assert_eq!(sessions.restore(&gateway).await, None);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_validates_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/me"))
            .respond_with(ResponseTemplate::new(200).set_body_json(user()))
            .mount(&server)
            .await;

        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        store.set(TOKEN_KEY, "tok").unwrap();
        let gateway = ApiGateway::new(server.uri(), store.clone(), EventBus::new());
        let sessions = SessionStore::new(store);

        let session = sessions.restore(&gateway).await.unwrap();
        assert_eq!(session.email, "ada@example.com");
        assert_eq!(session.token, "tok");
    }

    #[tokio::test]
    async fn test_restore_failure_destroys_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/me"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        store.set(TOKEN_KEY, "tok").unwrap();
        let gateway = ApiGateway::new(server.uri(), store.clone(), EventBus::new());
        let sessions = SessionStore::new(store.clone());

        assert_eq!(sessions.restore(&gateway).await, None);
        assert_eq!(store.get(TOKEN_KEY), None);
    }

    #[test]
    fn test_invalidation_event_drops_session() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let sessions = SessionStore::new(store);
        sessions.establish("tok", &user()).unwrap();

        sessions.handle_event(SessionEvent::Invalidated);
        assert!(!sessions.is_authenticated());
        assert_eq!(sessions.current(), None);
    }
}
