//! Consumer-side core: everything a front end needs to talk to the API.
//!
//! `DermaDocClient` is the explicitly constructed application state. It owns
//! the local store, the session event bus and the components wired to them.

pub mod chat;
pub mod conversation;
pub mod error;
pub mod events;
pub mod gateway;
pub mod polling;
pub mod session;
pub mod store;

use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;

pub use chat::{ChatTransport, ChunkCallback};
pub use conversation::{ConversationManager, ConversationMessage};
pub use error::ClientError;
pub use events::{EventBus, SessionEvent};
pub use gateway::{ApiGateway, ApiRequest};
pub use polling::{PollHandle, PollOutcome, ResultPoller, POLL_INTERVAL};
pub use session::{Session, SessionStore};
pub use store::{FileStore, KeyValueStore, MemoryStore};

use crate::models::auth::{
    ChangePasswordRequest, LoginRequest, ProfileUpdateRequest, SignupRequest, TokenResponse, UserResponse,
};
use crate::models::skin_check::AnalysisResult;
use crate::storage::{content_type, validate_extension, MAX_IMAGE_SIZE};

const MIN_PASSWORD_LENGTH: usize = 6;

/// Where a photo was taken. Identifiers match the body map the front end
/// highlights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BodyRegion {
    Head,
    Neck,
    Chest,
    Abdomen,
    UpperBack,
    LowerBack,
    LeftArm,
    RightArm,
    LeftHand,
    RightHand,
    LeftLeg,
    RightLeg,
    LeftFoot,
    RightFoot,
}

impl BodyRegion {
    const ALL: [BodyRegion; 14] = [
        BodyRegion::Head,
        BodyRegion::Neck,
        BodyRegion::Chest,
        BodyRegion::Abdomen,
        BodyRegion::UpperBack,
        BodyRegion::LowerBack,
        BodyRegion::LeftArm,
        BodyRegion::RightArm,
        BodyRegion::LeftHand,
        BodyRegion::RightHand,
        BodyRegion::LeftLeg,
        BodyRegion::RightLeg,
        BodyRegion::LeftFoot,
        BodyRegion::RightFoot,
    ];

    pub fn all() -> impl Iterator<Item = BodyRegion> {
        Self::ALL.into_iter()
    }

    /// Wire identifier sent as `body_part`.
    pub fn id(&self) -> &'static str {
        match self {
            BodyRegion::Head => "head",
            BodyRegion::Neck => "neck",
            BodyRegion::Chest => "chest",
            BodyRegion::Abdomen => "abdomen",
            BodyRegion::UpperBack => "upper-back",
            BodyRegion::LowerBack => "lower-back",
            BodyRegion::LeftArm => "left-arm",
            BodyRegion::RightArm => "right-arm",
            BodyRegion::LeftHand => "left-hand",
            BodyRegion::RightHand => "right-hand",
            BodyRegion::LeftLeg => "left-leg",
            BodyRegion::RightLeg => "right-leg",
            BodyRegion::LeftFoot => "left-foot",
            BodyRegion::RightFoot => "right-foot",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BodyRegion::Head => "Head",
            BodyRegion::Neck => "Neck",
            BodyRegion::Chest => "Chest",
            BodyRegion::Abdomen => "Abdomen",
            BodyRegion::UpperBack => "Upper back",
            BodyRegion::LowerBack => "Lower back",
            BodyRegion::LeftArm => "Left arm",
            BodyRegion::RightArm => "Right arm",
            BodyRegion::LeftHand => "Left hand",
            BodyRegion::RightHand => "Right hand",
            BodyRegion::LeftLeg => "Left leg",
            BodyRegion::RightLeg => "Right leg",
            BodyRegion::LeftFoot => "Left foot",
            BodyRegion::RightFoot => "Right foot",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::all().find(|region| region.id() == id)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub poll_interval: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            poll_interval: POLL_INTERVAL,
        }
    }

    /// `DERMADOC_API_URL`, defaulting to a local server.
    pub fn from_env() -> Self {
        let base_url = std::env::var("DERMADOC_API_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "http://localhost:8000".to_string());
        Self::new(base_url)
    }
}

/// Signup form as entered, confirmation included.
#[derive(Debug, Clone)]
pub struct SignupForm {
    pub name: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    pub birthdate: String,
    pub gender: String,
}

pub struct DermaDocClient {
    config: ClientConfig,
    store: Arc<dyn KeyValueStore>,
    events: EventBus,
    gateway: ApiGateway,
    sessions: Arc<SessionStore>,
    transport: ChatTransport,
    /// The only conversation; reloaded on login, reset on logout.
    conversation: Arc<Mutex<ConversationManager>>,
    listener: JoinHandle<()>,
}

impl DermaDocClient {
    /// Must be called inside a Tokio runtime: the session listener runs as a task.
    pub fn new(config: ClientConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let events = EventBus::new();
        let gateway = ApiGateway::new(config.base_url.clone(), store.clone(), events.clone());
        let sessions = Arc::new(SessionStore::new(store.clone()));
        let conversation = Arc::new(Mutex::new(ConversationManager::new(store.clone())));
        let listener = spawn_invalidation_listener(sessions.clone(), conversation.clone(), events.subscribe());
        let transport = ChatTransport::new(gateway.clone());

        Self {
            config,
            store,
            events,
            gateway,
            sessions,
            transport,
            conversation,
            listener,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn gateway(&self) -> &ApiGateway {
        &self.gateway
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn chat(&self) -> &ChatTransport {
        &self.transport
    }

    pub fn session(&self) -> Option<Session> {
        self.sessions.current()
    }

    /// Exclusive access to the conversation of the logged-in user.
    pub async fn conversation(&self) -> MutexGuard<'_, ConversationManager> {
        self.conversation.lock().await
    }

    /// Sends a chat message and streams the reply into the conversation.
    /// Refused with `Busy` while another exchange holds the conversation.
    pub async fn send_message(&self, text: &str, on_update: Option<ChunkCallback<'_>>) -> Result<String, ClientError> {
        let mut conversation = self.conversation.try_lock().map_err(|_| ClientError::Busy)?;
        conversation.send(&self.transport, text, on_update).await
    }

    pub async fn restore_session(&self) -> Option<Session> {
        let restored = self.sessions.restore(&self.gateway).await;
        let mut conversation = self.conversation.lock().await;
        match &restored {
            Some(session) => conversation.load_for(&session.email),
            None => conversation.logout(),
        }
        restored
    }

    async fn begin_session(&self, token: &TokenResponse) -> Result<Session, ClientError> {
        let session = self.sessions.establish(&token.access_token, &token.user)?;
        self.conversation.lock().await.load_for(&session.email);
        Ok(session)
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Session, ClientError> {
        let request = ApiRequest::post("/api/auth/login")
            .json(&LoginRequest {
                email: email.trim().to_string(),
                password: password.to_string(),
            })?
            .credentials();
        let token: TokenResponse = self.gateway.request_as(request).await?;
        self.begin_session(&token).await
    }

    pub async fn signup(&self, form: SignupForm) -> Result<Session, ClientError> {
        if form.password != form.confirm_password {
            return Err(ClientError::Validation("Passwords do not match".to_string()));
        }
        if form.password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(ClientError::Validation(format!(
                "Password must be at least {} characters long",
                MIN_PASSWORD_LENGTH
            )));
        }

        let request = ApiRequest::post("/api/auth/signup")
            .json(&SignupRequest {
                name: form.name,
                email: form.email.trim().to_string(),
                password: form.password,
                birthdate: form.birthdate,
                gender: form.gender,
            })?
            .credentials();
        let token: TokenResponse = self.gateway.request_as(request).await?;
        self.begin_session(&token).await
    }

    /// Tells the server (best effort) and always clears the local session.
    pub async fn logout(&self) {
        if self.sessions.token().is_some() {
            if let Err(e) = self.gateway.request(ApiRequest::post("/api/auth/logout")).await {
                tracing::debug!(error = %e, "logout request failed, clearing locally anyway");
            }
        }
        self.conversation.lock().await.logout();
        self.sessions.clear();
    }

    pub async fn current_user(&self) -> Result<UserResponse, ClientError> {
        self.gateway.request_as(ApiRequest::get("/api/auth/me")).await
    }

    pub async fn update_profile(&self, update: &ProfileUpdateRequest) -> Result<UserResponse, ClientError> {
        let user: UserResponse = self
            .gateway
            .request_as(ApiRequest::put("/api/auth/me").json(update)?)
            .await?;
        self.sessions.update_user(&user)?;
        Ok(user)
    }

    pub async fn change_password(&self, current: &str, new: &str, confirm: &str) -> Result<(), ClientError> {
        if new != confirm {
            return Err(ClientError::Validation("New passwords do not match".to_string()));
        }
        if new.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(ClientError::Validation(format!(
                "Password must be at least {} characters long",
                MIN_PASSWORD_LENGTH
            )));
        }

        let request = ApiRequest::post("/api/auth/change-password").json(&ChangePasswordRequest {
            current_password: current.to_string(),
            new_password: new.to_string(),
        })?;
        self.gateway.request(request).await?;
        Ok(())
    }

    /// Uploads a photo for analysis. Type and size are checked locally first.
    pub async fn upload_image(
        &self,
        filename: &str,
        content: Vec<u8>,
        region: Option<BodyRegion>,
    ) -> Result<AnalysisResult, ClientError> {
        validate_upload(filename, content.len())?;

        let part = Part::bytes(content)
            .file_name(filename.to_string())
            .mime_str(content_type(filename))?;
        let mut form = Form::new().part("file", part);
        if let Some(region) = region {
            form = form.text("body_part", region.id());
        }

        let result: AnalysisResult = self
            .gateway
            .request_as(ApiRequest::post("/api/skin-check/upload").multipart(form))
            .await?;
        tracing::info!(id = %result.id, "image uploaded");
        Ok(result)
    }

    pub async fn upload_image_file(
        &self,
        path: impl AsRef<Path>,
        region: Option<BodyRegion>,
    ) -> Result<AnalysisResult, ClientError> {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ClientError::Validation("Invalid file name".to_string()))?
            .to_string();
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| ClientError::Validation(format!("Cannot read {}: {}", path.display(), e)))?;
        validate_upload(&filename, metadata.len() as usize)?;

        let content = tokio::fs::read(path)
            .await
            .map_err(|e| ClientError::Validation(format!("Cannot read {}: {}", path.display(), e)))?;
        self.upload_image(&filename, content, region).await
    }

    pub async fn list_results(&self) -> Result<Vec<AnalysisResult>, ClientError> {
        self.gateway.request_as(ApiRequest::get("/api/skin-check/images")).await
    }

    pub async fn get_result(&self, id: &str) -> Result<AnalysisResult, ClientError> {
        let path = format!("/api/skin-check/images/{}", urlencoding::encode(id));
        self.gateway.request_as(ApiRequest::get(path)).await
    }

    pub async fn delete_result(&self, id: &str) -> Result<(), ClientError> {
        let path = format!("/api/skin-check/images/{}", urlencoding::encode(id));
        self.gateway.request(ApiRequest::delete(path)).await?;
        Ok(())
    }

    /// Absolute URL of a stored image.
    pub fn image_url(&self, image_path: &str) -> String {
        let encoded: Vec<_> = image_path
            .trim_start_matches('/')
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        self.gateway.url(&format!("/api/storage/{}", encoded.join("/")))
    }

    /// Keeps refetching the result list while anything is still running.
    /// Drop the handle when the view goes away.
    pub fn poll_results<U>(&self, on_update: U) -> PollHandle
    where
        U: FnMut(&[AnalysisResult]) + Send + 'static,
    {
        let gateway = self.gateway.clone();
        let fetch = move || {
            let gateway = gateway.clone();
            async move { gateway.request(ApiRequest::get("/api/skin-check/images")).await }
        };
        ResultPoller::new(self.config.poll_interval).spawn(fetch, on_update)
    }
}

impl Drop for DermaDocClient {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Drops the session and the conversation whenever the server rejects the token.
fn spawn_invalidation_listener(
    sessions: Arc<SessionStore>,
    conversation: Arc<Mutex<ConversationManager>>,
    mut events: broadcast::Receiver<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "session listener lagged");
                    SessionEvent::Invalidated
                }
                Err(RecvError::Closed) => break,
            };
            sessions.handle_event(event);
            match event {
                SessionEvent::Invalidated => conversation.lock().await.logout(),
            }
        }
    })
}

fn validate_upload(filename: &str, size: usize) -> Result<(), ClientError> {
    validate_extension(filename).map_err(|e| ClientError::Validation(e.to_string()))?;
    if size > MAX_IMAGE_SIZE {
        return Err(ClientError::Validation(format!(
            "File too large. Maximum size: {}MB",
            MAX_IMAGE_SIZE / 1024 / 1024
        )));
    }
    if size == 0 {
        return Err(ClientError::Validation("File is empty".to_string()));
    }
    Ok(())
}
