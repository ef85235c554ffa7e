//! The single chokepoint every backend call goes through.
//!
//! Attaches the stored bearer token, turns error bodies into readable
//! messages, and tears the session down when the server answers 401.
//! Nothing is retried here.

use reqwest::{multipart::Form, Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::error::ClientError;
use super::events::{EventBus, SessionEvent};
use super::store::KeyValueStore;

pub const TOKEN_KEY: &str = "token";
pub const USER_KEY: &str = "user";

#[derive(Debug)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Multipart(Form),
}

#[derive(Debug)]
pub struct ApiRequest {
    method: Method,
    path: String,
    body: RequestBody,
    credentials: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: RequestBody::Empty,
            credentials: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, ClientError> {
        self.body = RequestBody::Json(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn multipart(mut self, form: Form) -> Self {
        self.body = RequestBody::Multipart(form);
        self
    }

    /// Marks a login/signup call: a 401 means bad credentials, not an
    /// expired session.
    pub fn credentials(mut self) -> Self {
        self.credentials = true;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[derive(Clone)]
pub struct ApiGateway {
    http: Client,
    base_url: String,
    store: Arc<dyn KeyValueStore>,
    events: EventBus,
}

impl ApiGateway {
    pub fn new(base_url: impl Into<String>, store: Arc<dyn KeyValueStore>, events: EventBus) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            store,
            events,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Issues the request and returns the parsed JSON body (`null` when empty).
    pub async fn request(&self, request: ApiRequest) -> Result<Value, ClientError> {
        let response = self.dispatch(request).await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    pub async fn request_as<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ClientError> {
        Ok(serde_json::from_value(self.request(request).await?)?)
    }

    /// Like `request`, but hands back the response so its body can be read
    /// incrementally.
    pub async fn open_stream(&self, request: ApiRequest) -> Result<Response, ClientError> {
        self.dispatch(request).await
    }

    async fn dispatch(&self, request: ApiRequest) -> Result<Response, ClientError> {
        let ApiRequest {
            method,
            path,
            body,
            credentials,
        } = request;

        let mut builder = self.http.request(method.clone(), self.url(&path));
        if let Some(token) = self.store.get(TOKEN_KEY) {
            builder = builder.bearer_auth(token);
        }
        builder = match body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Multipart(form) => builder.multipart(form),
        };

        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        tracing::debug!(method = %method, path = %path, status = status.as_u16(), "request failed");

        if status == StatusCode::UNAUTHORIZED {
            if credentials {
                return Err(ClientError::InvalidCredentials(error_message(status, &body)));
            }
            self.invalidate_session();
            return Err(ClientError::Unauthorized);
        }

        Err(ClientError::Api {
            status: status.as_u16(),
            message: error_message(status, &body),
        })
    }

    fn invalidate_session(&self) {
        tracing::warn!("bearer token rejected, clearing session");
        for key in [TOKEN_KEY, USER_KEY] {
            if let Err(e) = self.store.remove(key) {
                tracing::error!(key, error = %e, "failed to clear session key");
            }
        }
        self.events.publish(SessionEvent::Invalidated);
    }
}

/// Human-readable message from an error body: `detail`, then `message`,
/// then the status text.
pub fn error_message(status: StatusCode, body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let field = |name: &str| {
        parsed.as_ref().and_then(|v| v.get(name)).and_then(|v| match v {
            Value::Null => None,
            Value::String(s) if s.trim().is_empty() => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
    };

    field("detail")
        .or_else(|| field("message"))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
        })
}
