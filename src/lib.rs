// lib.rs - DermaDoc backend and client core
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod gemini_client;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod prompts;
pub mod services;
pub mod sse;
pub mod storage;

use std::sync::Arc;

// AppState holds the database pool, settings, image storage and the optional AI collaborators
pub struct AppState {
    pub db_pool: sqlx::PgPool,
    pub settings: config::Settings,
    pub storage: storage::ImageStorage,
    pub gemini_client: Option<gemini_client::GeminiClient>,
    pub classifier: Option<Arc<dyn services::classifier::Classifier>>,
}

pub type SharedState = Arc<AppState>;
