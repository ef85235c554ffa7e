// src/config.rs
use std::{env, fmt::Display, path::PathBuf, str::FromStr};

use tracing::{info, warn};

const DEFAULT_CORS_ORIGINS: &str = "http://localhost:5173,http://localhost:3000,http://127.0.0.1:5173";

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub jwt_secret: String,
    pub access_token_expire_minutes: i64,
    pub cors_origins: Vec<String>,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub chat_max_output_tokens: u32,
    pub chat_max_input_tokens: usize,
    pub storage_root: PathBuf,
    pub classifier_url: Option<String>,
    pub bind_addr: String,
}

impl Settings {
    /// Reads the process environment. `.env` is loaded by the binary first.
    pub fn from_env() -> Result<Self, String> {
        let database_url = env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set".to_string())?;

        let jwt_secret = var("JWT_SECRET").unwrap_or_else(|_| {
            warn!("JWT_SECRET not set, using an insecure development secret");
            "change-this-secret-in-production".to_string()
        });

        Ok(Self {
            database_url,
            jwt_secret,
            access_token_expire_minutes: try_load("ACCESS_TOKEN_EXPIRE_MINUTES", 30),
            cors_origins: parse_origins(&var("CORS_ORIGINS").unwrap_or_else(|_| DEFAULT_CORS_ORIGINS.to_string())),
            gemini_api_key: non_empty(var("GEMINI_API_KEY").ok()),
            gemini_model: var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-2.5-flash-lite".to_string()),
            chat_max_output_tokens: try_load("CHAT_MAX_OUTPUT_TOKENS", 1024),
            chat_max_input_tokens: try_load("CHAT_MAX_INPUT_TOKENS", 8000),
            storage_root: PathBuf::from(var("STORAGE_ROOT").unwrap_or_else(|_| "storage".to_string())),
            classifier_url: non_empty(var("CLASSIFIER_URL").ok()),
            bind_addr: var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string()),
        })
    }
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| {
        info!("Environment variable {key} not found, using default");
    })
}

fn try_load<T: FromStr + Display>(key: &str, default: T) -> T
where
    T::Err: Display,
{
    match var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|e| {
            warn!("Invalid {key} value {raw:?}: {e}, using default {default}");
            default
        }),
        Err(_) => default,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|origin| origin.trim().to_string())
        .filter(|origin| !origin.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_origins_trims_and_skips_empty() {
        assert_eq!(
            parse_origins(" http://a.test , ,http://b.test,"),
            vec!["http://a.test".to_string(), "http://b.test".to_string()]
        );
    }

    #[test]
    fn test_non_empty_strips_whitespace_only_keys() {
        assert_eq!(non_empty(Some("   ".to_string())), None);
        assert_eq!(non_empty(Some(" key \n".to_string())), Some("key".to_string()));
        assert_eq!(non_empty(None), None);
    }
}
