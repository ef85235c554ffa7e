use crate::config::Settings;
use crate::error::ApiError;
use crate::middleware::auth::{auth_middleware, CurrentUser};
use crate::models::auth::*;
use crate::SharedState;
use axum::{
    extract::Extension,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

const MIN_PASSWORD_LEN: usize = 6;
const MAX_PASSWORD_LEN: usize = 72;
const BCRYPT_MAX_BYTES: usize = 72;

lazy_static! {
    static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
}

const USER_COLUMNS: &str = "id, name, email, password_hash, birthdate, gender, created_at, updated_at";

pub fn auth_routes() -> Router {
    let public_routes = Router::new()
        .route("/api/auth/signup", post(signup))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout));

    let protected_routes = Router::new()
        .route("/api/auth/me", get(me).put(update_profile))
        .route("/api/auth/change-password", post(change_password))
        .layer(axum::middleware::from_fn(auth_middleware));

    public_routes.merge(protected_routes)
}

async fn signup(
    Extension(state): Extension<SharedState>,
    Json(payload): Json<SignupRequest>,
) -> Result<(StatusCode, Json<TokenResponse>), ApiError> {
    let email = payload.email.trim().to_lowercase();
    if payload.name.trim().is_empty() || payload.birthdate.trim().is_empty() || payload.gender.trim().is_empty() {
        return Err(ApiError::BadRequest("Name, birthdate and gender are required".to_string()));
    }
    if !EMAIL_RE.is_match(&email) {
        return Err(ApiError::BadRequest("Invalid email address".to_string()));
    }
    validate_password(&payload.password)?;

    let existing: Option<Uuid> = sqlx::query_scalar("SELECT id FROM users WHERE email = $1")
        .bind(&email)
        .fetch_optional(&state.db_pool)
        .await?;
    if existing.is_some() {
        return Err(ApiError::BadRequest("Email already registered".to_string()));
    }

    let password_hash = hash_password(&payload.password)?;

    let user = sqlx::query_as::<_, User>(&format!(
        "INSERT INTO users (id, name, email, password_hash, birthdate, gender, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW())
         RETURNING {USER_COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(payload.name.trim())
    .bind(&email)
    .bind(&password_hash)
    .bind(payload.birthdate.trim())
    .bind(payload.gender.trim())
    .fetch_one(&state.db_pool)
    .await?;

    tracing::info!(user_id = %user.id, "user registered");
    let token = generate_jwt_token(&user, &state.settings)?;
    Ok((StatusCode::CREATED, Json(TokenResponse::new(token, user))))
}

async fn login(
    Extension(state): Extension<SharedState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let invalid = || ApiError::Unauthorized("Incorrect email or password".to_string());

    let user = sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1"))
        .bind(payload.email.trim().to_lowercase())
        .fetch_optional(&state.db_pool)
        .await?
        .ok_or_else(invalid)?;

    if !verify_password(&payload.password, &user.password_hash) {
        return Err(invalid());
    }

    let token = generate_jwt_token(&user, &state.settings)?;
    Ok(Json(TokenResponse::new(token, user)))
}

/// Tokens are stateless; the client discards its copy.
async fn logout() -> Json<Value> {
    Json(json!({ "message": "Successfully logged out" }))
}

async fn me(Extension(CurrentUser(user)): Extension<CurrentUser>) -> Json<UserResponse> {
    Json(UserResponse::from(user))
}

async fn update_profile(
    Extension(state): Extension<SharedState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(payload): Json<ProfileUpdateRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    let clean = |value: Option<String>, field: &str| -> Result<Option<String>, ApiError> {
        match value.map(|v| v.trim().to_string()) {
            Some(v) if v.is_empty() => Err(ApiError::BadRequest(format!("{} cannot be empty", field))),
            other => Ok(other),
        }
    };
    let name = clean(payload.name, "Name")?;
    let birthdate = clean(payload.birthdate, "Birthdate")?;
    let gender = clean(payload.gender, "Gender")?;

    let updated = sqlx::query_as::<_, User>(&format!(
        "UPDATE users
         SET name = COALESCE($2, name), birthdate = COALESCE($3, birthdate),
             gender = COALESCE($4, gender), updated_at = NOW()
         WHERE id = $1
         RETURNING {USER_COLUMNS}"
    ))
    .bind(user.id)
    .bind(name)
    .bind(birthdate)
    .bind(gender)
    .fetch_one(&state.db_pool)
    .await?;

    Ok(Json(UserResponse::from(updated)))
}

async fn change_password(
    Extension(state): Extension<SharedState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Json<Value>, ApiError> {
    if !verify_password(&payload.current_password, &user.password_hash) {
        return Err(ApiError::BadRequest("Current password is incorrect".to_string()));
    }
    validate_password(&payload.new_password)?;

    let password_hash = hash_password(&payload.new_password)?;
    sqlx::query("UPDATE users SET password_hash = $2, updated_at = NOW() WHERE id = $1")
        .bind(user.id)
        .bind(&password_hash)
        .execute(&state.db_pool)
        .await?;

    tracing::info!(user_id = %user.id, "password changed");
    Ok(Json(json!({ "message": "Password updated successfully" })))
}

fn validate_password(password: &str) -> Result<(), ApiError> {
    let len = password.chars().count();
    if !(MIN_PASSWORD_LEN..=MAX_PASSWORD_LEN).contains(&len) {
        return Err(ApiError::BadRequest(format!(
            "Password must be between {} and {} characters long",
            MIN_PASSWORD_LEN, MAX_PASSWORD_LEN
        )));
    }
    Ok(())
}

/// bcrypt only looks at 72 bytes; longer inputs are SHA-256 digested first.
fn password_material(password: &str) -> Vec<u8> {
    let bytes = password.as_bytes();
    if bytes.len() > BCRYPT_MAX_BYTES {
        Sha256::digest(bytes).to_vec()
    } else {
        bytes.to_vec()
    }
}

pub fn hash_password(password: &str) -> Result<String, ApiError> {
    hash(password_material(password), DEFAULT_COST).map_err(|e| {
        tracing::error!("Error hashing password: {}", e);
        ApiError::Internal("password hashing failed".to_string())
    })
}

pub fn verify_password(password: &str, password_hash: &str) -> bool {
    match verify(password_material(password), password_hash) {
        Ok(valid) => valid,
        Err(e) => {
            tracing::warn!("Password verification error: {}", e);
            false
        }
    }
}

pub fn generate_jwt_token(user: &User, settings: &Settings) -> Result<String, ApiError> {
    let now = Utc::now();
    let expiration = now + Duration::minutes(settings.access_token_expire_minutes);

    let claims = Claims {
        sub: user.id.to_string(),
        email: user.email.clone(),
        exp: expiration.timestamp() as usize,
        iat: now.timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(settings.jwt_secret.as_ref()),
    )
    .map_err(|e| {
        tracing::error!("Error generating JWT token: {}", e);
        ApiError::Internal("Failed to generate authentication token".to_string())
    })
}

pub fn verify_jwt_token(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &Validation::default(),
    )
    .map(|data| data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(minutes: i64) -> Settings {
        Settings {
            database_url: String::new(),
            jwt_secret: "test-secret".to_string(),
            access_token_expire_minutes: minutes,
            cors_origins: vec![],
            gemini_api_key: None,
            gemini_model: "m".to_string(),
            chat_max_output_tokens: 1024,
            chat_max_input_tokens: 8000,
            storage_root: "storage".into(),
            classifier_url: None,
            bind_addr: "127.0.0.1:0".to_string(),
        }
    }

    fn user() -> User {
        User {
            id: Uuid::new_v4(),
            name: "Ada".to_string(),
            email: "ada@example.com".to_string(),
            password_hash: String::new(),
            birthdate: "1990-01-01".to_string(),
            gender: "female".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_jwt_round_trip_carries_user_id() {
        let user = user();
        let token = generate_jwt_token(&user, &settings(30)).unwrap();
        let claims = verify_jwt_token(&token, "test-secret").unwrap();
        assert_eq!(claims.sub, user.id.to_string());
        assert!(verify_jwt_token(&token, "other-secret").is_err());
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let token = generate_jwt_token(&user(), &settings(-10)).unwrap();
        assert!(verify_jwt_token(&token, "test-secret").is_err());
    }

    #[test]
    fn test_password_hash_and_verify() {
        let hashed = hash_password("hunter22").unwrap();
        assert!(verify_password("hunter22", &hashed));
        assert!(!verify_password("hunter23", &hashed));
        assert!(!verify_password("hunter22", "not-a-bcrypt-hash"));
    }

    #[test]
    fn test_long_passwords_are_prehashed() {
        let long = "é".repeat(40); // 80 bytes
        assert_eq!(password_material(&long).len(), 32);
        assert_eq!(password_material("short").len(), 5);
    }

    #[test]
    fn test_password_length_bounds() {
        assert!(validate_password("12345").is_err());
        assert!(validate_password("123456").is_ok());
        assert!(validate_password(&"x".repeat(73)).is_err());
    }

    #[test]
    fn test_email_pattern() {
        assert!(EMAIL_RE.is_match("a@b.co"));
        assert!(!EMAIL_RE.is_match("not-an-email"));
        assert!(!EMAIL_RE.is_match("a@b"));
    }
}
