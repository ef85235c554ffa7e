use crate::error::ApiError;
use crate::middleware::auth::{auth_middleware, CurrentUser};
use crate::models::skin_check::{AnalysisResult, AnalysisStatus, SkinCheck, SkinCheckUpdate};
use crate::services::spawn_analysis;
use crate::storage::MAX_IMAGE_SIZE;
use crate::SharedState;
use axum::{
    extract::{multipart::Multipart, DefaultBodyLimit, Extension, Path},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use uuid::Uuid;

const SKIN_CHECK_COLUMNS: &str = "id, user_id, relative_path, status, disease_type, body_part, confidence, \
     predictions, description, recommendation, created_at, updated_at";

pub fn skin_check_routes() -> Router {
    Router::new()
        .route("/api/skin-check/upload", post(upload_skin_check_image))
        .route("/api/skin-check/images", get(list_skin_check_images))
        .route(
            "/api/skin-check/images/:image_id",
            get(get_skin_check_image)
                .put(update_skin_check_image)
                .delete(delete_skin_check_image),
        )
        .layer(axum::middleware::from_fn(auth_middleware))
        // multipart framing overhead on top of the image limit
        .layer(DefaultBodyLimit::max(MAX_IMAGE_SIZE + 64 * 1024))
}

async fn upload_skin_check_image(
    Extension(state): Extension<SharedState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<AnalysisResult>), ApiError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut body_part: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Invalid multipart body: {}", e)))?
    {
        match field.name() {
            Some("file") => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read upload: {}", e)))?;
                file = Some((filename, data.to_vec()));
            }
            Some("body_part") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Invalid body_part: {}", e)))?;
                body_part = Some(value.trim().to_string()).filter(|v| !v.is_empty());
            }
            other => {
                tracing::debug!(field = ?other, "ignoring unexpected multipart field");
            }
        }
    }

    let (filename, content) = file.ok_or_else(|| ApiError::BadRequest("No file uploaded".to_string()))?;
    let relative_path = state
        .storage
        .save_image(&user.id.to_string(), &filename, &content)
        .await?;

    let inserted = sqlx::query_as::<_, SkinCheck>(&format!(
        "INSERT INTO skin_checks (id, user_id, relative_path, status, body_part, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, NOW(), NOW())
         RETURNING {SKIN_CHECK_COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(user.id)
    .bind(&relative_path)
    .bind(AnalysisStatus::Pending.as_str())
    .bind(&body_part)
    .fetch_one(&state.db_pool)
    .await;

    let record = match inserted {
        Ok(record) => record,
        Err(e) => {
            state.storage.delete_image(&relative_path).await;
            return Err(e.into());
        }
    };

    tracing::info!(image_id = %record.id, user_id = %user.id, "skin check uploaded");
    spawn_analysis(state.clone(), record.id);

    Ok((StatusCode::CREATED, Json(AnalysisResult::from(record))))
}

async fn list_skin_check_images(
    Extension(state): Extension<SharedState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<Json<Vec<AnalysisResult>>, ApiError> {
    let rows = sqlx::query_as::<_, SkinCheck>(&format!(
        "SELECT {SKIN_CHECK_COLUMNS} FROM skin_checks WHERE user_id = $1 ORDER BY created_at DESC"
    ))
    .bind(user.id)
    .fetch_all(&state.db_pool)
    .await?;

    Ok(Json(rows.into_iter().map(AnalysisResult::from).collect()))
}

async fn get_skin_check_image(
    Extension(state): Extension<SharedState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(image_id): Path<String>,
) -> Result<Json<AnalysisResult>, ApiError> {
    let record = find_owned(&state, &image_id, user.id).await?;
    Ok(Json(AnalysisResult::from(record)))
}

async fn update_skin_check_image(
    Extension(state): Extension<SharedState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(image_id): Path<String>,
    Json(update): Json<SkinCheckUpdate>,
) -> Result<Json<AnalysisResult>, ApiError> {
    let record = find_owned(&state, &image_id, user.id).await?;

    let updated = sqlx::query_as::<_, SkinCheck>(&format!(
        "UPDATE skin_checks
         SET status = COALESCE($2, status), disease_type = COALESCE($3, disease_type), updated_at = NOW()
         WHERE id = $1
         RETURNING {SKIN_CHECK_COLUMNS}"
    ))
    .bind(record.id)
    .bind(update.status.map(|s| s.as_str()))
    .bind(update.disease_type)
    .fetch_one(&state.db_pool)
    .await?;

    Ok(Json(AnalysisResult::from(updated)))
}

async fn delete_skin_check_image(
    Extension(state): Extension<SharedState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(image_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = find_owned(&state, &image_id, user.id).await?;

    if !state.storage.delete_image(&record.relative_path).await {
        tracing::warn!(image_id = %record.id, path = %record.relative_path, "image file already missing");
    }
    sqlx::query("DELETE FROM skin_checks WHERE id = $1")
        .bind(record.id)
        .execute(&state.db_pool)
        .await?;

    Ok(Json(json!({ "message": "Image deleted successfully" })))
}

/// Loads a skin check owned by `user_id`; anything else is a 404.
async fn find_owned(state: &SharedState, image_id: &str, user_id: Uuid) -> Result<SkinCheck, ApiError> {
    let id = Uuid::parse_str(image_id).map_err(|_| ApiError::BadRequest("Invalid image ID".to_string()))?;

    sqlx::query_as::<_, SkinCheck>(&format!(
        "SELECT {SKIN_CHECK_COLUMNS} FROM skin_checks WHERE id = $1 AND user_id = $2"
    ))
    .bind(id)
    .bind(user_id)
    .fetch_optional(&state.db_pool)
    .await?
    .ok_or_else(|| ApiError::NotFound("Image not found".to_string()))
}
