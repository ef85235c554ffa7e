use crate::error::ApiError;
use crate::storage::{content_type, StorageError};
use crate::SharedState;
use axum::{
    extract::{Extension, Path},
    http::header,
    response::IntoResponse,
    routing::get,
    Router,
};

pub fn storage_routes() -> Router {
    Router::new().route("/api/storage/*file_path", get(serve_storage))
}

async fn serve_storage(
    Extension(state): Extension<SharedState>,
    Path(file_path): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let path = state.storage.resolve(&file_path).map_err(|e| match e {
        StorageError::Io(_) | StorageError::NotFound | StorageError::InvalidPath => {
            ApiError::NotFound("File not found".to_string())
        }
        other => ApiError::from(other),
    })?;

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::Internal(format!("failed to read {}: {}", path.display(), e)))?;

    Ok(([(header::CONTENT_TYPE, content_type(&file_path))], bytes))
}
