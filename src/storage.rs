// src/storage.rs
//! On-disk image storage.
//!
//! Images live under `<root>/skin_check_images/<user id>/<uuid><ext>` and are referred to
//! by their path relative to `<root>`. Every path handed out or accepted is
//! checked to stay inside the storage root.

use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub const ALLOWED_IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp"];
pub const MAX_IMAGE_SIZE: usize = 5 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid file type. Allowed types: {}", ALLOWED_IMAGE_EXTENSIONS.join(", "))]
    InvalidFileType,
    #[error("Invalid user ID format")]
    InvalidUserId,
    #[error("Invalid file path")]
    InvalidPath,
    #[error("File too large. Maximum size: {}MB", MAX_IMAGE_SIZE / 1024 / 1024)]
    TooLarge,
    #[error("Invalid image file")]
    NotAnImage,
    #[error("File not found")]
    NotFound,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub const SKIN_CHECK_DIR: &str = "skin_check_images";

#[derive(Debug, Clone)]
pub struct ImageStorage {
    root: PathBuf,
}

impl ImageStorage {
    /// Creates the storage directories and pins the canonical root.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root.join(SKIN_CHECK_DIR))?;
        Ok(Self {
            root: root.canonicalize()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validates and writes an uploaded image, returning its relative path.
    pub async fn save_image(
        &self,
        user_id: &str,
        filename: &str,
        content: &[u8],
    ) -> Result<String, StorageError> {
        let ext = validate_extension(filename)?;
        let user_id = sanitize_user_id(user_id)?;

        if content.len() > MAX_IMAGE_SIZE {
            return Err(StorageError::TooLarge);
        }
        if !looks_like_image(content) {
            return Err(StorageError::NotAnImage);
        }

        let base = self.root.join(SKIN_CHECK_DIR);
        let user_dir = base.join(&user_id);
        fs::create_dir_all(&user_dir).await?;
        let user_dir = user_dir.canonicalize()?;
        if !user_dir.starts_with(&base) {
            return Err(StorageError::InvalidPath);
        }

        let stored_name = format!("{}{}", Uuid::new_v4(), ext);
        let file_path = user_dir.join(&stored_name);

        let mut file = fs::File::create(&file_path).await?;
        file.write_all(content).await?;
        file.flush().await?;

        tracing::info!(path = %file_path.display(), bytes = content.len(), "stored image");
        Ok(format!("{}/{}/{}", SKIN_CHECK_DIR, user_id, stored_name))
    }

    /// Resolves a relative path to an existing file inside the root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let candidate = Path::new(relative);
        let lexically_safe = !relative.is_empty()
            && candidate
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !lexically_safe {
            return Err(StorageError::InvalidPath);
        }

        let full = self.root.join(candidate);
        let resolved = match full.canonicalize() {
            Ok(path) => path,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StorageError::NotFound),
            Err(e) => return Err(e.into()),
        };
        if !resolved.starts_with(&self.root) {
            return Err(StorageError::InvalidPath);
        }
        if !resolved.is_file() {
            return Err(StorageError::NotFound);
        }
        Ok(resolved)
    }

    /// Removes an image and, when it was the last one, its user directory.
    /// Returns whether a file was deleted.
    pub async fn delete_image(&self, relative: &str) -> bool {
        let path = match self.resolve(relative) {
            Ok(path) => path,
            Err(_) => return false,
        };

        if let Err(e) = fs::remove_file(&path).await {
            tracing::warn!(path = %path.display(), error = %e, "failed to delete image");
            return false;
        }

        if let Some(parent) = path.parent() {
            if parent != self.root && is_empty_dir(parent).await {
                let _ = fs::remove_dir(parent).await;
            }
        }
        true
    }

    pub fn absolute_path(&self, relative: &str) -> Result<PathBuf, StorageError> {
        self.resolve(relative)
    }
}

async fn is_empty_dir(path: &Path) -> bool {
    match fs::read_dir(path).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}

/// Lower-cased extension including the dot, if it is on the allow-list.
pub fn validate_extension(filename: &str) -> Result<String, StorageError> {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .ok_or(StorageError::InvalidFileType)?;

    if ALLOWED_IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        Ok(ext)
    } else {
        Err(StorageError::InvalidFileType)
    }
}

/// User ids become directory names, so only alphanumerics and `-` pass.
pub fn sanitize_user_id(user_id: &str) -> Result<String, StorageError> {
    if user_id.is_empty() || !user_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(StorageError::InvalidUserId);
    }
    Ok(user_id.to_string())
}

/// Magic-byte sniffing for the allowed formats.
pub fn looks_like_image(content: &[u8]) -> bool {
    content.starts_with(&[0xff, 0xd8, 0xff])
        || content.starts_with(b"\x89PNG")
        || content.starts_with(b"GIF8")
        || (content.len() >= 12 && &content[0..4] == b"RIFF" && &content[8..12] == b"WEBP")
}

/// MIME type for a stored image, by extension.
pub fn content_type(file_path: &str) -> &'static str {
    let ext = file_path.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

pub fn image_url(relative: &str) -> String {
    format!("/api/storage/{}", relative)
}
