use crate::device::remote_fs::RemoteEntry;
use crate::error::AppError;
use crate::tools::session_tool::SessionManager;
use crate::utils::remote_path;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

// --- Schemas for parameters ---
#[derive(Debug, Deserialize, Default)]
pub struct ListDirectoryParams {
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    #[default]
    Text,
    Base64,
}

#[derive(Debug, Deserialize)]
pub struct ReadFileParams {
    pub path: String,
    #[serde(default)]
    pub encoding: ContentEncoding,
}

#[derive(Debug, Deserialize)]
pub struct WriteFileParams {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub encoding: ContentEncoding,
}

#[derive(Debug, Deserialize)]
pub struct DeletePathParams {
    pub path: String,
    #[serde(default)]
    pub is_dir: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateDirectoryParams {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct RenamePathParams {
    pub source: String,
    pub destination: String,
}

// --- Schemas for results ---
#[derive(Debug, Serialize)]
pub struct ListDirectoryResult {
    pub path: String,
    pub entries: Vec<RemoteEntry>,
}

#[derive(Debug, Serialize)]
pub struct FileContent {
    pub path: String,
    pub size: usize,
    pub encoding: &'static str,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct WriteFileResult {
    pub path: String,
    pub bytes_written: usize,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct FileOperationResult {
    pub path: String,
    pub message: String,
}

/// Device filesystem operations. Every call goes to the device; nothing is cached.
#[derive(Debug)]
pub struct FilesystemManager {
    session: Arc<SessionManager>,
}

impl FilesystemManager {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    fn require_path(raw: &str) -> Result<String, AppError> {
        if raw.trim().is_empty() {
            return Err(AppError::InvalidInputArgument("path must not be empty".to_string()));
        }
        Ok(remote_path::normalize(raw.trim()))
    }

    fn require_file_path(raw: &str) -> Result<String, AppError> {
        let path = Self::require_path(raw)?;
        if path == "/" {
            return Err(AppError::InvalidInputArgument("the root directory is not a file".to_string()));
        }
        Ok(path)
    }

    #[instrument(skip(self, params), fields(path = ?params.path))]
    pub async fn list_directory(&self, params: &ListDirectoryParams) -> Result<ListDirectoryResult, AppError> {
        let path = remote_path::normalize(params.path.as_deref().unwrap_or("/"));
        let link = self.session.current_link().await?;
        let entries = self.session.remote_fs(&link).list(&path).await?;
        Ok(ListDirectoryResult { path, entries })
    }

    #[instrument(skip(self, params), fields(path = %params.path))]
    pub async fn read_file(&self, params: &ReadFileParams) -> Result<FileContent, AppError> {
        let path = Self::require_file_path(&params.path)?;
        let link = self.session.current_link().await?;
        let bytes = self.session.remote_fs(&link).read(&path).await?;
        let size = bytes.len();

        let (encoding, content) = match params.encoding {
            ContentEncoding::Base64 => ("base64", BASE64_STANDARD.encode(&bytes)),
            ContentEncoding::Text => match String::from_utf8(bytes) {
                Ok(text) => ("text", text),
                Err(e) => {
                    warn!(path = %path, "File is not valid UTF-8, returning base64");
                    ("base64", BASE64_STANDARD.encode(e.as_bytes()))
                }
            },
        };
        debug!(path = %path, size, encoding, "Read device file");
        Ok(FileContent {
            path,
            size,
            encoding,
            content,
        })
    }

    #[instrument(skip(self, params), fields(path = %params.path, content_len = params.content.len()))]
    pub async fn write_file(&self, params: &WriteFileParams) -> Result<WriteFileResult, AppError> {
        let path = Self::require_file_path(&params.path)?;
        let bytes = match params.encoding {
            ContentEncoding::Text => params.content.as_bytes().to_vec(),
            ContentEncoding::Base64 => BASE64_STANDARD
                .decode(params.content.trim())
                .map_err(|e| AppError::InvalidInputArgument(format!("content is not valid base64: {}", e)))?,
        };
        let link = self.session.current_link().await?;
        self.session.remote_fs(&link).write(&path, &bytes).await?;
        Ok(WriteFileResult {
            message: format!("Wrote {} bytes to {}", bytes.len(), path),
            bytes_written: bytes.len(),
            path,
        })
    }

    #[instrument(skip(self, params), fields(path = %params.path, is_dir = params.is_dir))]
    pub async fn delete_path(&self, params: &DeletePathParams) -> Result<FileOperationResult, AppError> {
        let path = Self::require_file_path(&params.path)?;
        let link = self.session.current_link().await?;
        self.session.remote_fs(&link).delete(&path, params.is_dir).await?;
        Ok(FileOperationResult {
            message: format!("Deleted {}", path),
            path,
        })
    }

    #[instrument(skip(self, params), fields(path = %params.path))]
    pub async fn create_directory(&self, params: &CreateDirectoryParams) -> Result<FileOperationResult, AppError> {
        let path = Self::require_file_path(&params.path)?;
        let link = self.session.current_link().await?;
        self.session.remote_fs(&link).mkdir(&path).await?;
        Ok(FileOperationResult {
            message: format!("Created directory {}", path),
            path,
        })
    }

    #[instrument(skip(self, params), fields(source = %params.source, destination = %params.destination))]
    pub async fn rename_path(&self, params: &RenamePathParams) -> Result<FileOperationResult, AppError> {
        let source = Self::require_file_path(&params.source)?;
        let destination = Self::require_file_path(&params.destination)?;
        let link = self.session.current_link().await?;
        self.session.remote_fs(&link).rename(&source, &destination).await?;
        Ok(FileOperationResult {
            message: format!("Renamed {} to {}", source, destination),
            path: destination,
        })
    }
}
