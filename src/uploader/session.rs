use std::fmt;
use std::path::Path;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{UploadFailure, UplinkResult};
use crate::uploader::progress::ProgressSnapshot;
use crate::validation::infer_mime;

/// Logical slot an upload belongs to, e.g. product id plus print location.
/// Starting a new upload for an occupied key supersedes the previous session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextKey(String);

impl ContextKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContextKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for ContextKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// What the client knows about the file before any bytes move.
/// Immutable once the transfer phase starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub name: String,
    pub byte_size: u64,
    pub declared_mime: Option<String>,
}

/// Descriptor plus payload. `Bytes` keeps retries cheap: every attempt
/// resends the same immutable buffer without copying.
#[derive(Debug, Clone)]
pub struct AssetFile {
    pub descriptor: FileDescriptor,
    pub content: Bytes,
}

impl AssetFile {
    pub fn from_bytes(
        name: impl Into<String>,
        content: impl Into<Bytes>,
        declared_mime: Option<String>,
    ) -> Self {
        let name = name.into();
        let content = content.into();
        let declared_mime = declared_mime.or_else(|| infer_mime(&name).map(|m| m.to_string()));
        Self {
            descriptor: FileDescriptor {
                byte_size: content.len() as u64,
                name,
                declared_mime,
            },
            content,
        }
    }

    /// Reads the whole file into memory; the transfer phase needs the full
    /// payload anyway since retries resend from scratch.
    pub async fn from_path(path: impl AsRef<Path>) -> UplinkResult<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name")
            })?;
        let content = tokio::fs::read(path).await?;
        Ok(Self::from_bytes(name, content, None))
    }
}

/// Upload session lifecycle. `ready`, `needsReview` and `blocked` are the
/// success terminals; `failed` and `cancelled` the unsuccessful ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Idle,
    Negotiating,
    Transferring,
    Finalizing,
    Processing,
    Ready,
    NeedsReview,
    Blocked,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Ready
                | SessionStatus::NeedsReview
                | SessionStatus::Blocked
                | SessionStatus::Failed
                | SessionStatus::Cancelled
        )
    }

    pub fn is_success(self) -> bool {
        matches!(
            self,
            SessionStatus::Ready | SessionStatus::NeedsReview | SessionStatus::Blocked
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Negotiating => "negotiating",
            SessionStatus::Transferring => "transferring",
            SessionStatus::Finalizing => "finalizing",
            SessionStatus::Processing => "processing",
            SessionStatus::Ready => "ready",
            SessionStatus::NeedsReview => "needsReview",
            SessionStatus::Blocked => "blocked",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-reported asset properties after processing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width_px: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height_px: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dpi: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_profile: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "camelCase")]
pub enum QualityWarning {
    #[serde(rename_all = "camelCase")]
    LowResolution { dpi: u32, min_dpi: u32 },
    Server { message: String },
}

/// The durable outcome of a successful upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredAsset {
    pub stored_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    #[serde(default)]
    pub metadata: AssetMetadata,
    #[serde(default)]
    pub quality_warnings: Vec<QualityWarning>,
}

/// One upload attempt from intent to terminal state. Owned by the driver
/// task; exactly one stage mutates it at a time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub id: String,
    pub context_key: ContextKey,
    pub file: FileDescriptor,
    pub status: SessionStatus,
    pub active_provider: Option<String>,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<StoredAsset>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<UploadFailure>,
}

impl UploadSession {
    pub fn new(context_key: ContextKey, file: FileDescriptor) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            context_key,
            file,
            status: SessionStatus::Idle,
            active_provider: None,
            attempt: 0,
            created_at: Utc::now(),
            result: None,
            error: None,
        }
    }

    /// Non-terminal stage transition.
    pub fn advance(&mut self, status: SessionStatus) {
        self.status = status;
    }

    pub fn record_attempt(&mut self, provider: &str, attempt: u32) {
        self.active_provider = Some(provider.to_string());
        self.attempt = attempt;
    }

    /// `result` is set exactly when the status is a success terminal.
    pub fn mark_succeeded(&mut self, status: SessionStatus, result: StoredAsset) {
        self.status = status;
        self.result = Some(result);
        self.error = None;
    }

    pub fn mark_failed(&mut self, failure: UploadFailure) {
        self.status = SessionStatus::Failed;
        self.result = None;
        self.error = Some(failure);
    }

    pub fn mark_cancelled(&mut self) {
        self.status = SessionStatus::Cancelled;
        self.result = None;
        self.error = None;
    }
}

/// One entry of the per-session status stream consumed by the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub session_id: String,
    pub context_key: ContextKey,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<StoredAsset>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<UploadFailure>,
}

impl StatusUpdate {
    pub fn stage(session: &UploadSession) -> Self {
        Self {
            session_id: session.id.clone(),
            context_key: session.context_key.clone(),
            status: session.status,
            progress: None,
            result: session.result.clone(),
            error: session.error.clone(),
        }
    }
}
