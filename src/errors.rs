use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::validation::Violation;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Local validation failed: {}", violation_summary(.violations))]
    Validation { violations: Vec<Violation> },

    #[error("Upload intent rejected: {reason}")]
    IntentRejected { status: Option<u16>, reason: String },

    #[error("All upload providers failed after {} attempts: {last}", .history.len())]
    AllProvidersFailed {
        last: TransferError,
        history: Vec<AttemptRecord>,
    },

    #[error("Completion notification failed after {attempts} attempts: {reason}")]
    Completion { attempts: u32, reason: String },

    #[error("Processing still pending after {attempts} status checks ({waited_ms}ms)")]
    ProcessingTimeout { attempts: u32, waited_ms: u64 },

    #[error("Server-side processing failed: {reason}")]
    ProcessingFailed { reason: String },

    #[error("Upload cancelled during {phase} for session {session_id}")]
    Cancelled { phase: String, session_id: String },

    #[error("Server returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

fn violation_summary(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|violation| violation.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Crate-wide result type
pub type UplinkResult<T> = Result<T, UploadError>;

/// Transfer failure classification used by the retry policy
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransferError {
    #[error("Network error during transfer: {0}")]
    Network(String),

    #[error("Transfer timed out: {0}")]
    Timeout(String),

    #[error("Provider rejected transfer with status {status}: {body}")]
    ServerRejected { status: u16, body: String },

    #[error("Transfer cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn from_request_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout(error.to_string())
        } else {
            Self::Network(error.to_string())
        }
    }

    /// Everything except an explicit cancel is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransferError::Cancelled)
    }
}

/// One entry of the transfer attempt history kept for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub provider: String,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Failure class reported to the embedding UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    Validation,
    IntentRejected,
    Transfer,
    Completion,
    ProcessingTimeout,
    ProcessingFailed,
    Cancelled,
    Network,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SuggestedAction {
    Retry,
    ChooseDifferentFile,
    RefreshSession,
    ContactSupport,
}

/// User-facing failure summary carried on terminal status updates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFailure {
    pub kind: FailureKind,
    pub message: String,
    pub recoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<SuggestedAction>,
}

/// Upload error helpers
impl UploadError {
    pub fn config(message: &str) -> Self {
        Self::Config(message.to_string())
    }

    pub fn intent_rejected(status: Option<u16>, reason: &str) -> Self {
        Self::IntentRejected {
            status,
            reason: reason.to_string(),
        }
    }

    pub fn completion_failed(attempts: u32, reason: &str) -> Self {
        Self::Completion {
            attempts,
            reason: reason.to_string(),
        }
    }

    pub fn processing_failed(reason: &str) -> Self {
        Self::ProcessingFailed {
            reason: reason.to_string(),
        }
    }

    pub fn cancelled(phase: &str, session_id: &str) -> Self {
        Self::Cancelled {
            phase: phase.to_string(),
            session_id: session_id.to_string(),
        }
    }

    pub fn api_status(status: u16, message: &str) -> Self {
        Self::Api {
            status,
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            UploadError::Validation { .. } => FailureKind::Validation,
            UploadError::IntentRejected { .. } => FailureKind::IntentRejected,
            UploadError::AllProvidersFailed { .. } => FailureKind::Transfer,
            UploadError::Completion { .. } => FailureKind::Completion,
            UploadError::ProcessingTimeout { .. } => FailureKind::ProcessingTimeout,
            UploadError::ProcessingFailed { .. } => FailureKind::ProcessingFailed,
            UploadError::Cancelled { .. } => FailureKind::Cancelled,
            UploadError::Network(_) | UploadError::Api { .. } => FailureKind::Network,
            UploadError::Config(_) | UploadError::Io(_) | UploadError::Json(_) => {
                FailureKind::Internal
            }
        }
    }

    /// Whether retrying the same file on a fresh session has a chance of working.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            UploadError::AllProvidersFailed { .. }
                | UploadError::Completion { .. }
                | UploadError::ProcessingTimeout { .. }
                | UploadError::Cancelled { .. }
                | UploadError::Network(_)
                | UploadError::Api { .. }
                | UploadError::Io(_)
        )
    }

    pub fn suggestion(&self) -> Option<SuggestedAction> {
        match self {
            UploadError::Validation { .. } | UploadError::ProcessingFailed { .. } => {
                Some(SuggestedAction::ChooseDifferentFile)
            }
            UploadError::IntentRejected { .. } => Some(SuggestedAction::RefreshSession),
            UploadError::AllProvidersFailed { .. }
            | UploadError::Completion { .. }
            | UploadError::ProcessingTimeout { .. }
            | UploadError::Network(_)
            | UploadError::Api { .. }
            | UploadError::Io(_) => Some(SuggestedAction::Retry),
            UploadError::Config(_) | UploadError::Json(_) => Some(SuggestedAction::ContactSupport),
            UploadError::Cancelled { .. } => None,
        }
    }

    pub fn failure(&self) -> UploadFailure {
        UploadFailure {
            kind: self.kind(),
            message: self.to_string(),
            recoverable: self.is_recoverable(),
            suggestion: self.suggestion(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_never_retryable() {
        assert!(!TransferError::Cancelled.is_retryable());
        assert!(TransferError::Network("connection reset".to_string()).is_retryable());
        assert!(TransferError::Timeout("deadline exceeded".to_string()).is_retryable());
        assert!(TransferError::ServerRejected {
            status: 503,
            body: "overloaded".to_string(),
        }
        .is_retryable());
    }

    #[test]
    fn processing_timeout_is_recoverable_but_failure_is_not() {
        let timeout = UploadError::ProcessingTimeout {
            attempts: 60,
            waited_ms: 60_000,
        };
        assert!(timeout.is_recoverable());
        assert_eq!(timeout.kind(), FailureKind::ProcessingTimeout);
        assert_eq!(timeout.suggestion(), Some(SuggestedAction::Retry));

        let failed = UploadError::processing_failed("corrupt vector paths");
        assert!(!failed.is_recoverable());
        assert_eq!(failed.kind(), FailureKind::ProcessingFailed);
        assert_eq!(
            failed.suggestion(),
            Some(SuggestedAction::ChooseDifferentFile)
        );
    }

    #[test]
    fn failure_summary_carries_classification() {
        let error = UploadError::AllProvidersFailed {
            last: TransferError::ServerRejected {
                status: 500,
                body: "internal".to_string(),
            },
            history: vec![AttemptRecord {
                provider: "cdn-primary".to_string(),
                attempt: 1,
                error: Some("status 500".to_string()),
            }],
        };
        let failure = error.failure();
        assert_eq!(failure.kind, FailureKind::Transfer);
        assert!(failure.recoverable);
        assert_eq!(failure.suggestion, Some(SuggestedAction::Retry));
        assert!(failure.message.contains("after 1 attempts"));
    }

    #[test]
    fn failure_kind_serializes_camel_case() {
        let json = serde_json::to_string(&FailureKind::ProcessingTimeout).unwrap();
        assert_eq!(json, "\"processingTimeout\"");
        let json = serde_json::to_string(&SuggestedAction::ChooseDifferentFile).unwrap();
        assert_eq!(json, "\"chooseDifferentFile\"");
    }
}
