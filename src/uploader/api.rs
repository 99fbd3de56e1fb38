use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::config::{ApiSettings, RetryPolicy, TransferSettings};
use crate::errors::{UploadError, UplinkResult};
use crate::uploader::session::{ContextKey, FileDescriptor, StoredAsset};

/// Body of the intent call that opens a session server-side
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentRequest {
    pub session_id: String,
    pub context_key: ContextKey,
    pub file: FileDescriptor,
    /// Opaque product/placement context resolved by the storefront
    pub product_context: serde_json::Value,
}

/// Server's answer to an accepted intent: an ordered provider chain and an
/// optional retry policy override.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiatedPlan {
    pub targets: Vec<ProviderTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderTarget {
    pub id: String,
    pub kind: ProviderKind,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub auth_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url_template: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "direct-authenticated-write")]
    DirectAuthenticatedWrite,
    #[serde(rename = "multipart-post")]
    MultipartPost,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::DirectAuthenticatedWrite => "direct-authenticated-write",
            ProviderKind::MultipartPost => "multipart-post",
        }
    }
}

/// Completion notification. `provider` must name the target that actually
/// received the bytes, which after fallback is not the first in the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    pub session_id: String,
    pub provider: String,
    pub url: String,
    pub bytes_sent: u64,
    pub transfer_duration_ms: u64,
}

/// Server-side processing lifecycle as reported by the status endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessingState {
    Uploaded,
    Processing,
    Ready,
    NeedsReview,
    Blocked,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingReport {
    pub status: ProcessingState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StoredAsset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Coordination calls against the storefront server. A trait so tests can
/// script server behavior without a network.
#[async_trait]
pub trait ServerApi: Send + Sync {
    /// Opens the session. Called exactly once per session and never retried;
    /// both rejections and transport faults are final here.
    async fn negotiate(&self, request: &IntentRequest) -> UplinkResult<NegotiatedPlan>;

    /// Records the durable outcome. The server keys on the session id, so
    /// replaying this call is safe.
    async fn complete(&self, request: &CompletionRequest) -> UplinkResult<()>;

    /// One idempotent processing-status read.
    async fn poll_status(&self, session_id: &str) -> UplinkResult<ProcessingReport>;
}

/// Builds a reqwest header map from opaque string pairs.
pub(crate) fn header_map(headers: &HashMap<String, String>) -> UplinkResult<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| UploadError::config(&format!("invalid header name '{}': {}", name, e)))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| UploadError::config(&format!("invalid value for header '{}': {}", name, e)))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

/// HTTP implementation of [`ServerApi`]
pub struct HttpServerApi {
    client: Client,
    base: String,
}

impl HttpServerApi {
    pub fn new(settings: &ApiSettings, transfer: &TransferSettings) -> UplinkResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(transfer.connect_timeout_secs))
            .timeout(Duration::from_secs(60))
            .default_headers(header_map(&settings.default_headers)?)
            .build()?;

        Ok(Self {
            client,
            base: settings.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ServerApi for HttpServerApi {
    async fn negotiate(&self, request: &IntentRequest) -> UplinkResult<NegotiatedPlan> {
        let url = format!("{}/uploads/intents", self.base);
        log::debug!(
            "Negotiating intent for session {} ({} bytes)",
            request.session_id,
            request.file.byte_size
        );

        let response = self.client.post(&url).json(request).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(UploadError::intent_rejected(Some(status.as_u16()), &body));
        }

        let body = response.text().await?;
        let plan: NegotiatedPlan = serde_json::from_str(&body)?;

        if plan.targets.is_empty() {
            return Err(UploadError::intent_rejected(
                None,
                "server offered no upload providers",
            ));
        }

        Ok(plan)
    }

    async fn complete(&self, request: &CompletionRequest) -> UplinkResult<()> {
        let url = format!("{}/uploads/{}/complete", self.base, request.session_id);

        let response = self.client.post(&url).json(request).send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(UploadError::api_status(status.as_u16(), &body))
    }

    async fn poll_status(&self, session_id: &str) -> UplinkResult<ProcessingReport> {
        let url = format!("{}/uploads/{}/status", self.base, session_id);

        let response = self.client.get(&url).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(UploadError::api_status(status.as_u16(), &body));
        }

        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

const COMPLETION_ATTEMPTS: u32 = 3;
const COMPLETION_BASE_DELAY: Duration = Duration::from_millis(500);

/// Sends the completion notification with a short retry budget. The call is
/// idempotent so every failure class gets replayed within the budget.
pub async fn complete_with_retry(
    api: &dyn ServerApi,
    request: &CompletionRequest,
    cancel: &CancellationToken,
) -> UplinkResult<()> {
    let mut last_reason = String::new();

    for attempt in 1..=COMPLETION_ATTEMPTS {
        if cancel.is_cancelled() {
            return Err(UploadError::cancelled("completion", &request.session_id));
        }

        match api.complete(request).await {
            Ok(()) => {
                if attempt > 1 {
                    log::info!(
                        "Completion for session {} succeeded on attempt {}",
                        request.session_id,
                        attempt
                    );
                }
                return Ok(());
            }
            Err(e) => {
                last_reason = e.to_string();
                log::warn!(
                    "Completion attempt {} of {} failed for session {}: {}",
                    attempt,
                    COMPLETION_ATTEMPTS,
                    request.session_id,
                    e
                );
            }
        }

        if attempt < COMPLETION_ATTEMPTS {
            let delay = COMPLETION_BASE_DELAY * 2u32.pow(attempt - 1);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(UploadError::cancelled("completion", &request.session_id));
                }
                _ = sleep(delay) => {}
            }
        }
    }

    Err(UploadError::completion_failed(
        COMPLETION_ATTEMPTS,
        &last_reason,
    ))
}
