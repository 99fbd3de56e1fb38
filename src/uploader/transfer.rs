use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, Stream};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::TransferSettings;
use crate::errors::{TransferError, UplinkResult};
use crate::uploader::api::{header_map, ProviderKind, ProviderTarget};
use crate::uploader::session::{AssetFile, ContextKey};
use crate::validation::sanitize_filename;

/// Everything a transport needs to move one payload
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub session_id: String,
    pub context_key: ContextKey,
    pub file: AssetFile,
}

/// Proof of a completed transfer attempt
#[derive(Debug, Clone, PartialEq)]
pub struct TransferReceipt {
    pub bytes_sent: u64,
    pub provider_url: String,
}

/// Raw byte counters reported at chunk boundaries
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    pub loaded: u64,
    pub total: u64,
    pub elapsed: Duration,
}

/// Shared so the request body can keep reporting after the caller moves on.
/// Never invoked again once the transfer call has returned.
pub type ProgressCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// A transport that can move one payload to one provider target
#[async_trait]
pub trait Transfer: Send + Sync {
    async fn transfer(
        &self,
        job: &TransferJob,
        target: &ProviderTarget,
        progress: ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<TransferReceipt, TransferError>;
}

/// reqwest-backed implementation of both provider kinds
pub struct HttpTransfer {
    client: Client,
    chunk_size: usize,
}

impl HttpTransfer {
    pub fn new(settings: &TransferSettings) -> UplinkResult<Self> {
        let mut builder =
            Client::builder().connect_timeout(Duration::from_secs(settings.connect_timeout_secs));
        if let Some(secs) = settings.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        Ok(Self {
            client: builder.build()?,
            chunk_size: settings.chunk_size_bytes.max(1),
        })
    }

    fn progress_body(&self, content: Bytes, progress: ProgressCallback) -> Body {
        Body::wrap_stream(chunk_stream(content, self.chunk_size, progress))
    }

    /// Single authenticated PUT carrying the payload as a streaming body.
    async fn direct_write(
        &self,
        job: &TransferJob,
        target: &ProviderTarget,
        progress: ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<TransferReceipt, TransferError> {
        let headers =
            header_map(&target.auth_headers).map_err(|e| TransferError::Network(e.to_string()))?;
        let total = job.file.descriptor.byte_size;
        let mime = content_type(&job.file);
        let body = self.progress_body(job.file.content.clone(), progress);

        let request = self
            .client
            .put(&target.endpoint)
            .headers(headers)
            .header(CONTENT_TYPE, mime)
            .header(CONTENT_LENGTH, total)
            .body(body);

        let response = self.send_guarded(request, cancel).await?;
        let status = response.status();

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(TransferError::ServerRejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(TransferReceipt {
            bytes_sent: total,
            provider_url: render_public_url(target, job),
        })
    }

    /// Multipart POST for providers without direct write access, typically
    /// the storefront's own fallback endpoint.
    async fn multipart_post(
        &self,
        job: &TransferJob,
        target: &ProviderTarget,
        progress: ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<TransferReceipt, TransferError> {
        let headers =
            header_map(&target.auth_headers).map_err(|e| TransferError::Network(e.to_string()))?;
        let total = job.file.descriptor.byte_size;
        let body = self.progress_body(job.file.content.clone(), progress);

        let part = Part::stream_with_length(body, total)
            .file_name(sanitize_filename(&job.file.descriptor.name))
            .mime_str(&content_type(&job.file))
            .map_err(|e| TransferError::Network(e.to_string()))?;

        let form = Form::new()
            .text("sessionId", job.session_id.clone())
            .text("contextKey", job.context_key.to_string())
            .part("file", part);

        let request = self
            .client
            .post(&target.endpoint)
            .headers(headers)
            .multipart(form);

        let response = self.send_guarded(request, cancel).await?;
        let status = response.status();

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(TransferError::ServerRejected {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await.unwrap_or_default();
        Ok(TransferReceipt {
            bytes_sent: total,
            provider_url: response_url(&body, target, job),
        })
    }

    /// Runs the request against the cancellation token; dropping the send
    /// future aborts the in-flight I/O.
    async fn send_guarded(
        &self,
        request: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            result = request.send() => result.map_err(|e| TransferError::from_request_error(&e)),
        }
    }
}

#[async_trait]
impl Transfer for HttpTransfer {
    async fn transfer(
        &self,
        job: &TransferJob,
        target: &ProviderTarget,
        progress: ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<TransferReceipt, TransferError> {
        log::debug!(
            "Transferring {} bytes to provider {} ({})",
            job.file.descriptor.byte_size,
            target.id,
            target.kind.as_str()
        );

        match target.kind {
            ProviderKind::DirectAuthenticatedWrite => {
                self.direct_write(job, target, progress, cancel).await
            }
            ProviderKind::MultipartPost => self.multipart_post(job, target, progress, cancel).await,
        }
    }
}

/// Lazily slices the payload so the callback fires as the wire consumes
/// chunks, not when the request is built.
fn chunk_stream(
    content: Bytes,
    chunk_size: usize,
    progress: ProgressCallback,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    let total = content.len() as u64;
    let chunk_count = content.len().div_ceil(chunk_size);
    let started = Instant::now();
    let mut loaded: u64 = 0;

    stream::iter((0..chunk_count).map(move |index| {
        let start = index * chunk_size;
        let end = ((index + 1) * chunk_size).min(content.len());
        let chunk = content.slice(start..end);

        loaded += chunk.len() as u64;
        progress(TransferProgress {
            loaded,
            total,
            elapsed: started.elapsed(),
        });

        Ok(chunk)
    }))
}

fn content_type(file: &AssetFile) -> String {
    file.descriptor
        .declared_mime
        .clone()
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

/// Public URL for a direct write, rendered from the provider's template.
fn render_public_url(target: &ProviderTarget, job: &TransferJob) -> String {
    let template = target
        .public_url_template
        .as_deref()
        .unwrap_or(&target.endpoint);
    let file_name = sanitize_filename(&job.file.descriptor.name).replace(' ', "_");

    template
        .replace("{sessionId}", &job.session_id)
        .replace("{fileName}", &file_name)
}

/// Multipart providers answer with the stored URL in the response body;
/// fall back to the template when they don't.
fn response_url(body: &str, target: &ProviderTarget, job: &TransferJob) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("url")
                .and_then(|url| url.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| {
            log::debug!(
                "Provider {} response carried no url field, using template",
                target.id
            );
            render_public_url(target, job)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn job() -> TransferJob {
        TransferJob {
            session_id: "s-42".to_string(),
            context_key: "p1:front".into(),
            file: AssetFile::from_bytes("my poster.png", vec![7u8; 10], None),
        }
    }

    fn target(template: Option<&str>) -> ProviderTarget {
        ProviderTarget {
            id: "cdn-primary".to_string(),
            kind: ProviderKind::DirectAuthenticatedWrite,
            endpoint: "https://cdn.example/put".to_string(),
            auth_headers: HashMap::new(),
            public_url_template: template.map(String::from),
        }
    }

    #[tokio::test]
    async fn chunk_stream_reports_each_boundary() {
        let reports: Arc<Mutex<Vec<TransferProgress>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        let callback: ProgressCallback = Arc::new(move |p| sink.lock().unwrap().push(p));

        let chunks: Vec<_> = chunk_stream(Bytes::from(vec![1u8; 10]), 4, callback)
            .collect()
            .await;

        assert_eq!(chunks.len(), 3); // 4 + 4 + 2
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].loaded, 4);
        assert_eq!(reports[1].loaded, 8);
        assert_eq!(reports[2].loaded, 10);
        assert!(reports.iter().all(|r| r.total == 10));
    }

    #[tokio::test]
    async fn chunk_stream_handles_single_chunk_payloads() {
        let count = Arc::new(Mutex::new(0u32));
        let sink = count.clone();
        let callback: ProgressCallback = Arc::new(move |_| *sink.lock().unwrap() += 1);

        let chunks: Vec<_> = chunk_stream(Bytes::from(vec![1u8; 3]), 1024, callback)
            .collect()
            .await;

        assert_eq!(chunks.len(), 1);
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn public_url_rendering_fills_placeholders() {
        let url = render_public_url(
            &target(Some("https://cdn.example/assets/{sessionId}/{fileName}")),
            &job(),
        );
        assert_eq!(url, "https://cdn.example/assets/s-42/my_poster.png");
    }

    #[test]
    fn missing_template_falls_back_to_endpoint() {
        let url = render_public_url(&target(None), &job());
        assert_eq!(url, "https://cdn.example/put");
    }

    #[test]
    fn response_url_prefers_server_answer() {
        let url = response_url(
            "{\"url\":\"https://shop.example/uploads/final.png\"}",
            &target(Some("https://cdn.example/{sessionId}")),
            &job(),
        );
        assert_eq!(url, "https://shop.example/uploads/final.png");

        let url = response_url(
            "not json",
            &target(Some("https://cdn.example/{sessionId}")),
            &job(),
        );
        assert_eq!(url, "https://cdn.example/s-42");
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_send() {
        let transfer = HttpTransfer::new(&TransferSettings::default()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let callback: ProgressCallback = Arc::new(|_| {});
        let result = transfer
            .transfer(&job(), &target(None), callback, &cancel)
            .await;
        assert_eq!(result, Err(TransferError::Cancelled));
    }
}
