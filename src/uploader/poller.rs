use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::{PollPolicy, QualityRules};
use crate::errors::{UploadError, UplinkResult};
use crate::uploader::api::{ProcessingState, ServerApi};
use crate::uploader::session::{AssetMetadata, QualityWarning, SessionStatus, StoredAsset};

/// Polls the status endpoint until the server reports a terminal processing
/// state or the attempt budget runs out. Each poll is one idempotent read;
/// transient poll failures consume an attempt and polling continues. Running
/// out of attempts is a timeout, which is not the same as the server saying
/// processing failed: the asset may still land later, and the caller decides
/// what to do with the session.
pub async fn poll_until_terminal(
    api: &dyn ServerApi,
    session_id: &str,
    policy: &PollPolicy,
    quality: &QualityRules,
    fallback_url: &str,
    cancel: &CancellationToken,
) -> UplinkResult<(SessionStatus, StoredAsset)> {
    let started = Instant::now();

    for attempt in 1..=policy.max_attempts {
        if cancel.is_cancelled() {
            return Err(UploadError::cancelled("processing", session_id));
        }

        match api.poll_status(session_id).await {
            Ok(report) => match report.status {
                ProcessingState::Uploaded | ProcessingState::Processing => {
                    log::debug!(
                        "Session {} still {:?} after poll {}/{}",
                        session_id,
                        report.status,
                        attempt,
                        policy.max_attempts
                    );
                }
                ProcessingState::Ready
                | ProcessingState::NeedsReview
                | ProcessingState::Blocked => {
                    let status = match report.status {
                        ProcessingState::Ready => SessionStatus::Ready,
                        ProcessingState::NeedsReview => SessionStatus::NeedsReview,
                        _ => SessionStatus::Blocked,
                    };

                    let mut asset = match report.result {
                        Some(asset) => asset,
                        None => {
                            log::warn!(
                                "Session {} reached {} without a result body, using transfer URL",
                                session_id,
                                status
                            );
                            StoredAsset {
                                stored_url: fallback_url.to_string(),
                                preview_url: None,
                                metadata: AssetMetadata::default(),
                                quality_warnings: Vec::new(),
                            }
                        }
                    };

                    if let Some(message) = report.error {
                        asset.quality_warnings.push(QualityWarning::Server { message });
                    }

                    let (status, asset) = apply_quality_rules(status, asset, quality);
                    log::info!(
                        "Session {} processing finished as {} after {} polls",
                        session_id,
                        status,
                        attempt
                    );
                    return Ok((status, asset));
                }
                ProcessingState::Failed => {
                    let reason = report
                        .error
                        .unwrap_or_else(|| "processing failed without detail".to_string());
                    return Err(UploadError::processing_failed(&reason));
                }
            },
            Err(e) => {
                log::warn!(
                    "Status poll {}/{} for session {} failed: {}",
                    attempt,
                    policy.max_attempts,
                    session_id,
                    e
                );
            }
        }

        if attempt < policy.max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(UploadError::cancelled("processing", session_id));
                }
                _ = sleep(policy.interval()) => {}
            }
        }
    }

    Err(UploadError::ProcessingTimeout {
        attempts: policy.max_attempts,
        waited_ms: started.elapsed().as_millis() as u64,
    })
}

/// Applies local quality rules on top of whatever the server reported.
/// A `ready` asset under the DPI floor is downgraded to `needsReview`.
fn apply_quality_rules(
    status: SessionStatus,
    mut asset: StoredAsset,
    quality: &QualityRules,
) -> (SessionStatus, StoredAsset) {
    if let (Some(min_dpi), Some(dpi)) = (quality.min_dpi, asset.metadata.dpi) {
        if dpi < min_dpi {
            asset
                .quality_warnings
                .push(QualityWarning::LowResolution { dpi, min_dpi });
            if status == SessionStatus::Ready {
                log::info!(
                    "Asset dpi {} below minimum {}, downgrading ready to needsReview",
                    dpi,
                    min_dpi
                );
                return (SessionStatus::NeedsReview, asset);
            }
        }
    }
    (status, asset)
}
