use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::errors::{AttemptRecord, TransferError, UploadError, UplinkResult};
use crate::uploader::api::ProviderTarget;
use crate::uploader::transfer::{ProgressCallback, Transfer, TransferJob, TransferReceipt};

/// Which provider finally took the bytes, and the full attempt trail
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub provider: ProviderTarget,
    pub receipt: TransferReceipt,
    pub history: Vec<AttemptRecord>,
    pub duration_ms: u64,
}

/// Drives the provider chain: per-provider bounded retries with capped
/// exponential backoff, then immediate advance to the next target. The
/// attempt counter and backoff schedule restart per provider; there is no
/// delay on the provider switch itself.
pub async fn run_with_fallback(
    transfer: &dyn Transfer,
    job: &TransferJob,
    chain: &[ProviderTarget],
    policy: &RetryPolicy,
    progress: ProgressCallback,
    mut on_attempt: impl FnMut(&ProviderTarget, u32),
    cancel: &CancellationToken,
) -> UplinkResult<TransferOutcome> {
    let started = Instant::now();
    let mut history: Vec<AttemptRecord> = Vec::new();
    let mut last_error: Option<TransferError> = None;

    for target in chain {
        for attempt in 1..=policy.max_attempts_per_provider {
            if cancel.is_cancelled() {
                return Err(UploadError::cancelled("transfer", &job.session_id));
            }

            on_attempt(target, attempt);

            match transfer
                .transfer(job, target, progress.clone(), cancel)
                .await
            {
                Ok(receipt) => {
                    history.push(AttemptRecord {
                        provider: target.id.clone(),
                        attempt,
                        error: None,
                    });
                    log::info!(
                        "Transfer for session {} landed on provider {} (attempt {}, {} total attempts)",
                        job.session_id,
                        target.id,
                        attempt,
                        history.len()
                    );
                    return Ok(TransferOutcome {
                        provider: target.clone(),
                        receipt,
                        history,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Err(TransferError::Cancelled) => {
                    return Err(UploadError::cancelled("transfer", &job.session_id));
                }
                Err(error) => {
                    log::warn!(
                        "Transfer attempt {} of {} on provider {} failed for session {}: {}",
                        attempt,
                        policy.max_attempts_per_provider,
                        target.id,
                        job.session_id,
                        error
                    );
                    history.push(AttemptRecord {
                        provider: target.id.clone(),
                        attempt,
                        error: Some(error.to_string()),
                    });
                    last_error = Some(error);
                }
            }

            if attempt < policy.max_attempts_per_provider {
                let delay = policy.backoff_delay(attempt);
                log::debug!(
                    "Backing off {:?} before retrying provider {}",
                    delay,
                    target.id
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(UploadError::cancelled("transfer backoff", &job.session_id));
                    }
                    _ = sleep(delay) => {}
                }
            }
        }

        log::warn!(
            "Provider {} exhausted after {} attempts for session {}",
            target.id,
            policy.max_attempts_per_provider,
            job.session_id
        );
    }

    let last = last_error
        .unwrap_or_else(|| TransferError::Network("no transfer attempts executed".to_string()));
    Err(UploadError::AllProvidersFailed { last, history })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::uploader::api::ProviderKind;
    use crate::uploader::session::AssetFile;

    /// Fails each provider a scripted number of times before succeeding;
    /// `u32::MAX` means never succeed.
    struct ScriptedTransfer {
        remaining_failures: Mutex<HashMap<String, u32>>,
        calls: Mutex<Vec<String>>,
        cancel_after_first_call: Option<CancellationToken>,
    }

    impl ScriptedTransfer {
        fn new(script: &[(&str, u32)]) -> Self {
            Self {
                remaining_failures: Mutex::new(
                    script
                        .iter()
                        .map(|(id, n)| (id.to_string(), *n))
                        .collect(),
                ),
                calls: Mutex::new(Vec::new()),
                cancel_after_first_call: None,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transfer for ScriptedTransfer {
        async fn transfer(
            &self,
            job: &TransferJob,
            target: &ProviderTarget,
            _progress: ProgressCallback,
            _cancel: &CancellationToken,
        ) -> Result<TransferReceipt, TransferError> {
            self.calls.lock().unwrap().push(target.id.clone());

            if let Some(token) = &self.cancel_after_first_call {
                token.cancel();
            }

            let mut script = self.remaining_failures.lock().unwrap();
            let remaining = script.entry(target.id.clone()).or_insert(0);
            if *remaining == 0 {
                Ok(TransferReceipt {
                    bytes_sent: job.file.descriptor.byte_size,
                    provider_url: format!("https://{}.example/{}", target.id, job.session_id),
                })
            } else {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                Err(TransferError::Network("connection reset".to_string()))
            }
        }
    }

    fn job() -> TransferJob {
        TransferJob {
            session_id: "s-1".to_string(),
            context_key: "p1:front".into(),
            file: AssetFile::from_bytes("art.png", vec![9u8; 64], None),
        }
    }

    fn target(id: &str) -> ProviderTarget {
        ProviderTarget {
            id: id.to_string(),
            kind: ProviderKind::DirectAuthenticatedWrite,
            endpoint: format!("https://{}.example/put", id),
            auth_headers: HashMap::new(),
            public_url_template: None,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts_per_provider: 3,
            base_delay_ms: 10,
            max_delay_ms: 50,
        }
    }

    fn no_progress() -> ProgressCallback {
        Arc::new(|_| {})
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_on_same_provider_within_budget() {
        let transfer = ScriptedTransfer::new(&[("cdn-primary", 2)]);
        let outcome = run_with_fallback(
            &transfer,
            &job(),
            &[target("cdn-primary"), target("local")],
            &policy(),
            no_progress(),
            |_, _| {},
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.provider.id, "cdn-primary");
        assert_eq!(transfer.call_count(), 3);
        assert_eq!(outcome.history.len(), 3);
        assert!(outcome.history[0].error.is_some());
        assert!(outcome.history[1].error.is_some());
        assert!(outcome.history[2].error.is_none());
        assert_eq!(outcome.history[2].attempt, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_provider_hands_over_immediately() {
        let transfer = ScriptedTransfer::new(&[("cdn-primary", u32::MAX)]);
        let started = Instant::now();
        let outcome = run_with_fallback(
            &transfer,
            &job(),
            &[target("cdn-primary"), target("local")],
            &policy(),
            no_progress(),
            |_, _| {},
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.provider.id, "local");
        assert_eq!(
            *transfer.calls.lock().unwrap(),
            vec!["cdn-primary", "cdn-primary", "cdn-primary", "local"]
        );
        assert_eq!(outcome.history.len(), 4);
        // Two backoffs inside the first provider (10ms + 20ms) and nothing
        // on the provider switch.
        assert_eq!(started.elapsed(), Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn full_exhaustion_reports_every_attempt() {
        let transfer = ScriptedTransfer::new(&[("cdn-primary", u32::MAX), ("local", u32::MAX)]);
        let result = run_with_fallback(
            &transfer,
            &job(),
            &[target("cdn-primary"), target("local")],
            &policy(),
            no_progress(),
            |_, _| {},
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(transfer.call_count(), 6);
        match result {
            Err(UploadError::AllProvidersFailed { last, history }) => {
                assert_eq!(history.len(), 6);
                assert!(history.iter().all(|record| record.error.is_some()));
                assert_eq!(last, TransferError::Network("connection reset".to_string()));
            }
            other => panic!("expected AllProvidersFailed, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_hook_sees_every_attempt_in_order() {
        let transfer = ScriptedTransfer::new(&[("cdn-primary", u32::MAX)]);
        let mut seen: Vec<(String, u32)> = Vec::new();
        let _ = run_with_fallback(
            &transfer,
            &job(),
            &[target("cdn-primary"), target("local")],
            &policy(),
            no_progress(),
            |provider, attempt| seen.push((provider.id.clone(), attempt)),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(
            seen,
            vec![
                ("cdn-primary".to_string(), 1),
                ("cdn-primary".to_string(), 2),
                ("cdn-primary".to_string(), 3),
                ("local".to_string(), 1),
            ]
        );
    }

    #[tokio::test]
    async fn pre_cancelled_token_makes_no_attempts() {
        let transfer = ScriptedTransfer::new(&[]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = run_with_fallback(
            &transfer,
            &job(),
            &[target("cdn-primary")],
            &policy(),
            no_progress(),
            |_, _| {},
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(UploadError::Cancelled { .. })));
        assert_eq!(transfer.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_stops_retrying() {
        let cancel = CancellationToken::new();
        let mut transfer = ScriptedTransfer::new(&[("cdn-primary", u32::MAX)]);
        transfer.cancel_after_first_call = Some(cancel.clone());

        let result = run_with_fallback(
            &transfer,
            &job(),
            &[target("cdn-primary"), target("local")],
            &policy(),
            no_progress(),
            |_, _| {},
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(UploadError::Cancelled { .. })));
        assert_eq!(transfer.call_count(), 1);
    }
}
