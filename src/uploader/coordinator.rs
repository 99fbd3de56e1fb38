use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::UploaderConfig;
use crate::errors::{UploadError, UplinkResult};
use crate::uploader::api::{
    complete_with_retry, CompletionRequest, HttpServerApi, IntentRequest, ServerApi,
};
use crate::uploader::orchestrator::run_with_fallback;
use crate::uploader::poller::poll_until_terminal;
use crate::uploader::progress;
use crate::uploader::session::{
    AssetFile, ContextKey, FileDescriptor, SessionStatus, StatusUpdate, UploadSession,
};
use crate::uploader::transfer::{
    HttpTransfer, ProgressCallback, Transfer, TransferJob, TransferProgress,
};
use crate::validation::{self, LocalCheck};

/// Ceiling on progress emission frequency; the final chunk always reports.
const PROGRESS_EMIT_INTERVAL: Duration = Duration::from_millis(100);

/// Input to [`UploadCoordinator::start`]
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file: AssetFile,
    pub context_key: ContextKey,
    /// Opaque product/placement context forwarded to the intent call
    pub product_context: serde_json::Value,
}

impl UploadRequest {
    pub fn new(file: AssetFile, context_key: impl Into<ContextKey>) -> Self {
        Self {
            file,
            context_key: context_key.into(),
            product_context: serde_json::Value::Null,
        }
    }

    pub fn with_product_context(mut self, context: serde_json::Value) -> Self {
        self.product_context = context;
        self
    }
}

/// Live session handle: the id for cancel calls plus the status stream
pub struct UploadHandle {
    pub session_id: String,
    pub updates: UnboundedReceiver<StatusUpdate>,
}

/// Per-session update channel. Once a terminal update has gone out every
/// further emission is dropped, which is what guarantees a cancelled session
/// never reports progress or a later stage.
struct Emitter {
    inner: Mutex<EmitterInner>,
}

struct EmitterInner {
    tx: UnboundedSender<StatusUpdate>,
    closed: bool,
}

impl Emitter {
    fn new() -> (Arc<Self>, UnboundedReceiver<StatusUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                inner: Mutex::new(EmitterInner { tx, closed: false }),
            }),
            rx,
        )
    }

    fn emit(&self, update: StatusUpdate) {
        match self.inner.lock() {
            Ok(mut inner) => {
                if inner.closed {
                    return;
                }
                if update.status.is_terminal() {
                    inner.closed = true;
                }
                if inner.tx.send(update).is_err() {
                    log::debug!("Status receiver dropped, update discarded");
                }
            }
            Err(e) => {
                log::error!("Failed to acquire emitter lock (non-critical): {}", e);
            }
        }
    }
}

struct ActiveSession {
    session_id: String,
    context_key: ContextKey,
    cancel: CancellationToken,
    emitter: Arc<Emitter>,
}

type Registry = Arc<Mutex<HashMap<ContextKey, ActiveSession>>>;

fn with_registry<F, R>(registry: &Registry, operation: &str, f: F) -> Option<R>
where
    F: FnOnce(&mut HashMap<ContextKey, ActiveSession>) -> R,
{
    match registry.lock() {
        Ok(mut map) => Some(f(&mut map)),
        Err(e) => {
            log::error!(
                "Failed to acquire session registry for {} (non-critical): {}",
                operation,
                e
            );
            None
        }
    }
}

fn cancelled_update(entry: &ActiveSession) -> StatusUpdate {
    StatusUpdate {
        session_id: entry.session_id.clone(),
        context_key: entry.context_key.clone(),
        status: SessionStatus::Cancelled,
        progress: None,
        result: None,
        error: None,
    }
}

/// Public entry point: owns the context-key registry and spawns one driver
/// task per session.
#[derive(Clone)]
pub struct UploadCoordinator {
    api: Arc<dyn ServerApi>,
    transfer: Arc<dyn Transfer>,
    config: Arc<UploaderConfig>,
    active: Registry,
}

impl UploadCoordinator {
    /// Validates the configuration and wires the HTTP implementations.
    pub fn new(config: UploaderConfig) -> UplinkResult<Self> {
        config.validate()?;
        let api = Arc::new(HttpServerApi::new(&config.api, &config.transfer)?);
        let transfer = Arc::new(HttpTransfer::new(&config.transfer)?);
        Ok(Self::with_components(config, api, transfer))
    }

    /// Wires pre-built components; tests use this to script server behavior.
    pub fn with_components(
        config: UploaderConfig,
        api: Arc<dyn ServerApi>,
        transfer: Arc<dyn Transfer>,
    ) -> Self {
        Self {
            api,
            transfer,
            config: Arc::new(config),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts an upload for the context key, superseding any session already
    /// active on it. Local validation failures surface synchronously; no
    /// session is created and nothing touches the network.
    pub fn start(&self, request: UploadRequest) -> UplinkResult<UploadHandle> {
        validation::ensure_valid(&request.file.descriptor, &self.config.limits)?;

        let session =
            UploadSession::new(request.context_key.clone(), request.file.descriptor.clone());
        let session_id = session.id.clone();
        let (emitter, updates) = Emitter::new();
        let cancel = CancellationToken::new();

        let entry = ActiveSession {
            session_id: session_id.clone(),
            context_key: request.context_key.clone(),
            cancel: cancel.clone(),
            emitter: emitter.clone(),
        };

        let superseded = match with_registry(&self.active, "session insert", |map| {
            map.insert(request.context_key.clone(), entry)
        }) {
            Some(previous) => previous,
            None => return Err(UploadError::config("session registry unavailable")),
        };

        if let Some(previous) = superseded {
            log::info!(
                "Superseding session {} on context {} with {}",
                previous.session_id,
                request.context_key,
                session_id
            );
            previous.cancel.cancel();
            previous.emitter.emit(cancelled_update(&previous));
        }

        log::info!(
            "Starting upload session {} for context {} ({} bytes)",
            session_id,
            request.context_key,
            request.file.descriptor.byte_size
        );

        let driver = SessionDriver {
            api: self.api.clone(),
            transfer: self.transfer.clone(),
            config: self.config.clone(),
            registry: self.active.clone(),
            emitter,
            cancel,
        };
        tokio::spawn(driver.run(session, request.file, request.product_context));

        Ok(UploadHandle {
            session_id,
            updates,
        })
    }

    /// Cancels a session by id; returns whether a matching active session
    /// existed. The terminal `cancelled` update is emitted before this
    /// returns and nothing further is delivered for the session.
    pub fn cancel(&self, session_id: &str) -> bool {
        let entry = with_registry(&self.active, "cancel", |map| {
            let key = map
                .iter()
                .find(|(_, entry)| entry.session_id == session_id)
                .map(|(key, _)| key.clone());
            key.and_then(|key| map.remove(&key))
        })
        .flatten();

        match entry {
            Some(entry) => {
                log::info!(
                    "Cancelling session {} on context {}",
                    entry.session_id,
                    entry.context_key
                );
                entry.cancel.cancel();
                entry.emitter.emit(cancelled_update(&entry));
                true
            }
            None => {
                log::debug!("Cancel requested for unknown session {}", session_id);
                false
            }
        }
    }

    /// Local pre-checks only; never touches the network.
    pub fn validate_local(&self, descriptor: &FileDescriptor) -> LocalCheck {
        validation::validate_local(descriptor, &self.config.limits)
    }

    /// Session currently occupying the context key, if any.
    pub fn active_session_id(&self, context_key: &ContextKey) -> Option<String> {
        with_registry(&self.active, "lookup", |map| {
            map.get(context_key).map(|entry| entry.session_id.clone())
        })
        .flatten()
    }
}

/// Progress relay shared with the transfer body. Holds the provider/attempt
/// annotation and throttles the unbounded chunk callbacks down to a steady
/// emission rate.
struct ProgressMeter {
    emitter: Arc<Emitter>,
    session_id: String,
    context_key: ContextKey,
    state: Mutex<MeterState>,
}

struct MeterState {
    provider: String,
    attempt: u32,
    last_emit: Option<Instant>,
}

impl ProgressMeter {
    fn new(emitter: Arc<Emitter>, session_id: String, context_key: ContextKey) -> Self {
        Self {
            emitter,
            session_id,
            context_key,
            state: Mutex::new(MeterState {
                provider: String::new(),
                attempt: 0,
                last_emit: None,
            }),
        }
    }

    fn set_attempt(&self, provider: &str, attempt: u32) {
        match self.state.lock() {
            Ok(mut state) => {
                state.provider = provider.to_string();
                state.attempt = attempt;
                state.last_emit = None;
            }
            Err(e) => {
                log::error!("Failed to acquire progress meter lock (non-critical): {}", e);
            }
        }
    }

    fn observe(&self, raw: TransferProgress) {
        let snapshot = match self.state.lock() {
            Ok(mut state) => {
                let now = Instant::now();
                let final_chunk = raw.loaded >= raw.total;
                let due = final_chunk
                    || state
                        .last_emit
                        .map_or(true, |last| now.duration_since(last) >= PROGRESS_EMIT_INTERVAL);
                if !due {
                    return;
                }
                state.last_emit = Some(now);
                progress::snapshot(
                    raw.loaded,
                    raw.total,
                    raw.elapsed,
                    &state.provider,
                    state.attempt,
                )
            }
            Err(e) => {
                log::error!("Failed to acquire progress meter lock (non-critical): {}", e);
                return;
            }
        };

        self.emitter.emit(StatusUpdate {
            session_id: self.session_id.clone(),
            context_key: self.context_key.clone(),
            status: SessionStatus::Transferring,
            progress: Some(snapshot),
            result: None,
            error: None,
        });
    }
}

/// Drives one session from intent to terminal state on its own task.
struct SessionDriver {
    api: Arc<dyn ServerApi>,
    transfer: Arc<dyn Transfer>,
    config: Arc<UploaderConfig>,
    registry: Registry,
    emitter: Arc<Emitter>,
    cancel: CancellationToken,
}

impl SessionDriver {
    async fn run(
        self,
        mut session: UploadSession,
        file: AssetFile,
        product_context: serde_json::Value,
    ) {
        let context_key = session.context_key.clone();
        let session_id = session.id.clone();

        match self.drive(&mut session, file, product_context).await {
            Ok(()) => {}
            Err(UploadError::Cancelled { phase, .. }) => {
                log::info!("Session {} cancelled during {}", session_id, phase);
                session.mark_cancelled();
                self.emitter.emit(StatusUpdate::stage(&session));
            }
            Err(error) => {
                log::error!("Session {} failed: {}", session_id, error);
                session.mark_failed(error.failure());
                self.emitter.emit(StatusUpdate::stage(&session));
            }
        }

        self.release(&context_key, &session_id);
    }

    async fn drive(
        &self,
        session: &mut UploadSession,
        file: AssetFile,
        product_context: serde_json::Value,
    ) -> UplinkResult<()> {
        session.advance(SessionStatus::Negotiating);
        self.emitter.emit(StatusUpdate::stage(session));

        if self.cancel.is_cancelled() {
            return Err(UploadError::cancelled("negotiation", &session.id));
        }

        let intent = IntentRequest {
            session_id: session.id.clone(),
            context_key: session.context_key.clone(),
            file: session.file.clone(),
            product_context,
        };
        let plan = self.api.negotiate(&intent).await?;
        let policy = plan
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.config.retry.clone());
        log::info!(
            "Session {} negotiated a chain of {} providers",
            session.id,
            plan.targets.len()
        );

        if self.cancel.is_cancelled() {
            return Err(UploadError::cancelled("negotiation", &session.id));
        }

        session.advance(SessionStatus::Transferring);
        self.emitter.emit(StatusUpdate::stage(session));

        let job = TransferJob {
            session_id: session.id.clone(),
            context_key: session.context_key.clone(),
            file,
        };
        let meter = Arc::new(ProgressMeter::new(
            self.emitter.clone(),
            session.id.clone(),
            session.context_key.clone(),
        ));
        let progress: ProgressCallback = {
            let meter = meter.clone();
            Arc::new(move |raw| meter.observe(raw))
        };

        let outcome = run_with_fallback(
            self.transfer.as_ref(),
            &job,
            &plan.targets,
            &policy,
            progress,
            |provider, attempt| {
                session.record_attempt(&provider.id, attempt);
                meter.set_attempt(&provider.id, attempt);
            },
            &self.cancel,
        )
        .await?;

        session.advance(SessionStatus::Finalizing);
        self.emitter.emit(StatusUpdate::stage(session));

        let completion = CompletionRequest {
            session_id: session.id.clone(),
            provider: outcome.provider.id.clone(),
            url: outcome.receipt.provider_url.clone(),
            bytes_sent: outcome.receipt.bytes_sent,
            transfer_duration_ms: outcome.duration_ms,
        };
        if let Err(error) = complete_with_retry(self.api.as_ref(), &completion, &self.cancel).await
        {
            if matches!(error, UploadError::Completion { .. }) {
                log::error!(
                    "Session {} stored {} bytes on provider {} but the completion was never recorded; flagging for reconciliation",
                    session.id,
                    completion.bytes_sent,
                    completion.provider
                );
            }
            return Err(error);
        }

        session.advance(SessionStatus::Processing);
        self.emitter.emit(StatusUpdate::stage(session));

        let (status, asset) = poll_until_terminal(
            self.api.as_ref(),
            &session.id,
            &self.config.poll,
            &self.config.quality,
            &outcome.receipt.provider_url,
            &self.cancel,
        )
        .await?;

        session.mark_succeeded(status, asset);
        self.emitter.emit(StatusUpdate::stage(session));
        log::info!("Session {} finished as {}", session.id, status);
        Ok(())
    }

    /// Removes this session's registry entry unless a successor has already
    /// replaced it.
    fn release(&self, context_key: &ContextKey, session_id: &str) {
        with_registry(&self.registry, "release", |map| {
            if map.get(context_key).map(|entry| entry.session_id.as_str()) == Some(session_id) {
                map.remove(context_key);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(status: SessionStatus) -> StatusUpdate {
        StatusUpdate {
            session_id: "s-1".to_string(),
            context_key: "p1:front".into(),
            status,
            progress: None,
            result: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn emitter_drops_everything_after_terminal() {
        let (emitter, mut rx) = Emitter::new();
        emitter.emit(update(SessionStatus::Negotiating));
        emitter.emit(update(SessionStatus::Cancelled));
        emitter.emit(update(SessionStatus::Processing));
        emitter.emit(update(SessionStatus::Ready));
        drop(emitter);

        let mut seen = Vec::new();
        while let Some(u) = rx.recv().await {
            seen.push(u.status);
        }
        assert_eq!(
            seen,
            vec![SessionStatus::Negotiating, SessionStatus::Cancelled]
        );
    }

    #[tokio::test]
    async fn emitter_sends_exactly_one_terminal() {
        let (emitter, mut rx) = Emitter::new();
        emitter.emit(update(SessionStatus::Failed));
        emitter.emit(update(SessionStatus::Cancelled));
        drop(emitter);

        let mut seen = Vec::new();
        while let Some(u) = rx.recv().await {
            seen.push(u.status);
        }
        assert_eq!(seen, vec![SessionStatus::Failed]);
    }

    #[test]
    fn meter_throttles_between_boundaries() {
        let (emitter, mut rx) = Emitter::new();
        let meter = ProgressMeter::new(emitter, "s-1".to_string(), "p1:front".into());
        meter.set_attempt("cdn-primary", 1);

        // Rapid interior chunks collapse to the first one; the final chunk
        // always goes out.
        for loaded in [100u64, 200, 300, 1000] {
            meter.observe(TransferProgress {
                loaded,
                total: 1000,
                elapsed: Duration::from_millis(loaded),
            });
        }

        let mut seen = Vec::new();
        while let Ok(u) = rx.try_recv() {
            seen.push(u);
        }
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].progress.as_ref().unwrap().bytes_sent, 100);
        assert_eq!(seen[1].progress.as_ref().unwrap().bytes_sent, 1000);
        assert_eq!(seen[1].progress.as_ref().unwrap().provider, "cdn-primary");
        assert_eq!(seen[1].status, SessionStatus::Transferring);
    }
}
