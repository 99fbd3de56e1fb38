//! Upload coordination core for attaching large print assets to storefront
//! products.
//!
//! The client drives the whole exchange: it negotiates an upload intent with
//! the storefront server, pushes the bytes to the first provider of the
//! negotiated chain (falling back down the chain with exponential backoff),
//! reports the durable outcome back, then polls until server-side processing
//! reaches a terminal state. [`UploadCoordinator`] is the entry point; every
//! session reports through its own [`StatusUpdate`] stream.

pub mod config;
pub mod errors;
pub mod uploader;
pub mod validation;

pub use config::{
    ApiSettings, LocalLimits, PollPolicy, QualityRules, RetryPolicy, TransferSettings,
    UploaderConfig,
};
pub use errors::{
    AttemptRecord, FailureKind, SuggestedAction, TransferError, UploadError, UploadFailure,
    UplinkResult,
};
pub use uploader::api::{
    CompletionRequest, IntentRequest, NegotiatedPlan, ProcessingReport, ProcessingState,
    ProviderKind, ProviderTarget, ServerApi,
};
pub use uploader::coordinator::{UploadCoordinator, UploadHandle, UploadRequest};
pub use uploader::progress::ProgressSnapshot;
pub use uploader::session::{
    AssetFile, AssetMetadata, ContextKey, FileDescriptor, QualityWarning, SessionStatus,
    StatusUpdate, StoredAsset, UploadSession,
};
pub use uploader::transfer::{
    ProgressCallback, Transfer, TransferJob, TransferProgress, TransferReceipt,
};
pub use validation::{validate_local, LocalCheck, Violation};
