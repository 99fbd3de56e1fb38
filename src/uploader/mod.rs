// Main uploader module - orchestrates all upload functionality
//
// This module is responsible for coordinating asset uploads to storage providers

pub mod api;
pub mod coordinator;
pub mod orchestrator;
pub mod poller;
pub mod progress;
pub mod session;
pub mod transfer;

pub use coordinator::{UploadCoordinator, UploadHandle, UploadRequest};
pub use session::{AssetFile, SessionStatus, StatusUpdate};
