use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::errors::{UploadError, UplinkResult};

/// Top-level configuration for the upload core. The embedding application
/// owns persistence; this crate only consumes the resolved values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploaderConfig {
    pub api: ApiSettings,
    pub limits: LocalLimits,
    pub quality: QualityRules,
    pub retry: RetryPolicy,
    pub poll: PollPolicy,
    pub transfer: TransferSettings,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            api: ApiSettings::default(),
            limits: LocalLimits::default(),
            quality: QualityRules::default(),
            retry: RetryPolicy::default(),
            poll: PollPolicy::default(),
            transfer: TransferSettings::default(),
        }
    }
}

/// Storefront coordination endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    pub base_url: String,
    /// Opaque headers attached to every coordination request (auth token etc.)
    pub default_headers: HashMap<String, String>,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api".to_string(),
            default_headers: HashMap::new(),
        }
    }
}

/// Local pre-check limits applied before any network traffic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalLimits {
    pub max_file_bytes: u64,
    pub allowed_extensions: Vec<String>,
    /// Exact entries plus `type/*` wildcards
    pub allowed_mime_types: Vec<String>,
}

impl Default for LocalLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: 1_468_006_400, // 1.4 GiB
            allowed_extensions: vec![
                "png".to_string(),
                "jpg".to_string(),
                "jpeg".to_string(),
                "webp".to_string(),
                "gif".to_string(),
                "bmp".to_string(),
                "tif".to_string(),
                "tiff".to_string(),
                "svg".to_string(),
                "pdf".to_string(),
                "eps".to_string(),
                "ai".to_string(),
            ],
            allowed_mime_types: vec![
                "image/*".to_string(),
                "application/pdf".to_string(),
                "application/postscript".to_string(),
            ],
        }
    }
}

/// Rules applied to server-reported asset metadata after processing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityRules {
    pub min_dpi: Option<u32>,
}

impl Default for QualityRules {
    fn default() -> Self {
        Self { min_dpi: Some(150) }
    }
}

/// Retry budget for one provider of the fallback chain. Serialized in
/// camelCase because the negotiation response may carry an override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub max_attempts_per_provider: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts_per_provider: 3,
            base_delay_ms: 1000,
            max_delay_ms: 120_000, // 2 minutes
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base doubled per
    /// attempt, capped at the maximum.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponential =
            self.base_delay_ms as f64 * 2f64.powi(attempt.saturating_sub(1) as i32);
        let capped = (exponential as u64).min(self.max_delay_ms);
        Duration::from_millis(capped)
    }
}

/// Post-processing status poll schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollPolicy {
    pub interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            max_attempts: 60,
        }
    }
}

impl PollPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Wire-level transfer tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    pub chunk_size_bytes: usize,
    pub connect_timeout_secs: u64,
    /// Whole-request deadline; `None` leaves slow large transfers unbounded
    pub request_timeout_secs: Option<u64>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size_bytes: 256 * 1024,
            connect_timeout_secs: 30,
            request_timeout_secs: Some(1800),
        }
    }
}

impl UploaderConfig {
    pub fn validate(&self) -> UplinkResult<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(UploadError::config("api.base_url cannot be empty"));
        }

        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://") {
            return Err(UploadError::config("api.base_url must be an http(s) URL"));
        }

        if self.limits.max_file_bytes == 0 {
            return Err(UploadError::config("limits.max_file_bytes must be greater than 0"));
        }

        if self.retry.max_attempts_per_provider == 0 || self.retry.max_attempts_per_provider > 10 {
            return Err(UploadError::config(
                "retry.max_attempts_per_provider must be between 1 and 10",
            ));
        }

        if self.retry.base_delay_ms == 0 {
            return Err(UploadError::config("retry.base_delay_ms must be greater than 0"));
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(UploadError::config(
                "retry.max_delay_ms must be at least retry.base_delay_ms",
            ));
        }

        if self.poll.interval_ms < 100 {
            return Err(UploadError::config("poll.interval_ms must be at least 100ms"));
        }

        if self.poll.max_attempts == 0 {
            return Err(UploadError::config("poll.max_attempts must be greater than 0"));
        }

        if self.transfer.chunk_size_bytes == 0 {
            return Err(UploadError::config(
                "transfer.chunk_size_bytes must be greater than 0",
            ));
        }

        if self.transfer.connect_timeout_secs == 0 {
            return Err(UploadError::config(
                "transfer.connect_timeout_secs must be greater than 0",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(UploaderConfig::default().validate().is_ok());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(4000));
        assert_eq!(policy.backoff_delay(7), Duration::from_millis(64_000));
        // 1000 * 2^7 = 128s, past the 120s ceiling
        assert_eq!(policy.backoff_delay(8), Duration::from_millis(120_000));
        assert_eq!(policy.backoff_delay(30), Duration::from_millis(120_000));
    }

    #[test]
    fn zero_attempt_budget_is_rejected() {
        let mut config = UploaderConfig::default();
        config.retry.max_attempts_per_provider = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_base_url_is_rejected() {
        let mut config = UploaderConfig::default();
        config.api.base_url = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_delay_bounds_are_rejected() {
        let mut config = UploaderConfig::default();
        config.retry.base_delay_ms = 5000;
        config.retry.max_delay_ms = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_policy_round_trips_camel_case() {
        let json = "{\"maxAttemptsPerProvider\":5,\"baseDelayMs\":200,\"maxDelayMs\":8000}";
        let policy: RetryPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(policy.max_attempts_per_provider, 5);
        assert_eq!(policy.base_delay_ms, 200);
        assert_eq!(policy.max_delay_ms, 8000);
    }

    #[test]
    fn partial_retry_policy_fills_defaults() {
        let policy: RetryPolicy = serde_json::from_str("{\"maxAttemptsPerProvider\":2}").unwrap();
        assert_eq!(policy.max_attempts_per_provider, 2);
        assert_eq!(policy.base_delay_ms, RetryPolicy::default().base_delay_ms);
        assert_eq!(policy.max_delay_ms, RetryPolicy::default().max_delay_ms);
    }
}
