//! Configuration types for the profile service.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use subtle::ConstantTimeEq;

use crate::upload::RetryPolicy;
use crate::ProfiledError;

// ============================================================================
// Default configuration constants
// ============================================================================

/// Default ingestion HTTP port.
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default maximum request body size (16 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Default rotation interval in seconds.
pub const DEFAULT_ROTATION_INTERVAL_SECS: u64 = 300;

/// Dataset id used when a request does not name one.
pub const DEFAULT_DATASET_ID: &str = "default";

/// Prefix applied to segment tag names before they enter a key.
pub const DEFAULT_TAG_PREFIX: &str = "segment.";

/// Default maximum publish attempts per profile, including the first.
pub const DEFAULT_UPLOAD_MAX_ATTEMPTS: u32 = 3;

/// Default base retry delay in milliseconds.
pub const DEFAULT_UPLOAD_INITIAL_DELAY_MS: u64 = 10;

/// Default maximum retry delay in milliseconds.
pub const DEFAULT_UPLOAD_MAX_DELAY_MS: u64 = 5_000;

/// Default timeout for a single publish request in seconds.
pub const DEFAULT_UPLOAD_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default number of publishes allowed in flight at once.
pub const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 16;

/// Default time shutdown waits for outstanding uploads, in seconds.
pub const DEFAULT_SHUTDOWN_UPLOAD_TIMEOUT_SECS: u64 = 30;

/// Profile service configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProfiledConfig {
    /// Server configuration.
    pub server: ServerConfig,
    /// Profile aggregation configuration.
    pub profile: ProfileConfig,
    /// Upload configuration.
    pub upload: UploadConfig,
    /// Shutdown configuration.
    pub shutdown: ShutdownConfig,
    /// Enables debug logging for this service.
    pub debug: bool,
}

impl ProfiledConfig {
    /// Load configuration from files and environment.
    ///
    /// Configuration is loaded in order (later sources override earlier):
    /// 1. Default values
    /// 2. `profiled.toml` in current directory
    /// 3. Environment variables prefixed with `PROFILED_` (nested with `__`)
    pub fn load() -> Result<Self, ProfiledError> {
        Self::load_from("profiled.toml")
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &str) -> Result<Self, ProfiledError> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(path))
                .merge(Env::prefixed("PROFILED_").split("__")),
        )
    }

    /// Extract configuration from an arbitrary figment.
    pub fn from_figment(figment: Figment) -> Result<Self, ProfiledError> {
        Ok(figment.extract()?)
    }

    /// Checks the settings required to run the service.
    pub fn validate(&self) -> Result<(), ProfiledError> {
        if self.profile.org_id.trim().is_empty() {
            return Err(ProfiledError::Config("profile.org_id must be set".into()));
        }
        if self.profile.api_key.is_none() {
            return Err(ProfiledError::Config("profile.api_key must be set".into()));
        }
        if self.profile.rotation_interval_secs == 0 {
            return Err(ProfiledError::Config(
                "profile.rotation_interval_secs must be greater than zero".into(),
            ));
        }
        if self.upload.endpoint.as_deref().map_or(true, str::is_empty) {
            return Err(ProfiledError::Config("upload.endpoint must be set".into()));
        }
        if self.upload.max_attempts == 0 {
            return Err(ProfiledError::Config(
                "upload.max_attempts must be at least 1".into(),
            ));
        }
        if self.upload.initial_delay_ms > self.upload.max_delay_ms {
            return Err(ProfiledError::Config(
                "upload.initial_delay_ms must not exceed upload.max_delay_ms".into(),
            ));
        }
        if self.upload.max_concurrent_uploads == 0 {
            return Err(ProfiledError::Config(
                "upload.max_concurrent_uploads must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Default log filter when `RUST_LOG` is not set.
    pub fn default_log_filter(&self) -> &'static str {
        if self.debug {
            "profiled=debug,tower_http=debug"
        } else {
            "profiled=info,tower_http=info"
        }
    }
}

/// Server address configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Ingestion HTTP address (default: 0.0.0.0:8080).
    pub http_addr: SocketAddr,
    /// Maximum accepted request body in bytes, after decompression.
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_HTTP_PORT)),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

/// Profile aggregation configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Organisation that owns every profile produced by this process.
    pub org_id: String,
    /// Key clients must present in the `X-API-Key` header.
    pub api_key: Option<Secret>,
    /// Length of one accumulation window in seconds.
    pub rotation_interval_secs: u64,
    /// Dataset id used when a request does not name one.
    pub default_dataset_id: String,
    /// Prefix applied to segment tag names.
    pub tag_prefix: String,
}

impl ProfileConfig {
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            org_id: String::new(),
            api_key: None,
            rotation_interval_secs: DEFAULT_ROTATION_INTERVAL_SECS,
            default_dataset_id: DEFAULT_DATASET_ID.to_owned(),
            tag_prefix: DEFAULT_TAG_PREFIX.to_owned(),
        }
    }
}

/// Upload configuration for delivering finished profiles.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Base URL of the collector; profiles are posted to `<endpoint>/v1/profiles`.
    pub endpoint: Option<String>,
    /// Bearer token sent to the collector.
    pub auth_token: Option<Secret>,
    /// Timeout for one publish request in seconds.
    pub request_timeout_secs: u64,
    /// Maximum publish attempts per profile, including the first.
    pub max_attempts: u32,
    /// Base retry delay in milliseconds.
    ///
    /// The delay ceiling doubles after each failed attempt, up to `max_delay_ms`;
    /// the actual wait is drawn uniformly below the ceiling.
    pub initial_delay_ms: u64,
    /// Maximum retry delay in milliseconds.
    pub max_delay_ms: u64,
    /// Maximum publishes in flight at once.
    pub max_concurrent_uploads: usize,
}

impl UploadConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            auth_token: None,
            request_timeout_secs: DEFAULT_UPLOAD_REQUEST_TIMEOUT_SECS,
            max_attempts: DEFAULT_UPLOAD_MAX_ATTEMPTS,
            initial_delay_ms: DEFAULT_UPLOAD_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_UPLOAD_MAX_DELAY_MS,
            max_concurrent_uploads: DEFAULT_MAX_CONCURRENT_UPLOADS,
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long shutdown waits for outstanding uploads, in seconds.
    pub upload_timeout_secs: u64,
}

impl ShutdownConfig {
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            upload_timeout_secs: DEFAULT_SHUTDOWN_UPLOAD_TIMEOUT_SECS,
        }
    }
}

/// A credential read from configuration.
///
/// The value never appears in `Debug` output and comparisons run in constant time.
#[derive(Clone)]
pub struct Secret {
    inner: SecretString,
}

impl Secret {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            inner: SecretString::from(value.into()),
        }
    }

    /// Exposes the secret value for use.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.inner.expose_secret()
    }

    /// Constant-time comparison against a presented value.
    pub fn matches(&self, presented: &str) -> bool {
        let expected = self.inner.expose_secret().as_bytes();
        let presented = presented.as_bytes();

        if expected.len() != presented.len() {
            return false;
        }

        expected.ct_eq(presented).into()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}
