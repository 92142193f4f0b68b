//! Cloud storage provider abstraction
//!
//! Defines the `CloudProvider` trait that decouples refresh coordination and
//! health tracking from any particular storage vendor. Concrete clients (e.g.
//! `google_drive::GoogleDriveProvider`) implement token refresh, token
//! validation and a cheap connectivity probe; everything above this crate only
//! sees `ProviderFailure` values and the canonical `ErrorKind` taxonomy.

pub mod registry;

pub use registry::{ProviderRegistry, RegistryError};

use common::Secret;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

/// Known storage providers. Closed set: adding a provider means adding a
/// variant, so every `match` over provider behavior is checked by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    GoogleDrive,
    OneDrive,
    Dropbox,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::GoogleDrive,
        ProviderKind::OneDrive,
        ProviderKind::Dropbox,
    ];

    /// Stable identifier used in store keys, cache keys and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::GoogleDrive => "google-drive",
            ProviderKind::OneDrive => "onedrive",
            ProviderKind::Dropbox => "dropbox",
        }
    }

    /// Human readable product name for user-facing messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::GoogleDrive => "Google Drive",
            ProviderKind::OneDrive => "OneDrive",
            ProviderKind::Dropbox => "Dropbox",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown provider: {s}"))
    }
}

/// Canonical classification of provider failures.
///
/// Drives retry decisions, the durable "requires user intervention" flag, and
/// the health status shown to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Access or refresh token rejected (401, revoked grant)
    TokenExpired,
    InsufficientPermissions,
    StorageQuotaExceeded,
    ApiQuotaExceeded,
    FileNotFound,
    FileTooLarge,
    /// Provider-side 5xx
    ServiceUnavailable,
    /// Transport-level connect failure
    NetworkError,
    Timeout,
    ProviderNotConfigured,
    /// Another holder kept the refresh lock past the wait bound
    LockTimeout,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 12] = [
        ErrorKind::TokenExpired,
        ErrorKind::InsufficientPermissions,
        ErrorKind::StorageQuotaExceeded,
        ErrorKind::ApiQuotaExceeded,
        ErrorKind::FileNotFound,
        ErrorKind::FileTooLarge,
        ErrorKind::ServiceUnavailable,
        ErrorKind::NetworkError,
        ErrorKind::Timeout,
        ErrorKind::ProviderNotConfigured,
        ErrorKind::LockTimeout,
        ErrorKind::Unknown,
    ];

    /// Label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TokenExpired => "token_expired",
            ErrorKind::InsufficientPermissions => "insufficient_permissions",
            ErrorKind::StorageQuotaExceeded => "storage_quota_exceeded",
            ErrorKind::ApiQuotaExceeded => "api_quota_exceeded",
            ErrorKind::FileNotFound => "file_not_found",
            ErrorKind::FileTooLarge => "file_too_large",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ProviderNotConfigured => "provider_not_configured",
            ErrorKind::LockTimeout => "lock_timeout",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Authentication or permission problems only the user can fix.
    pub fn is_authorization(&self) -> bool {
        matches!(
            self,
            ErrorKind::TokenExpired | ErrorKind::InsufficientPermissions
        )
    }

    /// Transient failures that may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::ServiceUnavailable
                | ErrorKind::NetworkError
                | ErrorKind::Timeout
                | ErrorKind::ApiQuotaExceeded
                | ErrorKind::LockTimeout
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw failure reported by a provider client, before classification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderFailure {
    /// Non-success HTTP response; `reason` is the provider's machine-readable
    /// reason code when the body carried one (e.g. "quotaExceeded").
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        reason: Option<String>,
        message: String,
    },

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("provider not configured: {0}")]
    NotConfigured(ProviderKind),

    #[error("{0}")]
    Other(String),
}

/// Result alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderFailure>;

/// Credentials returned by a successful refresh.
///
/// `expires_in` is a delta in seconds from the response time; the store turns
/// it into an absolute unix millisecond timestamp. Providers that do not rotate
/// refresh tokens return `refresh_token: None` and the stored one is kept.
#[derive(Debug, Clone)]
pub struct TokenData {
    pub access_token: Secret<String>,
    pub refresh_token: Option<Secret<String>>,
    pub expires_in: Option<u64>,
    pub scopes: Vec<String>,
}

/// Abstraction over a cloud storage provider's OAuth and API surface.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn CloudProvider>` in the registry).
pub trait CloudProvider: Send + Sync {
    /// Which provider this client talks to.
    fn kind(&self) -> ProviderKind;

    /// Exchange a refresh token for a new access token.
    fn refresh_token<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenData>> + Send + 'a>>;

    /// Ask the provider whether the access token is still accepted.
    fn has_valid_connection<'a>(
        &'a self,
        access_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;

    /// Cheap authenticated API call proving the storage API is reachable.
    fn test_connectivity<'a>(
        &'a self,
        access_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;
}
