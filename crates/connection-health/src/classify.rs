//! Provider failure classification
//!
//! Maps a raw `ProviderFailure` onto the canonical `ErrorKind`. Rules are
//! checked from most to least specific; anything unmatched is `Unknown`.

use provider::{ErrorKind, ProviderFailure};

/// 403 reason codes that mean the user's storage is full.
const STORAGE_QUOTA_REASONS: &[&str] = &["quotaExceeded", "storageQuotaExceeded"];

/// 403 reason codes that mean the API request rate was exceeded.
const RATE_LIMIT_REASONS: &[&str] = &["rateLimitExceeded", "userRateLimitExceeded"];

/// Classify a provider failure. Pure and total.
pub fn classify(failure: &ProviderFailure) -> ErrorKind {
    match failure {
        ProviderFailure::NotConfigured(_) => ErrorKind::ProviderNotConfigured,
        ProviderFailure::Http {
            status,
            reason,
            message,
        } => classify_http(*status, reason.as_deref(), message),
        ProviderFailure::Connect(_) => ErrorKind::NetworkError,
        ProviderFailure::Timeout(_) => ErrorKind::Timeout,
        ProviderFailure::Other(message) if mentions_timeout(message) => ErrorKind::Timeout,
        ProviderFailure::Other(_) => ErrorKind::Unknown,
    }
}

/// Classify an HTTP failure by status and optional reason code.
pub fn classify_http(status: u16, reason: Option<&str>, message: &str) -> ErrorKind {
    let reason = reason.unwrap_or_default();
    match status {
        401 => ErrorKind::TokenExpired,
        400 if reason == "invalid_grant" => ErrorKind::TokenExpired,
        403 if reason == "insufficientPermissions" => ErrorKind::InsufficientPermissions,
        403 if STORAGE_QUOTA_REASONS.contains(&reason) => ErrorKind::StorageQuotaExceeded,
        403 if RATE_LIMIT_REASONS.contains(&reason) => ErrorKind::ApiQuotaExceeded,
        429 => ErrorKind::ApiQuotaExceeded,
        404 => ErrorKind::FileNotFound,
        413 => ErrorKind::FileTooLarge,
        500..=599 => ErrorKind::ServiceUnavailable,
        _ if mentions_timeout(message) => ErrorKind::Timeout,
        _ => ErrorKind::Unknown,
    }
}

fn mentions_timeout(message: &str) -> bool {
    message.to_lowercase().contains("timed out")
}
