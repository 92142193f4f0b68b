//! Retry decisions per error kind
//!
//! One shared decision table (retry count, base delay, intervention) with
//! per-provider layers on top: a delay override for API quota errors and
//! provider-specific user messages and remediation steps. Provider layers are
//! plain `match` arms over `ProviderKind`, so the table itself never changes
//! shape per provider.

use std::time::Duration;

use provider::{ErrorKind, ProviderKind};
use serde::Deserialize;

/// Delay growth across attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Base delay on every attempt
    Fixed,
    /// `base * 2^(attempt - 1)`, capped at `max_delay_secs`
    #[default]
    Exponential,
}

/// `[retry]` settings
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub backoff: Backoff,
    /// Retries allowed for transient kinds after the first failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Upper bound for exponential growth. Never lowers a kind's base delay.
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    /// Google Drive API quota resets hourly
    #[serde(default = "default_google_quota_delay")]
    pub google_drive_quota_delay_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_delay() -> u64 {
    3600
}

fn default_google_quota_delay() -> u64 {
    3600
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            max_retries: default_max_retries(),
            max_delay_secs: default_max_delay(),
            google_drive_quota_delay_secs: default_google_quota_delay(),
        }
    }
}

/// True iff only the user can resolve the failure (reconnect, grant access).
pub fn requires_user_intervention(kind: ErrorKind) -> bool {
    kind.is_authorization()
}

/// Retry policy shared by every provider.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Whether the attempt numbered `attempt` (1-based, the one that just
    /// failed) may be followed by another.
    pub fn should_retry(&self, kind: ErrorKind, attempt: u32) -> bool {
        attempt.max(1) <= self.max_attempts(kind)
    }

    /// Retries allowed after the first failure.
    pub fn max_attempts(&self, kind: ErrorKind) -> u32 {
        match kind {
            ErrorKind::NetworkError
            | ErrorKind::Timeout
            | ErrorKind::ServiceUnavailable
            | ErrorKind::ApiQuotaExceeded
            | ErrorKind::LockTimeout => self.config.max_retries,
            ErrorKind::Unknown => 1,
            ErrorKind::TokenExpired
            | ErrorKind::InsufficientPermissions
            | ErrorKind::StorageQuotaExceeded
            | ErrorKind::FileNotFound
            | ErrorKind::FileTooLarge
            | ErrorKind::ProviderNotConfigured => 0,
        }
    }

    /// Delay before retrying after `attempt` failed. Zero for kinds that are
    /// never retried.
    pub fn retry_delay(&self, kind: ErrorKind, attempt: u32, provider: ProviderKind) -> Duration {
        if self.max_attempts(kind) == 0 {
            return Duration::ZERO;
        }
        let base = self
            .provider_delay_override(provider, kind)
            .unwrap_or_else(|| base_delay_secs(kind));

        let secs = match self.config.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential => {
                let cap = base.max(self.config.max_delay_secs);
                let exponent = attempt.saturating_sub(1).min(32);
                base.saturating_mul(1u64 << exponent).min(cap)
            }
        };
        Duration::from_secs(secs)
    }

    pub fn requires_user_intervention(&self, kind: ErrorKind) -> bool {
        requires_user_intervention(kind)
    }

    fn provider_delay_override(&self, provider: ProviderKind, kind: ErrorKind) -> Option<u64> {
        match (provider, kind) {
            (ProviderKind::GoogleDrive, ErrorKind::ApiQuotaExceeded) => {
                Some(self.config.google_drive_quota_delay_secs)
            }
            _ => None,
        }
    }

    /// Message shown to the user for a failure of `kind`.
    pub fn user_message(&self, provider: ProviderKind, kind: ErrorKind) -> String {
        match (provider, kind) {
            (ProviderKind::GoogleDrive, ErrorKind::StorageQuotaExceeded) => {
                "Your Google Drive storage is full. Free up space or upgrade your Google storage plan."
                    .to_owned()
            }
            (ProviderKind::GoogleDrive, ErrorKind::ApiQuotaExceeded) => {
                "Google Drive API quota exceeded. Uploads will resume automatically within the hour."
                    .to_owned()
            }
            (ProviderKind::GoogleDrive, ErrorKind::InsufficientPermissions) => {
                "Google Drive access was not granted. Please reconnect and allow file access."
                    .to_owned()
            }
            _ => base_message(provider.display_name(), kind),
        }
    }

    /// Ordered steps the user can take to resolve a failure of `kind`.
    pub fn remediation_steps(&self, provider: ProviderKind, kind: ErrorKind) -> Vec<String> {
        let name = provider.display_name();
        match (provider, kind) {
            (ProviderKind::GoogleDrive, ErrorKind::InsufficientPermissions) => vec![
                "Disconnect Google Drive in cloud storage settings".to_owned(),
                "Connect Google Drive again".to_owned(),
                "Tick the Google Drive file access checkbox on the consent screen".to_owned(),
            ],
            (ProviderKind::GoogleDrive, ErrorKind::StorageQuotaExceeded) => vec![
                "Delete unneeded files from Google Drive and empty the trash".to_owned(),
                "Or upgrade your Google One storage plan".to_owned(),
            ],
            (_, ErrorKind::TokenExpired | ErrorKind::InsufficientPermissions) => vec![
                format!("Disconnect {name} in cloud storage settings"),
                format!("Connect {name} again"),
            ],
            (_, ErrorKind::StorageQuotaExceeded) => {
                vec![format!("Free up space in your {name} account")]
            }
            (_, ErrorKind::FileTooLarge) => {
                vec![format!("Split the file or check the {name} upload size limit")]
            }
            (_, ErrorKind::ProviderNotConfigured) => {
                vec![format!("Ask an administrator to configure {name}")]
            }
            (_, ErrorKind::Unknown) => vec!["Try again later or contact support".to_owned()],
            _ => Vec::new(),
        }
    }
}

fn base_delay_secs(kind: ErrorKind) -> u64 {
    match kind {
        ErrorKind::NetworkError => 30,
        ErrorKind::Timeout => 60,
        ErrorKind::ServiceUnavailable => 60,
        ErrorKind::ApiQuotaExceeded => 300,
        ErrorKind::LockTimeout => 10,
        ErrorKind::Unknown => 60,
        _ => 0,
    }
}

fn base_message(name: &str, kind: ErrorKind) -> String {
    match kind {
        ErrorKind::TokenExpired => {
            format!("Your {name} connection has expired. Please reconnect your account.")
        }
        ErrorKind::InsufficientPermissions => {
            format!("Missing permission to access your {name}. Please reconnect and grant access.")
        }
        ErrorKind::StorageQuotaExceeded => format!("Your {name} storage is full."),
        ErrorKind::ApiQuotaExceeded => {
            format!("{name} is limiting requests right now. We will retry automatically.")
        }
        ErrorKind::FileNotFound => format!("The requested file was not found in {name}."),
        ErrorKind::FileTooLarge => format!("The file is too large to upload to {name}."),
        ErrorKind::ServiceUnavailable => {
            format!("{name} is temporarily unavailable. We will retry automatically.")
        }
        ErrorKind::NetworkError => format!("Could not reach {name}. We will retry automatically."),
        ErrorKind::Timeout => {
            format!("The request to {name} timed out. We will retry automatically.")
        }
        ErrorKind::ProviderNotConfigured => format!("{name} is not configured."),
        ErrorKind::LockTimeout => {
            format!("A {name} token refresh is already in progress. We will retry shortly.")
        }
        ErrorKind::Unknown => format!("An unexpected error occurred while contacting {name}."),
    }
}
