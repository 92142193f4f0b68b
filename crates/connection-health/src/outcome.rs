//! Outcome of a refresh attempt

use connection_store::Token;
use provider::{ErrorKind, ProviderFailure};

/// Result of `RefreshCoordinator::coordinate_refresh`. Never persisted.
#[derive(Debug, Clone)]
pub enum RefreshResult {
    /// The provider issued new credentials, now persisted.
    Success { token: Token, message: String },
    /// The stored token was still valid; no provider call was made.
    AlreadyValid { message: String },
    /// Another holder refreshed the token while this caller waited.
    RefreshedByAnotherProcess { message: String },
    /// The refresh could not be completed.
    Failure {
        kind: ErrorKind,
        /// Raw provider failure, absent for failures detected before the call
        cause: Option<ProviderFailure>,
        message: String,
    },
}

impl RefreshResult {
    pub fn success(token: Token) -> Self {
        RefreshResult::Success {
            token,
            message: "Token refreshed successfully".to_owned(),
        }
    }

    pub fn already_valid() -> Self {
        RefreshResult::AlreadyValid {
            message: "Token is already valid".to_owned(),
        }
    }

    pub fn refreshed_by_another_process() -> Self {
        RefreshResult::RefreshedByAnotherProcess {
            message: "Token was refreshed by another process".to_owned(),
        }
    }

    pub fn failure(
        kind: ErrorKind,
        cause: Option<ProviderFailure>,
        message: impl Into<String>,
    ) -> Self {
        RefreshResult::Failure {
            kind,
            cause,
            message: message.into(),
        }
    }

    /// False only for `Failure`.
    pub fn is_success(&self) -> bool {
        !matches!(self, RefreshResult::Failure { .. })
    }

    /// Whether the provider was actually called and succeeded.
    pub fn was_refreshed(&self) -> bool {
        matches!(self, RefreshResult::Success { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            RefreshResult::Failure { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            RefreshResult::Success { message, .. }
            | RefreshResult::AlreadyValid { message }
            | RefreshResult::RefreshedByAnotherProcess { message }
            | RefreshResult::Failure { message, .. } => message,
        }
    }

    pub fn token(&self) -> Option<&Token> {
        match self {
            RefreshResult::Success { token, .. } => Some(token),
            _ => None,
        }
    }

    /// Label for logs and the `token_refresh_total` metric.
    pub fn label(&self) -> &'static str {
        match self {
            RefreshResult::Success { .. } => "success",
            RefreshResult::AlreadyValid { .. } => "already_valid",
            RefreshResult::RefreshedByAnotherProcess { .. } => "refreshed_by_another_process",
            RefreshResult::Failure { .. } => "failure",
        }
    }
}
