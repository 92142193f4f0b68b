//! Google error envelope decoding
//!
//! Two shapes come back from Google:
//! - Drive API: `{"error":{"code":403,"message":"..","errors":[{"reason":"quotaExceeded"}]}}`
//! - OAuth endpoints: `{"error":"invalid_grant","error_description":".."}`

use provider::ProviderFailure;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Envelope {
    error: ErrorBody,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Api {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        errors: Vec<ErrorItem>,
        #[serde(default)]
        status: Option<String>,
    },
    OAuth(String),
}

#[derive(Debug, Deserialize)]
struct ErrorItem {
    #[serde(default)]
    reason: Option<String>,
}

/// Build a `ProviderFailure::Http` from a non-success status and body.
///
/// Unparseable bodies keep the status and use the (truncated) raw body as the
/// message with no reason code.
pub fn failure_from_response(status: u16, body: &str) -> ProviderFailure {
    let (reason, message) = match serde_json::from_str::<Envelope>(body) {
        Ok(Envelope {
            error:
                ErrorBody::Api {
                    message,
                    errors,
                    status: api_status,
                },
            ..
        }) => {
            let reason = errors.into_iter().find_map(|e| e.reason).or(api_status);
            (reason, message.unwrap_or_else(|| format!("HTTP {status}")))
        }
        Ok(Envelope {
            error: ErrorBody::OAuth(code),
            error_description,
        }) => {
            let message = error_description.unwrap_or_else(|| code.clone());
            (Some(code), message)
        }
        Err(_) => {
            let trimmed = body.trim();
            let message = if trimmed.is_empty() {
                format!("HTTP {status}")
            } else {
                trimmed.chars().take(200).collect()
            };
            (None, message)
        }
    };

    ProviderFailure::Http {
        status,
        reason,
        message,
    }
}
