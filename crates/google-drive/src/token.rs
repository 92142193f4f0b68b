//! OAuth token refresh and Drive probes
//!
//! Three endpoint interactions:
//! 1. Token refresh (`grant_type=refresh_token`) against the token endpoint
//! 2. Access token introspection against `tokeninfo`
//! 3. Authenticated `about` read against the Drive API
//!
//! Transport errors are mapped to `ProviderFailure::Timeout` /
//! `ProviderFailure::Connect`; HTTP errors go through `failure_from_response`.

use common::Secret;
use provider::{ProviderFailure, Result, TokenData};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::GoogleConfig;
use crate::response::failure_from_response;

/// Response from the token endpoint for a refresh grant.
///
/// Google only returns `refresh_token` when it rotates the grant, so it is
/// optional. `expires_in` is a delta in seconds.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl From<TokenResponse> for TokenData {
    fn from(response: TokenResponse) -> Self {
        TokenData {
            access_token: Secret::new(response.access_token),
            refresh_token: response.refresh_token.map(Secret::new),
            expires_in: response.expires_in,
            scopes: response
                .scope
                .map(|s| s.split_whitespace().map(str::to_owned).collect())
                .unwrap_or_default(),
        }
    }
}

/// Map a reqwest transport error onto the raw failure shapes.
pub(crate) fn transport_failure(context: &str, err: reqwest::Error) -> ProviderFailure {
    if err.is_timeout() {
        ProviderFailure::Timeout(format!("{context} timed out: {err}"))
    } else if err.is_connect() {
        ProviderFailure::Connect(format!("{context}: {err}"))
    } else {
        ProviderFailure::Other(format!("{context} failed: {err}"))
    }
}

async fn error_from(response: reqwest::Response) -> ProviderFailure {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));
    failure_from_response(status, &body)
}

/// Refresh an access token using a refresh token.
pub async fn refresh_token(
    client: &reqwest::Client,
    config: &GoogleConfig,
    refresh: &str,
) -> Result<TokenData> {
    let response = client
        .post(&config.token_url)
        .timeout(config.request_timeout)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.expose().as_str()),
        ])
        .send()
        .await
        .map_err(|e| transport_failure("token refresh request", e))?;

    if !response.status().is_success() {
        return Err(error_from(response).await);
    }

    let token = response
        .json::<TokenResponse>()
        .await
        .map_err(|e| ProviderFailure::Other(format!("invalid refresh response: {e}")))?;
    debug!(
        expires_in = token.expires_in,
        rotated = token.refresh_token.is_some(),
        "token endpoint returned new access token"
    );
    Ok(token.into())
}

/// Check an access token with `GET tokeninfo?access_token=`.
///
/// 200 → valid. 400/401 → the token is no longer accepted (`Ok(false)`).
/// Anything else is a failure of the check itself.
pub async fn token_info(
    client: &reqwest::Client,
    config: &GoogleConfig,
    access: &str,
) -> Result<bool> {
    let response = client
        .get(&config.tokeninfo_url)
        .timeout(config.request_timeout)
        .query(&[("access_token", access)])
        .send()
        .await
        .map_err(|e| transport_failure("tokeninfo request", e))?;

    match response.status().as_u16() {
        200..=299 => Ok(true),
        400 | 401 => Ok(false),
        _ => Err(error_from(response).await),
    }
}

/// Read the Drive `about` resource with the access token.
pub async fn about(client: &reqwest::Client, config: &GoogleConfig, access: &str) -> Result<bool> {
    let url = format!("{}{}", config.api_base_url, crate::constants::ABOUT_PATH);
    let response = client
        .get(url)
        .timeout(config.request_timeout)
        .bearer_auth(access)
        .send()
        .await
        .map_err(|e| transport_failure("drive about request", e))?;

    if !response.status().is_success() {
        return Err(error_from(response).await);
    }
    Ok(true)
}
