//! `CloudProvider` implementation for Google Drive

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use common::Secret;
use provider::{CloudProvider, ProviderKind, Result, TokenData};

use crate::constants::{DRIVE_API_BASE, TOKEN_ENDPOINT, TOKENINFO_ENDPOINT};
use crate::token;

/// Google OAuth client settings and endpoint URLs.
///
/// Endpoint URLs default to Google's production hosts; tests point them at a
/// local server.
#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub token_url: String,
    pub tokeninfo_url: String,
    pub api_base_url: String,
    pub request_timeout: Duration,
}

impl GoogleConfig {
    pub fn new(client_id: impl Into<String>, client_secret: Secret<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
            token_url: TOKEN_ENDPOINT.to_owned(),
            tokeninfo_url: TOKENINFO_ENDPOINT.to_owned(),
            api_base_url: DRIVE_API_BASE.to_owned(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Google Drive client over a shared `reqwest::Client`.
pub struct GoogleDriveProvider {
    http_client: reqwest::Client,
    config: GoogleConfig,
}

impl GoogleDriveProvider {
    pub fn new(http_client: reqwest::Client, config: GoogleConfig) -> Self {
        Self {
            http_client,
            config,
        }
    }

    pub fn config(&self) -> &GoogleConfig {
        &self.config
    }
}

impl CloudProvider for GoogleDriveProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GoogleDrive
    }

    fn refresh_token<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenData>> + Send + 'a>> {
        Box::pin(token::refresh_token(
            &self.http_client,
            &self.config,
            refresh_token,
        ))
    }

    fn has_valid_connection<'a>(
        &'a self,
        access_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(token::token_info(
            &self.http_client,
            &self.config,
            access_token,
        ))
    }

    fn test_connectivity<'a>(
        &'a self,
        access_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(token::about(&self.http_client, &self.config, access_token))
    }
}
