//! Google Drive provider client
//!
//! Implements `provider::CloudProvider` for Google Drive:
//! 1. `refresh_token` POSTs a refresh-token grant to the OAuth token endpoint
//! 2. `has_valid_connection` introspects the access token via `tokeninfo`
//! 3. `test_connectivity` reads the Drive `about` resource
//!
//! Non-success responses are decoded from Google's error envelope into
//! `ProviderFailure::Http` with the reason code preserved, so the classifier
//! can tell storage quota from API rate limits.

pub mod client;
pub mod constants;
pub mod response;
pub mod token;

pub use client::{GoogleConfig, GoogleDriveProvider};
pub use constants::*;
pub use response::failure_from_response;
pub use token::TokenResponse;
