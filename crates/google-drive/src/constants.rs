//! Google OAuth and Drive endpoints
//!
//! Public endpoint defaults. Client credentials are not constants: the client
//! id comes from config and the secret from the environment.

/// Token endpoint for refresh-token grants
pub const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

/// Access token introspection endpoint
pub const TOKENINFO_ENDPOINT: &str = "https://oauth2.googleapis.com/tokeninfo";

/// Drive REST API base
pub const DRIVE_API_BASE: &str = "https://www.googleapis.com";

/// Cheapest authenticated Drive call: the `about` resource with a single field.
pub const ABOUT_PATH: &str = "/drive/v3/about?fields=user";

/// Scope required for app-created upload folders.
pub const DRIVE_FILE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";
