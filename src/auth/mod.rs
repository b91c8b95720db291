//! Auth/Token Manager and connection-string/AuthConfig plumbing.

pub mod config;
pub mod connection_string;
#[cfg(feature = "client")]
pub mod sync_token;
#[cfg(feature = "client")]
pub mod token;

pub use config::{AuthConfig, AuthConfigBuilder, ClientSecret};
#[cfg(feature = "client")]
pub use sync_token::SyncOAuth2TokenManager;
#[cfg(feature = "client")]
pub use token::{OAuth2TokenManager, TokenInfo, DEFAULT_REFRESH_BUFFER_SECONDS};
