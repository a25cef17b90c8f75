//! Access token management for clients of the device console API
//!
//! Every call to the console API needs a bearer token issued by the portal's
//! OAuth2 authorization endpoint through the _client credentials_ flow. This
//! crate keeps that token cached and renews it only when it is about to
//! expire.
//!
//! Before any renewal, the TLS certificates of both the console and the
//! authorization endpoint are checked for revocation with OCSP. If either
//! certificate cannot be confirmed as good, the renewal is refused and no
//! credentials are sent anywhere.
//!
//! Outbound connections use the proxy named by `https_proxy` or
//! `HTTPS_PROXY`, read afresh for each renewal.
//!
//! # General Flow
//!
//! Credentials are taken from the builder, falling back to the
//! `CONSOLE_ENDPOINT`, `PORTAL_AUTHORIZATION_ENDPOINT`, `CLIENT_ID` and
//! `CLIENT_SECRET` environment variables for anything not set explicitly.
//! The manager is then shared by everything that talks to the console.
//!
//! ```
//! use console_tokens::{ConsoleTokenManager, Credentials};
//!
//! # fn main() -> Result<(), console_tokens::ConfigValidationError> {
//! let credentials = Credentials::builder()
//!     .console_endpoint("https://console.example.com/api")
//!     .authorization_endpoint("https://portal.example.com/oauth2/token")
//!     .client_id("device-client")
//!     .client_secret("s3cr3t")
//!     .build()?;
//!
//! let manager = ConsoleTokenManager::from_credentials(credentials);
//! # /* Commented out due to this trying to interact with the world.
//! let token = manager.access_token().await?;
//! # */
//! # let _ = manager;
//! # Ok(())
//! # }
//! ```
//!
//! Parameters bound for the console API can be checked up front by
//! implementing [`Validate`][validation::Validate].
//!
//! # Features
//!
//! * `ocsp` (default): Provides [`OcspVerifier`][revocation::OcspVerifier] and
//!   the [`ConsoleTokenManager`] built on it.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
mod credentials;
mod error;
mod manager;
mod proxy;
pub mod revocation;
pub mod sources;
mod tokens;
pub mod validation;

pub use braids::*;
pub use credentials::{
    Credentials, CredentialsBuilder, AUTHORIZATION_ENDPOINT_VAR, CLIENT_ID_VAR, CLIENT_SECRET_VAR,
    CONSOLE_ENDPOINT_VAR,
};
pub use error::{ConfigValidationError, Error, SharedError};
#[cfg(feature = "ocsp")]
pub use manager::ConsoleTokenManager;
pub use manager::{
    AccessTokenManager, AccessTokenProvider, ApiConfiguration, ManagerConfig, TokenState,
};
pub use proxy::{resolve_with, ProxyAuth, ProxyDescriptor, ProxyResolver, HTTPS_PROXY_VARS};
pub use tokens::{CachedToken, TokenLifetimeConfig, TokenValidity, DEFAULT_EXPIRY_MARGIN_SECS};
pub use tokio_util::sync::CancellationToken;
