//! Token sources

use std::error;

use async_trait::async_trait;

use crate::{AccessToken, Credentials, ProxyDescriptor};

pub mod oauth2;

/// An asynchronous source for tokens
#[async_trait]
pub trait AsyncTokenSource: Send + Sync {
    /// The error type returned in the event that retrieving a token fails
    type Error: error::Error + Send + Sync + 'static;

    /// Requests a fresh token for `credentials`, optionally through `proxy`
    async fn request_token(
        &self,
        credentials: &Credentials,
        proxy: Option<&ProxyDescriptor>,
    ) -> Result<AccessToken, Self::Error>;
}
