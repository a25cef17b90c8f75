use std::{error, sync::Arc};

use thiserror::Error;
use url::Url;

use crate::validation::{join, FieldError};

/// A shareable source error
pub type SharedError = Arc<dyn error::Error + Send + Sync + 'static>;

/// An error while obtaining an access token from the manager
///
/// Errors are cheap to clone so that callers waiting on the same renewal
/// all receive its outcome.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The endpoint's certificate could not be confirmed as good
    ///
    /// No token request was sent. Revocation status that could not be
    /// determined is reported the same way as a revoked certificate.
    #[error("certificate for {endpoint} could not be confirmed as unrevoked")]
    CertificateRevoked {
        /// The endpoint whose certificate failed the check
        endpoint: Url,
    },
    /// The authorization endpoint did not provide a token
    #[error("unable to acquire an access token")]
    Acquisition(#[source] SharedError),
    /// The caller gave up before a token was available
    #[error("access token request was cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn acquisition<E>(error: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        Self::Acquisition(Arc::new(error))
    }
}

/// Required credentials were missing or malformed
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid console credentials: {}", join(.fields))]
pub struct ConfigValidationError {
    fields: Vec<FieldError>,
}

impl ConfigValidationError {
    pub(crate) fn new(fields: Vec<FieldError>) -> Self {
        Self { fields }
    }

    /// The offending fields
    pub fn fields(&self) -> &[FieldError] {
        &self.fields
    }
}
