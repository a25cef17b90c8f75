//! Certificate revocation checks performed before a token is renewed

use async_trait::async_trait;
use url::Url;

use crate::ProxyDescriptor;

#[cfg(feature = "ocsp")]
mod ocsp;

#[cfg(feature = "ocsp")]
#[cfg_attr(docsrs, doc(cfg(feature = "ocsp")))]
pub use ocsp::{OcspError, OcspVerifier, DEFAULT_OCSP_TIMEOUT};

/// The revocation status reported for a certificate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OcspStatus {
    /// The certificate has not been revoked
    Good,
    /// The certificate has been revoked
    Revoked,
    /// The responder does not know the certificate
    Unknown,
}

impl OcspStatus {
    /// Whether the status confirms the certificate as good
    #[inline]
    pub fn is_good(self) -> bool {
        matches!(self, Self::Good)
    }
}

/// A check of the certificate serving an endpoint
///
/// Implementations are fail-closed: `true` is returned only when the
/// certificate is positively confirmed as good. Errors are absorbed into
/// `false` and never escape.
#[async_trait]
pub trait RevocationCheck: Send + Sync {
    /// Checks the certificate serving `target`, connecting through `proxy` if present
    async fn check(&self, target: &Url, proxy: Option<&ProxyDescriptor>) -> bool;
}

#[async_trait]
impl<T: RevocationCheck + ?Sized> RevocationCheck for std::sync::Arc<T> {
    async fn check(&self, target: &Url, proxy: Option<&ProxyDescriptor>) -> bool {
        (**self).check(target, proxy).await
    }
}
