//! The access token manager
//!
//! The manager hands out a cached token for as long as it is valid beyond the
//! expiry margin. Once it is not, the certificates of both the console and the
//! authorization endpoint are checked for revocation, and only then is a new
//! token requested.

use std::{
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use aliri_clock::{Clock, System};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    revocation::RevocationCheck, sources::AsyncTokenSource, tokens::DEFAULT_EXPIRY_MARGIN_SECS,
    AccessToken, AccessTokenRef, CachedToken, Credentials, Error, ProxyDescriptor, ProxyResolver,
    TokenLifetimeConfig, TokenValidity,
};

/// The state of the manager's cached token
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenState {
    /// No token has been acquired yet
    NoToken,
    /// The cached token can be used
    Valid,
    /// The cached token expires within the expiry margin
    Expired,
    /// The cached token's expiry cannot be determined
    Invalid,
}

/// A source of access tokens that are valid for immediate use
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// Gets a valid access token, renewing it if necessary
    async fn access_token(&self) -> Result<AccessToken, Error>;
}

/// Settings for a manager built with the default token source and verifier
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    expiry_margin: u64,
    ocsp_timeout: Duration,
    request_timeout: Duration,
    scope: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            expiry_margin: DEFAULT_EXPIRY_MARGIN_SECS,
            ocsp_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            scope: crate::sources::oauth2::DEFAULT_SCOPE.to_owned(),
        }
    }
}

impl ManagerConfig {
    /// Sets the number of seconds before expiry at which a token is renewed
    pub fn with_expiry_margin(mut self, secs: u64) -> Self {
        self.expiry_margin = secs;
        self
    }

    /// Sets the time allowed for each certificate revocation check
    pub fn with_ocsp_timeout(mut self, timeout: Duration) -> Self {
        self.ocsp_timeout = timeout;
        self
    }

    /// Sets the time allowed for each token request
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the scope requested with each token
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// The expiry margin in seconds
    pub fn expiry_margin(&self) -> u64 {
        self.expiry_margin
    }

    /// The revocation check timeout
    pub fn ocsp_timeout(&self) -> Duration {
        self.ocsp_timeout
    }

    /// The token request timeout
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// The requested scope
    pub fn scope(&self) -> &str {
        &self.scope
    }
}

/// Everything a generated console API client needs to make a call
#[derive(Clone, Debug)]
pub struct ApiConfiguration {
    base_path: Url,
    access_token: AccessToken,
    proxy: Option<ProxyDescriptor>,
}

impl ApiConfiguration {
    /// The base path of the console API
    pub fn base_path(&self) -> &Url {
        &self.base_path
    }

    /// The bearer token to present
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// The proxy the client should connect through
    pub fn proxy(&self) -> Option<&ProxyDescriptor> {
        self.proxy.as_ref()
    }

    /// Splits the configuration into its parts
    pub fn into_parts(self) -> (Url, AccessToken, Option<ProxyDescriptor>) {
        (self.base_path, self.access_token, self.proxy)
    }
}

#[derive(Debug, Default)]
struct CacheSlot {
    token: Option<CachedToken>,
    /// Bumped every time a renewal completes, successfully or not
    generation: u64,
}

/// Manages the lifecycle of the access token for a set of credentials
///
/// A manager is meant to be shared, usually behind an `Arc`. At most one
/// renewal is in flight at a time; callers that find the token in need of
/// renewal while another renewal is running wait for it and receive its
/// outcome, whether a token or an error.
pub struct AccessTokenManager<S, R, C = System> {
    credentials: Credentials,
    source: S,
    revocation: R,
    proxy: ProxyResolver,
    lifetime: TokenLifetimeConfig<C>,
    cache: Mutex<CacheSlot>,
    renewal: tokio::sync::Mutex<Option<Result<AccessToken, Error>>>,
}

impl<S, R, C> fmt::Debug for AccessTokenManager<S, R, C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AccessTokenManager")
            .field("credentials", &self.credentials)
            .field("proxy", &self.proxy)
            .finish_non_exhaustive()
    }
}

impl<S, R> AccessTokenManager<S, R>
where
    S: AsyncTokenSource,
    R: RevocationCheck,
{
    /// Constructs a manager with an empty cache
    ///
    /// The proxy is read from the process environment and tokens are renewed
    /// 180 seconds before they expire.
    pub fn new(credentials: Credentials, source: S, revocation: R) -> Self {
        Self {
            credentials,
            source,
            revocation,
            proxy: ProxyResolver::from_env(),
            lifetime: TokenLifetimeConfig::default(),
            cache: Mutex::new(CacheSlot::default()),
            renewal: tokio::sync::Mutex::new(None),
        }
    }
}

impl<S, R, C> AccessTokenManager<S, R, C> {
    /// Resolves the proxy using a custom resolver
    pub fn with_proxy_resolver(mut self, proxy: ProxyResolver) -> Self {
        self.proxy = proxy;
        self
    }

    /// Replaces the token lifetime configuration
    pub fn with_lifetime_config<D>(self, lifetime: TokenLifetimeConfig<D>) -> AccessTokenManager<S, R, D> {
        AccessTokenManager {
            credentials: self.credentials,
            source: self.source,
            revocation: self.revocation,
            proxy: self.proxy,
            lifetime,
            cache: self.cache,
            renewal: self.renewal,
        }
    }

    /// Uses a custom clock when checking token validity
    pub fn with_clock<D>(self, clock: D) -> AccessTokenManager<S, R, D> {
        let lifetime = TokenLifetimeConfig::new(self.lifetime.expiry_margin()).with_clock(clock);
        self.with_lifetime_config(lifetime)
    }

    /// The credentials tokens are requested for
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    fn lock_cache(&self) -> MutexGuard<'_, CacheSlot> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S, R, C> AccessTokenManager<S, R, C>
where
    S: AsyncTokenSource,
    R: RevocationCheck,
    C: Clock + Send + Sync,
{
    /// The current state of the cached token
    ///
    /// Never performs any network activity.
    pub fn token_state(&self) -> TokenState {
        let slot = self.lock_cache();
        match &slot.token {
            None => TokenState::NoToken,
            Some(token) => match self.lifetime.validity_of(Some(token)) {
                TokenValidity::Valid => TokenState::Valid,
                TokenValidity::Expired => TokenState::Expired,
                TokenValidity::Invalid => TokenState::Invalid,
            },
        }
    }

    /// Gets a token that is valid beyond the expiry margin
    ///
    /// The cached token is returned when it is valid. Otherwise both endpoint
    /// certificates are checked and a new token is requested. A failed
    /// renewal leaves the cached token in place.
    pub async fn access_token(&self) -> Result<AccessToken, Error> {
        let observed = {
            let slot = self.lock_cache();
            let validity = self.lifetime.validity_of(slot.token.as_ref());
            match (&slot.token, validity) {
                (Some(token), TokenValidity::Valid) => {
                    tracing::trace!("using cached access token");
                    return Ok(token.access_token().to_owned());
                }
                _ => {
                    tracing::trace!(?validity, "cached access token needs renewal");
                    slot.generation
                }
            }
        };

        let mut last_outcome = self.renewal.lock().await;

        if self.lock_cache().generation != observed {
            if let Some(outcome) = last_outcome.as_ref() {
                tracing::debug!("using outcome of renewal completed while waiting");
                return outcome.clone();
            }
        }

        let outcome = self.renew().await;

        let outcome = {
            let mut slot = self.lock_cache();
            slot.generation = slot.generation.wrapping_add(1);
            outcome.map(|cached| {
                let token = cached.access_token().to_owned();
                slot.token = Some(cached);
                token
            })
        };

        *last_outcome = Some(outcome.clone());
        outcome
    }

    /// Gets a valid token, giving up once `cancel` is triggered
    ///
    /// A renewal abandoned this way leaves the cache unchanged, and the next
    /// caller starts a new one.
    pub async fn access_token_with_cancellation(
        &self,
        cancel: &CancellationToken,
    ) -> Result<AccessToken, Error> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("access token request cancelled");
                Err(Error::Cancelled)
            }
            result = self.access_token() => result,
        }
    }

    /// Builds the configuration for a generated console API client
    ///
    /// Obtains a valid token first, so this fails in the same ways as
    /// [`access_token()`][Self::access_token()].
    pub async fn api_configuration(&self) -> Result<ApiConfiguration, Error> {
        let access_token = self.access_token().await?;
        Ok(ApiConfiguration {
            base_path: self.credentials.console_endpoint().clone(),
            access_token,
            proxy: self.proxy.resolve(),
        })
    }

    #[tracing::instrument(
        skip(self),
        fields(
            console = %self.credentials.console_endpoint(),
            authorization = %self.credentials.authorization_endpoint(),
        )
    )]
    async fn renew(&self) -> Result<CachedToken, Error> {
        let proxy = self.proxy.resolve();

        for endpoint in [
            self.credentials.console_endpoint(),
            self.credentials.authorization_endpoint(),
        ] {
            if !self.revocation.check(endpoint, proxy.as_ref()).await {
                tracing::error!(
                    %endpoint,
                    "certificate not confirmed good, refusing to request a token"
                );
                return Err(Error::CertificateRevoked {
                    endpoint: endpoint.clone(),
                });
            }
        }

        let token = self
            .source
            .request_token(&self.credentials, proxy.as_ref())
            .await
            .map_err(|error| {
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    "failed to acquire access token"
                );
                Error::acquisition(error)
            })?;

        let cached = CachedToken::new(token);
        let validity = cached.validity_at(self.lifetime.now(), self.lifetime.expiry_margin());
        if validity != TokenValidity::Valid {
            tracing::warn!(?validity, "newly acquired token is not valid beyond the expiry margin");
        }

        Ok(cached)
    }
}

#[async_trait]
impl<S, R, C> AccessTokenProvider for AccessTokenManager<S, R, C>
where
    S: AsyncTokenSource,
    R: RevocationCheck,
    C: Clock + Send + Sync,
{
    async fn access_token(&self) -> Result<AccessToken, Error> {
        AccessTokenManager::access_token(self).await
    }
}

#[cfg(feature = "ocsp")]
mod console {
    use super::*;
    use crate::{
        revocation::OcspVerifier, sources::oauth2::ClientCredentialsTokenSource,
        ConfigValidationError,
    };

    /// A manager using the console's OAuth2 authority and OCSP revocation checks
    #[cfg_attr(docsrs, doc(cfg(feature = "ocsp")))]
    pub type ConsoleTokenManager = AccessTokenManager<ClientCredentialsTokenSource, OcspVerifier>;

    impl AccessTokenManager<ClientCredentialsTokenSource, OcspVerifier> {
        /// Constructs a manager with the default configuration
        pub fn from_credentials(credentials: Credentials) -> Self {
            Self::with_config(credentials, ManagerConfig::default())
        }

        /// Constructs a manager with a custom configuration
        pub fn with_config(credentials: Credentials, config: ManagerConfig) -> Self {
            let source = ClientCredentialsTokenSource::new()
                .with_scope(config.scope())
                .with_timeout(config.request_timeout());
            let revocation = OcspVerifier::new().with_timeout(config.ocsp_timeout());

            Self::new(credentials, source, revocation)
                .with_lifetime_config(TokenLifetimeConfig::new(config.expiry_margin()))
        }

        /// Constructs a manager with credentials taken from the environment
        pub fn from_env() -> Result<Self, ConfigValidationError> {
            Ok(Self::from_credentials(Credentials::from_env()?))
        }
    }
}

#[cfg(feature = "ocsp")]
pub use console::ConsoleTokenManager;
