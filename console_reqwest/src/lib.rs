//! Middleware to attach console access tokens to outgoing requests
//!
//! Generated console API clients built on
//! [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware) can
//! include the [`AccessTokenMiddleware`] in their middleware stack. Requests
//! bound for the console API get a bearer token from an
//! [`AccessTokenProvider`], usually the shared
//! [`AccessTokenManager`][console_tokens::AccessTokenManager].
//!
//! By default a request is considered bound for the console when its scheme,
//! host and port match the console endpoint and its path lies under the
//! endpoint's base path. Requests to any other host go out untouched, so a
//! client shared with third-party APIs never leaks the console token.
//!
//! A request that already carries an `Authorization` header keeps it, and no
//! token is requested for it.
//!
//! If the provider fails to produce a token, for instance because the
//! console's certificate could not be confirmed as unrevoked, the request is
//! not sent and the failure is returned as
//! [`Error::Middleware`](reqwest_middleware::Error::Middleware).
//!
//! ```
//! use std::sync::Arc;
//!
//! use console_reqwest::AccessTokenMiddleware;
//! use console_tokens::{AccessTokenProvider, Credentials};
//! use reqwest::Client;
//! use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
//!
//! fn console_client(
//!     manager: Arc<dyn AccessTokenProvider>,
//!     credentials: &Credentials,
//! ) -> ClientWithMiddleware {
//!     ClientBuilder::new(Client::default())
//!         .with(AccessTokenMiddleware::new(manager, credentials))
//!         .build()
//! }
//! ```
//!
//! Other predicates can be supplied with
//! [`with_predicate()`][AccessTokenMiddleware::with_predicate()] and composed
//! with the combinators from [`predicates`]:
//!
//! ```
//! # use std::sync::Arc;
//! use console_reqwest::{AccessTokenMiddleware, ExactHostMatch, HttpsOnly};
//! # use console_tokens::{AccessTokenProvider, Credentials};
//! use predicates::prelude::PredicateBooleanExt;
//!
//! # fn middleware(manager: Arc<dyn AccessTokenProvider>, credentials: &Credentials) {
//! let middleware = AccessTokenMiddleware::new(manager, credentials)
//!     .with_predicate(HttpsOnly.and(ExactHostMatch::new("insight.example.com")));
//! # }
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::{fmt, sync::Arc};

use bytes::{BufMut, BytesMut};
use console_tokens::{AccessTokenProvider, AccessTokenRef, Credentials};
use predicates::{reflection, Predicate};
use reqwest::{header, Request, Response};
use reqwest_middleware::{Error, Middleware, Next, Result};

/// A middleware that injects the console access token into outgoing requests
#[derive(Clone)]
pub struct AccessTokenMiddleware<P = ConsoleEndpoint> {
    provider: Arc<dyn AccessTokenProvider>,
    predicate: P,
}

impl<P: fmt::Debug> fmt::Debug for AccessTokenMiddleware<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AccessTokenMiddleware")
            .field("predicate", &self.predicate)
            .finish_non_exhaustive()
    }
}

impl AccessTokenMiddleware {
    /// Constructs a middleware attaching tokens to requests for the console in `credentials`
    pub fn new(provider: Arc<dyn AccessTokenProvider>, credentials: &Credentials) -> Self {
        Self {
            provider,
            predicate: ConsoleEndpoint::of(credentials),
        }
    }
}

impl<P> AccessTokenMiddleware<P> {
    /// Replaces the predicate deciding which requests receive a token
    pub fn with_predicate<Q>(self, predicate: Q) -> AccessTokenMiddleware<Q> {
        AccessTokenMiddleware {
            provider: self.provider,
            predicate,
        }
    }

    async fn bearer_from_provider(&self) -> Result<header::HeaderValue> {
        let token = self.provider.access_token().await.map_err(|error| {
            tracing::error!(%error, "unable to obtain console access token, request not sent");
            Error::middleware(error)
        })?;

        bearer_header(&token).map_err(Error::middleware)
    }
}

fn bearer_header(
    token: &AccessTokenRef,
) -> std::result::Result<header::HeaderValue, header::InvalidHeaderValue> {
    const PREFIX: &[u8] = b"Bearer ";

    let mut buf = BytesMut::with_capacity(PREFIX.len() + token.as_str().len());
    buf.put_slice(PREFIX);
    buf.put_slice(token.as_str().as_bytes());

    let mut value = header::HeaderValue::from_maybe_shared(buf.freeze())?;
    value.set_sensitive(true);
    Ok(value)
}

#[async_trait::async_trait]
impl<P> Middleware for AccessTokenMiddleware<P>
where
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if req.headers().contains_key(header::AUTHORIZATION) {
            tracing::trace!(url = %req.url(), "request already carries authorization");
        } else if self.predicate.eval(&req) {
            let bearer = self.bearer_from_provider().await?;
            req.headers_mut().insert(header::AUTHORIZATION, bearer);
        }

        next.run(req, extensions).await
    }
}

/// Reports a failed expectation along with the request attribute it was decided on
fn mismatch<'a>(
    predicate: &'a dyn reflection::PredicateReflection,
    expected: bool,
    result: bool,
    attribute: &'static str,
    value: impl FnOnce() -> String,
) -> Option<reflection::Case<'a>> {
    (result != expected).then(|| {
        reflection::Case::new(Some(predicate), result)
            .add_product(reflection::Product::new(attribute, value()))
    })
}

/// Matches requests bound for the console API
///
/// Scheme, host and port must equal those of the console endpoint, and the
/// path must lie under the endpoint's base path on a segment boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsoleEndpoint {
    scheme: String,
    host: String,
    port: Option<u16>,
    base_path: String,
}

impl ConsoleEndpoint {
    /// The console endpoint named by `credentials`
    pub fn of(credentials: &Credentials) -> Self {
        let endpoint = credentials.console_endpoint();
        Self {
            scheme: endpoint.scheme().to_owned(),
            host: endpoint.host_str().unwrap_or_default().to_owned(),
            port: endpoint.port_or_known_default(),
            base_path: endpoint.path().trim_end_matches('/').to_owned(),
        }
    }

    fn under_base_path(&self, path: &str) -> bool {
        path.strip_prefix(self.base_path.as_str())
            .map_or(false, |rest| rest.is_empty() || rest.starts_with('/'))
    }
}

impl Predicate<Request> for ConsoleEndpoint {
    fn eval(&self, req: &Request) -> bool {
        let url = req.url();
        url.scheme() == self.scheme
            && url.host_str() == Some(self.host.as_str())
            && url.port_or_known_default() == self.port
            && self.under_base_path(url.path())
    }

    fn find_case<'a>(&'a self, expected: bool, req: &Request) -> Option<reflection::Case<'a>> {
        mismatch(self, expected, self.eval(req), "url", || req.url().to_string())
    }
}

impl reflection::PredicateReflection for ConsoleEndpoint {}
impl fmt::Display for ConsoleEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "url under {}://{}", self.scheme, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}/", self.base_path)
    }
}

/// Matches requests sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case<'a>(&'a self, expected: bool, req: &Request) -> Option<reflection::Case<'a>> {
        mismatch(self, expected, self.eval(req), "scheme", || {
            req.url().scheme().to_owned()
        })
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme == https")
    }
}

/// Matches requests sent to exactly the given host
#[derive(Clone, Debug)]
pub struct ExactHostMatch {
    host: String,
}

impl ExactHostMatch {
    /// Matches `host`
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    /// Matches the host of the console endpoint in `credentials`
    pub fn console(credentials: &Credentials) -> Self {
        Self::new(credentials.console_endpoint().host_str().unwrap_or_default())
    }
}

impl Predicate<Request> for ExactHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(self.host.as_str())
    }

    fn find_case<'a>(&'a self, expected: bool, req: &Request) -> Option<reflection::Case<'a>> {
        mismatch(self, expected, self.eval(req), "host", || {
            req.url().host_str().unwrap_or_default().to_owned()
        })
    }
}

impl reflection::PredicateReflection for ExactHostMatch {}
impl fmt::Display for ExactHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host == {}", self.host)
    }
}
