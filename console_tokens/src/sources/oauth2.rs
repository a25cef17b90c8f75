//! A token source that uses the console portal's OAuth2 server as an authority

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use thiserror::Error;

use super::AsyncTokenSource;
use crate::{proxy, AccessToken, Credentials, ProxyDescriptor};

pub mod dto;

/// The scope requested for console API access
pub const DEFAULT_SCOPE: &str = "system";

/// The default timeout for a token request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A token source performing the client credentials flow
///
/// Credentials are sent to the authorization endpoint as form data.
#[derive(Clone, Debug)]
pub struct ClientCredentialsTokenSource {
    scope: String,
    timeout: Duration,
}

impl Default for ClientCredentialsTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientCredentialsTokenSource {
    /// Constructs a new client credentials source requesting the `system` scope
    pub fn new() -> Self {
        Self {
            scope: DEFAULT_SCOPE.to_owned(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Requests a different scope
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Sets the timeout applied to each token request
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl AsyncTokenSource for ClientCredentialsTokenSource {
    type Error = TokenRequestError;

    async fn request_token(
        &self,
        credentials: &Credentials,
        proxy: Option<&ProxyDescriptor>,
    ) -> Result<AccessToken, Self::Error> {
        let client =
            proxy::http_client(self.timeout, proxy).map_err(TokenRequestError::ClientBuild)?;
        request_token(&client, credentials, &self.scope, proxy.is_some()).await
    }
}

/// An error while attempting to request a new token from the authority
#[derive(Debug, Error)]
pub enum TokenRequestError {
    /// The authority answered with a status other than success
    ///
    /// Redirects land here as well, since they are not followed.
    #[error("authority responded with {status}: {body}")]
    ErrorWithBody {
        /// The status returned by the authority
        status: StatusCode,
        /// The body of the response
        body: String,
    },
    /// Unable to deserialize the token body
    #[error("error deserializing token body from authority")]
    TokenBodyError(#[from] serde_json::Error),
    /// The token body did not contain an access token
    #[error("token body from authority did not contain an access token")]
    MissingAccessToken,
    /// Unable to read the response
    #[error("error reading response body")]
    BodyReadError(#[source] reqwest::Error),
    /// Unable to send a token request to the authority
    #[error("error sending request to authority")]
    RequestSend(#[source] reqwest::Error),
    /// Unable to set up the HTTP client for the request
    #[error("error configuring HTTP client")]
    ClientBuild(#[source] reqwest::Error),
}

#[tracing::instrument(
    err,
    skip(client, credentials, scope),
    fields(
        token_url = %credentials.authorization_endpoint(),
        credentials.grant_type = "client_credentials",
        credentials.client_id = %credentials.client_id(),
        credentials.scope = scope,
    ),
)]
async fn request_token(
    client: &reqwest::Client,
    credentials: &Credentials,
    scope: &str,
    proxied: bool,
) -> Result<AccessToken, TokenRequestError> {
    tracing::trace!("requesting token from authority");

    let payload = dto::ClientCredentialsRequest {
        client_id: credentials.client_id(),
        client_secret: credentials.client_secret(),
        scope,
    };

    let resp = client
        .post(credentials.authorization_endpoint().clone())
        .header(header::ACCEPT, "application/json")
        .form(&payload)
        .send()
        .await
        .map_err(TokenRequestError::RequestSend)?;

    tracing::debug!(
        response.status = resp.status().as_u16(),
        "received token response from issuing authority"
    );

    let status = resp.status();
    if !status.is_success() {
        let body = resp
            .text()
            .await
            .map_err(TokenRequestError::BodyReadError)?;
        return Err(TokenRequestError::ErrorWithBody { status, body });
    }

    let body = resp
        .bytes()
        .await
        .map_err(TokenRequestError::BodyReadError)?;
    let resp: dto::TokenResponse = serde_json::from_slice(&body)?;

    let token = resp
        .access_token
        .filter(|t| !t.as_str().is_empty())
        .ok_or(TokenRequestError::MissingAccessToken)?;

    tracing::info!("received new access token");

    Ok(token)
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use serde_json::json;
    use tracing_test::traced_test;
    use wiremock::{
        matchers::{body_string, header as header_is, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    async fn credentials_for(server: &MockServer) -> Credentials {
        Credentials::builder()
            .console_endpoint("https://c.example")
            .authorization_endpoint(format!("{}/oauth2/token", server.uri()))
            .client_id("id1")
            .client_secret("secret1")
            .build_with(|_| None)
            .unwrap()
    }

    #[tokio::test]
    #[traced_test]
    async fn posts_client_credentials_as_form_data() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .and(header_is("content-type", "application/x-www-form-urlencoded"))
            .and(header_is("accept", "application/json"))
            .and(body_string(
                "grant_type=client_credentials&client_id=id1&client_secret=secret1&scope=system",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok-abc",
                "token_type": "Bearer",
                "expires_in": 3600,
                "scope": "system",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let credentials = credentials_for(&server).await;
        let token = ClientCredentialsTokenSource::new()
            .request_token(&credentials, None)
            .await?;

        assert_eq!(token.as_str(), "tok-abc");
        assert!(logs_contain("received new access token"));
        Ok(())
    }

    #[tokio::test]
    async fn requests_custom_scope() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string(
                "grant_type=client_credentials&client_id=id1&client_secret=secret1&scope=device.read",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok-scoped",
            })))
            .mount(&server)
            .await;

        let credentials = credentials_for(&server).await;
        let token = ClientCredentialsTokenSource::new()
            .with_scope("device.read")
            .request_token(&credentials, None)
            .await?;

        assert_eq!(token.as_str(), "tok-scoped");
        Ok(())
    }

    mod when_authority_rejects_the_request {
        use super::*;

        #[tokio::test]
        async fn error_carries_status_and_body() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(
                    ResponseTemplate::new(401).set_body_string(r#"{"error":"invalid_client"}"#),
                )
                .mount(&server)
                .await;

            let credentials = credentials_for(&server).await;
            let error = ClientCredentialsTokenSource::new()
                .request_token(&credentials, None)
                .await
                .unwrap_err();

            match error {
                TokenRequestError::ErrorWithBody { status, body, .. } => {
                    assert_eq!(status, StatusCode::UNAUTHORIZED);
                    assert_eq!(body, r#"{"error":"invalid_client"}"#);
                }
                other => panic!("unexpected error: {:?}", other),
            }
        }

        #[tokio::test]
        async fn redirect_does_not_resend_credentials() {
            let elsewhere = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "access_token": "tok-from-elsewhere",
                })))
                .expect(0)
                .mount(&elsewhere)
                .await;

            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/oauth2/token"))
                .respond_with(
                    ResponseTemplate::new(307)
                        .insert_header("location", format!("{}/oauth2/token", elsewhere.uri())),
                )
                .expect(1)
                .mount(&server)
                .await;

            let credentials = credentials_for(&server).await;
            let error = ClientCredentialsTokenSource::new()
                .request_token(&credentials, None)
                .await
                .unwrap_err();

            match error {
                TokenRequestError::ErrorWithBody { status, .. } => {
                    assert_eq!(status, StatusCode::TEMPORARY_REDIRECT)
                }
                other => panic!("unexpected error: {:?}", other),
            }
        }

        #[tokio::test]
        async fn permanent_redirect_is_an_error() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(
                    ResponseTemplate::new(308).insert_header("location", "https://a2.example/token"),
                )
                .mount(&server)
                .await;

            let credentials = credentials_for(&server).await;
            let error = ClientCredentialsTokenSource::new()
                .request_token(&credentials, None)
                .await
                .unwrap_err();

            assert!(matches!(
                error,
                TokenRequestError::ErrorWithBody { status, .. } if status == StatusCode::PERMANENT_REDIRECT
            ));
        }
    }

    mod when_authority_returns_an_unusable_body {
        use super::*;

        #[tokio::test]
        async fn missing_access_token_is_an_error() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(
                    ResponseTemplate::new(200).set_body_json(json!({ "token_type": "Bearer" })),
                )
                .mount(&server)
                .await;

            let credentials = credentials_for(&server).await;
            let error = ClientCredentialsTokenSource::new()
                .request_token(&credentials, None)
                .await
                .unwrap_err();

            assert!(matches!(error, TokenRequestError::MissingAccessToken));
        }

        #[tokio::test]
        async fn non_json_body_is_an_error() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
                .mount(&server)
                .await;

            let credentials = credentials_for(&server).await;
            let error = ClientCredentialsTokenSource::new()
                .request_token(&credentials, None)
                .await
                .unwrap_err();

            assert!(matches!(error, TokenRequestError::TokenBodyError(_)));
        }
    }

    mod when_authority_is_unreachable {
        use super::*;

        #[tokio::test]
        async fn send_failure_is_an_error() {
            let credentials = Credentials::builder()
                .console_endpoint("https://c.example")
                .authorization_endpoint("http://127.0.0.1:1/oauth2/token")
                .client_id("id1")
                .client_secret("secret1")
                .build_with(|_| None)
                .unwrap();

            let error = ClientCredentialsTokenSource::new()
                .with_timeout(Duration::from_secs(2))
                .request_token(&credentials, None)
                .await
                .unwrap_err();

            assert!(matches!(error, TokenRequestError::RequestSend(_)));
        }
    }

    mod when_a_proxy_is_configured {
        use super::*;

        #[tokio::test]
        async fn request_is_sent_through_the_proxy() -> Result<()> {
            // The mock server stands in for the proxy and answers for the real host.
            let proxy_server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "access_token": "tok-proxied",
                })))
                .expect(1)
                .mount(&proxy_server)
                .await;

            let credentials = Credentials::builder()
                .console_endpoint("https://c.example")
                .authorization_endpoint("http://a.example/oauth2/token")
                .client_id("id1")
                .client_secret("secret1")
                .build_with(|_| None)?;
            let proxy = ProxyDescriptor::parse(&proxy_server.uri());

            let token = ClientCredentialsTokenSource::new()
                .request_token(&credentials, Some(&proxy))
                .await?;

            assert_eq!(token.as_str(), "tok-proxied");
            Ok(())
        }
    }
}
