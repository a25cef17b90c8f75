//! Credentials for the console and its authorization endpoint

use url::Url;

use crate::{
    validation::FieldErrors, ClientId, ClientIdRef, ClientSecret, ClientSecretRef,
    ConfigValidationError,
};

/// Environment variable holding the console API base URL
pub const CONSOLE_ENDPOINT_VAR: &str = "CONSOLE_ENDPOINT";
/// Environment variable holding the token endpoint URL
pub const AUTHORIZATION_ENDPOINT_VAR: &str = "PORTAL_AUTHORIZATION_ENDPOINT";
/// Environment variable holding the client ID
pub const CLIENT_ID_VAR: &str = "CLIENT_ID";
/// Environment variable holding the client secret
pub const CLIENT_SECRET_VAR: &str = "CLIENT_SECRET";

/// Resolved, immutable credentials
#[derive(Clone, Debug)]
pub struct Credentials {
    console_endpoint: Url,
    authorization_endpoint: Url,
    client_id: ClientId,
    client_secret: ClientSecret,
}

impl Credentials {
    /// Starts building credentials
    pub fn builder() -> CredentialsBuilder {
        CredentialsBuilder::default()
    }

    /// Resolves credentials entirely from the process environment
    pub fn from_env() -> Result<Self, ConfigValidationError> {
        Self::builder().build()
    }

    /// The console API base URL
    #[inline]
    pub fn console_endpoint(&self) -> &Url {
        &self.console_endpoint
    }

    /// The OAuth2 token endpoint
    #[inline]
    pub fn authorization_endpoint(&self) -> &Url {
        &self.authorization_endpoint
    }

    /// The client ID
    #[inline]
    pub fn client_id(&self) -> &ClientIdRef {
        &self.client_id
    }

    /// The client secret
    #[inline]
    pub fn client_secret(&self) -> &ClientSecretRef {
        &self.client_secret
    }
}

/// A builder for [`Credentials`]
///
/// Any field left unset is taken from its environment variable when the
/// credentials are built. Once built, the values never change.
#[derive(Clone, Debug, Default)]
pub struct CredentialsBuilder {
    console_endpoint: Option<String>,
    authorization_endpoint: Option<String>,
    client_id: Option<ClientId>,
    client_secret: Option<ClientSecret>,
}

impl CredentialsBuilder {
    /// Sets the console API base URL
    pub fn console_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.console_endpoint = Some(endpoint.into());
        self
    }

    /// Sets the OAuth2 token endpoint
    pub fn authorization_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.authorization_endpoint = Some(endpoint.into());
        self
    }

    /// Sets the client ID
    pub fn client_id(mut self, client_id: impl Into<ClientId>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Sets the client secret
    pub fn client_secret(mut self, client_secret: impl Into<ClientSecret>) -> Self {
        self.client_secret = Some(client_secret.into());
        self
    }

    /// Builds the credentials, falling back to the process environment
    pub fn build(self) -> Result<Credentials, ConfigValidationError> {
        self.build_with(|name| std::env::var(name).ok())
    }

    /// Builds the credentials, falling back to variables found by `lookup`
    pub fn build_with<F>(self, lookup: F) -> Result<Credentials, ConfigValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut errors = FieldErrors::new();

        let console_endpoint = endpoint(
            &mut errors,
            "console_endpoint",
            self.console_endpoint.or_else(|| lookup(CONSOLE_ENDPOINT_VAR)),
        );
        let authorization_endpoint = endpoint(
            &mut errors,
            "authorization_endpoint",
            self.authorization_endpoint
                .or_else(|| lookup(AUTHORIZATION_ENDPOINT_VAR)),
        );
        let client_id = required(
            &mut errors,
            "client_id",
            self.client_id
                .or_else(|| lookup(CLIENT_ID_VAR).map(ClientId::new)),
            |v| v.as_str(),
        );
        let client_secret = required(
            &mut errors,
            "client_secret",
            self.client_secret
                .or_else(|| lookup(CLIENT_SECRET_VAR).map(ClientSecret::new)),
            |v| v.as_str(),
        );

        match (
            console_endpoint,
            authorization_endpoint,
            client_id,
            client_secret,
        ) {
            (Some(console_endpoint), Some(authorization_endpoint), Some(client_id), Some(client_secret))
                if errors.is_empty() =>
            {
                tracing::debug!(
                    console_endpoint = %console_endpoint,
                    authorization_endpoint = %authorization_endpoint,
                    client_id = %client_id,
                    "resolved console credentials"
                );
                Ok(Credentials {
                    console_endpoint,
                    authorization_endpoint,
                    client_id,
                    client_secret,
                })
            }
            _ => Err(ConfigValidationError::new(errors.into_inner())),
        }
    }
}

fn required<T>(
    errors: &mut FieldErrors,
    field: &'static str,
    value: Option<T>,
    as_str: impl Fn(&T) -> &str,
) -> Option<T> {
    match value {
        Some(v) if !as_str(&v).trim().is_empty() => Some(v),
        Some(_) => {
            errors.push(field, "must not be empty");
            None
        }
        None => {
            errors.push(field, "is required");
            None
        }
    }
}

fn endpoint(errors: &mut FieldErrors, field: &'static str, value: Option<String>) -> Option<Url> {
    let raw = required(errors, field, value, |v| v.as_str())?;
    match Url::parse(raw.trim()) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => Some(url),
        Ok(url) => {
            errors.push(
                field,
                format!("must be an http or https URL with a host, got {}", url),
            );
            None
        }
        Err(error) => {
            errors.push(field, format!("is not a valid URL: {}", error));
            None
        }
    }
}
