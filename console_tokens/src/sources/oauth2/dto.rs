//! DTOs for interacting with the OAuth2 token endpoint

use serde::{Deserialize, Serialize, Serializer};

use crate::{AccessToken, ClientIdRef, ClientSecretRef};

/// A client credentials grant request
#[derive(Debug)]
pub(super) struct ClientCredentialsRequest<'a> {
    pub client_id: &'a ClientIdRef,
    pub client_secret: &'a ClientSecretRef,
    pub scope: &'a str,
}

impl Serialize for ClientCredentialsRequest<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("ClientCredentialsRequest", 4)?;
        ser.serialize_field("grant_type", "client_credentials")?;
        ser.serialize_field("client_id", self.client_id)?;
        ser.serialize_field("client_secret", self.client_secret)?;
        ser.serialize_field("scope", self.scope)?;
        ser.end()
    }
}

/// The parts of a token response that are used
///
/// Everything besides the access token is discarded.
#[derive(Debug, Deserialize)]
pub(super) struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<AccessToken>,
}
