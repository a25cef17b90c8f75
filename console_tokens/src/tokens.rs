use aliri_base64::Base64Url;
use aliri_clock::{Clock, System, UnixTime};
use serde::Deserialize;
use thiserror::Error;

use crate::{AccessToken, AccessTokenRef};

/// The default number of seconds before expiry at which a token stops being usable
pub const DEFAULT_EXPIRY_MARGIN_SECS: u64 = 180;

/// A token held by the manager along with its decoded expiry claim
///
/// The expiry is read out of the token itself and is never tracked separately
/// from it. A token whose expiry claim cannot be decoded has no expiry and is
/// always considered [`Invalid`][TokenValidity::Invalid].
#[derive(Clone, Debug)]
pub struct CachedToken {
    access_token: AccessToken,
    expiry: Option<i64>,
}

/// The validity of a cached token with respect to the expiry margin
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenValidity {
    /// The token has more than the expiry margin left
    Valid,
    /// The token expires within the expiry margin, or has already expired
    Expired,
    /// The token is absent or its expiry claim cannot be decoded
    Invalid,
}

impl CachedToken {
    /// Wraps an access token, decoding its expiry claim
    pub fn new(access_token: AccessToken) -> Self {
        let expiry = match decode_expiry(&access_token) {
            Ok(exp) => Some(exp),
            Err(error) => {
                tracing::trace!(
                    error = (&error as &dyn std::error::Error),
                    "unable to decode expiry claim from access token"
                );
                None
            }
        };

        Self {
            access_token,
            expiry,
        }
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the decoded expiry claim, in seconds since the Unix epoch
    #[inline]
    pub fn expiry(&self) -> Option<i64> {
        self.expiry
    }

    /// Gets the number of seconds the token has left as of the provided time
    ///
    /// Negative once the token has expired.
    #[inline]
    pub fn remaining_at(&self, time: UnixTime) -> Option<i64> {
        let now = i64::try_from(time.0).unwrap_or(i64::MAX);
        self.expiry.map(|exp| exp.saturating_sub(now))
    }

    /// Gets the token's validity as of the provided time
    pub fn validity_at(&self, time: UnixTime, margin_secs: u64) -> TokenValidity {
        let margin = i64::try_from(margin_secs).unwrap_or(i64::MAX);
        match self.remaining_at(time) {
            None => TokenValidity::Invalid,
            Some(remaining) if remaining <= margin => TokenValidity::Expired,
            Some(_) => TokenValidity::Valid,
        }
    }
}

/// Configuration for deciding when a cached token must be renewed
#[derive(Clone, Debug)]
pub struct TokenLifetimeConfig<C = System> {
    expiry_margin: u64,
    clock: C,
}

impl Default for TokenLifetimeConfig {
    /// Default lifetime configuration
    ///
    /// Uses an expiry margin of 180 seconds and the system clock.
    fn default() -> Self {
        Self {
            expiry_margin: DEFAULT_EXPIRY_MARGIN_SECS,
            clock: System,
        }
    }
}

impl TokenLifetimeConfig {
    /// Constructs a lifetime configuration with a custom expiry margin
    ///
    /// Tokens with `expiry_margin` seconds or fewer remaining are treated as expired.
    pub fn new(expiry_margin: u64) -> Self {
        Self {
            expiry_margin,
            clock: System,
        }
    }
}

impl<C> TokenLifetimeConfig<C> {
    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> TokenLifetimeConfig<D> {
        TokenLifetimeConfig {
            expiry_margin: self.expiry_margin,
            clock,
        }
    }

    /// The expiry margin in seconds
    #[inline]
    pub fn expiry_margin(&self) -> u64 {
        self.expiry_margin
    }
}

impl<C: Clock> TokenLifetimeConfig<C> {
    /// The current time according to the configured clock
    #[inline]
    pub fn now(&self) -> UnixTime {
        self.clock.now()
    }

    /// Evaluates the validity of a possibly absent token right now
    pub fn validity_of(&self, token: Option<&CachedToken>) -> TokenValidity {
        token.map_or(TokenValidity::Invalid, |t| {
            t.validity_at(self.clock.now(), self.expiry_margin)
        })
    }
}

#[derive(Debug, Error)]
enum ExpiryDecodeError {
    #[error("token is not made up of three segments")]
    Malformed,
    #[error("token payload is not valid base64url")]
    Payload(#[from] aliri_base64::InvalidBase64Data),
    #[error("token payload does not carry a numeric expiry claim")]
    Claims(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct ExpiryClaim {
    exp: f64,
}

macro_rules! expect_three {
    ($iter:expr) => {{
        let mut i = $iter;
        match (i.next(), i.next(), i.next(), i.next()) {
            (Some(first), Some(second), Some(third), None) => Some((first, second, third)),
            _ => None,
        }
    }};
}

/// Reads the `exp` claim out of a JWT without verifying its signature
///
/// The token was issued to this client by its own authorization endpoint, so
/// only its lifetime is of interest here.
fn decode_expiry(token: &AccessTokenRef) -> Result<i64, ExpiryDecodeError> {
    let (_header, payload, _signature) =
        expect_three!(token.as_str().split('.')).ok_or(ExpiryDecodeError::Malformed)?;
    let raw = Base64Url::from_encoded(payload)?;
    let claim: ExpiryClaim = serde_json::from_slice(raw.as_slice())?;
    Ok(claim.exp.floor() as i64)
}

#[cfg(test)]
pub(crate) mod test_util {
    use aliri_base64::Base64Url;

    use crate::AccessToken;

    /// Builds an unsigned JWT-shaped token expiring at `exp`
    pub(crate) fn token_expiring_at(exp: i64) -> AccessToken {
        token_with_payload(&format!(r#"{{"sub":"device-client","exp":{}}}"#, exp))
    }

    pub(crate) fn token_with_payload(payload: &str) -> AccessToken {
        let header = Base64Url::from_raw(r#"{"alg":"RS256","typ":"JWT"}"#.as_bytes());
        let payload = Base64Url::from_raw(payload.as_bytes());
        AccessToken::new(format!("{}.{}.c2lnbmF0dXJl", header, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    const NOW: UnixTime = UnixTime(1_700_000_000);

    fn cached_with_remaining(remaining: i64) -> CachedToken {
        CachedToken::new(token_expiring_at(1_700_000_000 + remaining))
    }

    mod when_expiry_claim_decodes {
        use super::*;

        #[test]
        fn token_with_more_than_margin_remaining_is_valid() {
            for remaining in [181, 600, 3600, 86_400] {
                let token = cached_with_remaining(remaining);
                assert_eq!(
                    token.validity_at(NOW, DEFAULT_EXPIRY_MARGIN_SECS),
                    TokenValidity::Valid,
                    "remaining = {}",
                    remaining
                );
            }
        }

        #[test]
        fn token_within_margin_is_expired() {
            for remaining in [180, 100, 1, 0, -1, -3600] {
                let token = cached_with_remaining(remaining);
                assert_eq!(
                    token.validity_at(NOW, DEFAULT_EXPIRY_MARGIN_SECS),
                    TokenValidity::Expired,
                    "remaining = {}",
                    remaining
                );
            }
        }

        #[test]
        fn remaining_is_reported_in_seconds() {
            let token = cached_with_remaining(100);
            assert_eq!(token.remaining_at(NOW), Some(100));
            assert_eq!(token.expiry(), Some(1_700_000_100));
        }

        #[test]
        fn fractional_expiry_is_truncated_to_whole_seconds() {
            let token = CachedToken::new(token_with_payload(r#"{"exp":1700000400.75}"#));
            assert_eq!(token.expiry(), Some(1_700_000_400));
        }
    }

    mod when_expiry_claim_does_not_decode {
        use super::*;

        fn assert_invalid(token: AccessToken) {
            let token = CachedToken::new(token);
            assert_eq!(token.expiry(), None);
            assert_eq!(
                token.validity_at(NOW, DEFAULT_EXPIRY_MARGIN_SECS),
                TokenValidity::Invalid
            );
        }

        #[test]
        fn empty_token_is_invalid() {
            assert_invalid(AccessToken::from_static(""));
        }

        #[test]
        fn opaque_token_is_invalid() {
            assert_invalid(AccessToken::from_static("not-a-jwt"));
        }

        #[test]
        fn token_with_bad_base64_payload_is_invalid() {
            assert_invalid(AccessToken::from_static("e30.!!!.sig"));
        }

        #[test]
        fn token_without_exp_claim_is_invalid() {
            assert_invalid(token_with_payload(r#"{"sub":"device-client"}"#));
        }

        #[test]
        fn token_with_string_exp_claim_is_invalid() {
            assert_invalid(token_with_payload(r#"{"exp":"tomorrow"}"#));
        }

        #[test]
        fn token_with_extra_segments_is_invalid() {
            assert_invalid(AccessToken::from_static("a.b.c.d"));
        }
    }

    mod lifetime_config {
        use aliri_clock::TestClock;

        use super::*;

        #[test]
        fn absent_token_is_invalid() {
            let config = TokenLifetimeConfig::default().with_clock(TestClock::new(NOW));
            assert_eq!(config.validity_of(None), TokenValidity::Invalid);
        }

        #[test]
        fn custom_margin_is_respected() {
            let config = TokenLifetimeConfig::new(30).with_clock(TestClock::new(NOW));
            let token = cached_with_remaining(100);
            assert_eq!(config.validity_of(Some(&token)), TokenValidity::Valid);
            assert_eq!(config.expiry_margin(), 30);
        }
    }
}
