//! Revocation checks using the Online Certificate Status Protocol

use std::{error, io, sync::Arc, time::Duration};

use aliri_base64::Base64;
use async_trait::async_trait;
use const_oid::{
    db::{
        rfc5280::ID_PE_AUTHORITY_INFO_ACCESS,
        rfc5912::ID_SHA_1,
        rfc6960::{ID_PKIX_OCSP, ID_PKIX_OCSP_BASIC},
    },
    ObjectIdentifier,
};
use der::{
    asn1::{AnyRef, OctetString},
    Decode, Encode,
};
use rustls::pki_types::ServerName;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::TlsConnector;
use url::Url;
use x509_cert::{
    ext::pkix::{name::GeneralName, AuthorityInfoAccessSyntax},
    spki::AlgorithmIdentifierOwned,
    Certificate,
};
use x509_ocsp::{
    BasicOcspResponse, CertId, CertStatus, OcspRequest, OcspResponse, OcspResponseStatus,
    Request, TbsRequest,
};

use super::{OcspStatus, RevocationCheck};
use crate::{proxy, ProxyDescriptor};

/// The default time allowed for a complete revocation check
pub const DEFAULT_OCSP_TIMEOUT: Duration = Duration::from_secs(10);

const HTTPS_PORT: u16 = 443;
const MAX_PROXY_RESPONSE_HEAD: usize = 8 * 1024;

/// A failure while determining a certificate's revocation status
///
/// These never leave [`OcspVerifier::check()`]; they are logged and the
/// certificate is treated as not good.
#[derive(Debug, Error)]
pub enum OcspError {
    /// The target URL has no host to connect to
    #[error("target URL has no host")]
    MissingHost,
    /// The host is not usable as a TLS server name
    #[error("invalid TLS server name: {0}")]
    InvalidServerName(String),
    /// Unable to open a connection to the target or the proxy
    #[error("unable to connect")]
    Connect(#[source] io::Error),
    /// Only plain HTTP proxies can be used to tunnel the TLS connection
    #[error("proxy scheme {0:?} cannot be used for a CONNECT tunnel")]
    UnsupportedProxyScheme(String),
    /// The proxy refused to open a tunnel
    #[error("proxy refused CONNECT tunnel: {0}")]
    ProxyRefused(String),
    /// Unable to set up TLS
    #[error("unable to configure TLS")]
    TlsConfig(#[source] rustls::Error),
    /// The TLS handshake failed
    #[error("TLS handshake failed")]
    Handshake(#[source] io::Error),
    /// The server presented no certificate issuer to check against
    #[error("server did not present an issuer certificate")]
    MissingIssuer,
    /// A certificate or OCSP structure could not be encoded or decoded
    #[error("malformed certificate or OCSP structure")]
    Der(#[from] der::Error),
    /// The certificate does not name an OCSP responder
    #[error("certificate does not name an OCSP responder")]
    MissingResponder,
    /// Unable to reach the OCSP responder
    #[error("error requesting status from OCSP responder")]
    Responder(#[source] reqwest::Error),
    /// The responder did not process the request
    #[error("OCSP responder returned status {0}")]
    Unsuccessful(String),
    /// The responder's answer carries no response data
    #[error("OCSP response has no response bytes")]
    EmptyResponse,
    /// The responder's answer is not a basic OCSP response
    #[error("unsupported OCSP response type {0}")]
    UnsupportedResponseType(ObjectIdentifier),
    /// None of the responses were about the checked certificate
    #[error("OCSP response does not cover the certificate")]
    NoMatchingResponse,
}

/// Checks the revocation status of the certificate serving an endpoint
///
/// The certificate chain is taken from a TLS handshake with the endpoint,
/// the responder is found in the leaf certificate's Authority Information
/// Access extension, and the request is sent as an HTTP `GET`. Both the
/// handshake and the responder request go through the proxy when one is
/// given.
///
/// The responder's signature on the response is not verified; the response
/// is matched to the certificate by serial number and issuer key hash.
#[derive(Clone, Debug)]
pub struct OcspVerifier {
    timeout: Duration,
}

impl Default for OcspVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl OcspVerifier {
    /// Constructs a verifier with the default timeout
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_OCSP_TIMEOUT,
        }
    }

    /// Sets the time allowed for a complete check
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Determines the revocation status of the certificate serving `target`
    pub async fn status(
        &self,
        target: &Url,
        proxy: Option<&ProxyDescriptor>,
    ) -> Result<OcspStatus, OcspError> {
        let host = target
            .host_str()
            .map(unbracketed)
            .ok_or(OcspError::MissingHost)?;
        let port = target.port().unwrap_or(HTTPS_PORT);

        let chain = peer_certificates(host, port, proxy).await?;
        let leaf = chain.first().ok_or(OcspError::MissingIssuer)?;
        let issuer = chain.get(1).ok_or(OcspError::MissingIssuer)?;

        let responder = responder_url(leaf)?.ok_or(OcspError::MissingResponder)?;
        let cert_id = cert_id(leaf, issuer)?;

        self.lookup(&responder, &cert_id, proxy).await
    }

    /// Asks `responder` about the certificate identified by `cert_id`
    async fn lookup(
        &self,
        responder: &str,
        cert_id: &CertId,
        proxy: Option<&ProxyDescriptor>,
    ) -> Result<OcspStatus, OcspError> {
        tracing::debug!(responder = %responder, "requesting certificate status");

        let request = OcspRequest {
            tbs_request: TbsRequest {
                version: Default::default(),
                requestor_name: None,
                request_list: vec![Request {
                    req_cert: cert_id.clone(),
                    single_request_extensions: None,
                }],
                request_extensions: None,
            },
            optional_signature: None,
        }
        .to_der()?;

        let body = self.send(responder, request, proxy).await?;
        let basic = decode_basic_response(&body)?;
        status_for(basic, cert_id)
    }

    async fn send(
        &self,
        responder: &str,
        request: Vec<u8>,
        proxy: Option<&ProxyDescriptor>,
    ) -> Result<Vec<u8>, OcspError> {
        let encoded = Base64::from_raw(request).to_string();
        let url = format!(
            "{}/{}",
            responder.trim_end_matches('/'),
            urlencoding::encode(&encoded)
        );

        let client = proxy::http_client(self.timeout, proxy).map_err(OcspError::Responder)?;
        let resp = client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/ocsp-response")
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(OcspError::Responder)?;

        let body = resp.bytes().await.map_err(OcspError::Responder)?;
        Ok(body.to_vec())
    }

    /// Reduces the outcome of a check to pass or fail, logging why a check failed
    ///
    /// `None` means the check ran out of time.
    fn verdict(&self, outcome: Option<Result<OcspStatus, OcspError>>) -> bool {
        match outcome {
            Some(Ok(OcspStatus::Good)) => {
                tracing::info!("certificate status confirmed good");
                true
            }
            Some(Ok(status)) => {
                tracing::error!(?status, "certificate status is not good");
                false
            }
            Some(Err(error)) => {
                tracing::error!(
                    error = (&error as &dyn error::Error),
                    "unable to verify certificate status"
                );
                false
            }
            None => {
                tracing::error!(timeout = ?self.timeout, "certificate status check timed out");
                false
            }
        }
    }
}

#[async_trait]
impl RevocationCheck for OcspVerifier {
    #[tracing::instrument(
        skip(self, target, proxy),
        fields(target = %target, proxied = proxy.is_some())
    )]
    async fn check(&self, target: &Url, proxy: Option<&ProxyDescriptor>) -> bool {
        let outcome = tokio::time::timeout(self.timeout, self.status(target, proxy))
            .await
            .ok();
        self.verdict(outcome)
    }
}

/// Strips the brackets `Url` keeps around IPv6 literals
fn unbracketed(host: &str) -> &str {
    host.trim_start_matches('[').trim_end_matches(']')
}

async fn peer_certificates(
    host: &str,
    port: u16,
    proxy: Option<&ProxyDescriptor>,
) -> Result<Vec<Certificate>, OcspError> {
    let stream = match proxy {
        Some(proxy) => tunnel(proxy, host, port).await?,
        None => TcpStream::connect((host, port))
            .await
            .map_err(OcspError::Connect)?,
    };

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(OcspError::TlsConfig)?
    .with_root_certificates(roots)
    .with_no_client_auth();

    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|_| OcspError::InvalidServerName(host.to_owned()))?;

    let tls = TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await
        .map_err(OcspError::Handshake)?;

    let (_, session) = tls.get_ref();
    let chain = session
        .peer_certificates()
        .unwrap_or_default()
        .iter()
        .map(|der| Certificate::from_der(der))
        .collect::<Result<Vec<_>, _>>()?;

    tracing::trace!(chain_len = chain.len(), "received server certificate chain");

    Ok(chain)
}

/// Opens a CONNECT tunnel to `host:port` through an HTTP proxy
async fn tunnel(proxy: &ProxyDescriptor, host: &str, port: u16) -> Result<TcpStream, OcspError> {
    if proxy.scheme() != "http" {
        return Err(OcspError::UnsupportedProxyScheme(proxy.scheme().to_owned()));
    }

    let mut stream = TcpStream::connect((unbracketed(proxy.hostname()), proxy.port()))
        .await
        .map_err(OcspError::Connect)?;

    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n",
        host = host,
        port = port
    );
    if let Some(auth) = proxy.auth() {
        request.push_str("Proxy-Authorization: Basic ");
        request.push_str(&auth.basic_credentials());
        request.push_str("\r\n");
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(OcspError::Connect)?;

    // Read byte by byte so nothing past the response head is consumed
    let mut head = Vec::with_capacity(256);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_PROXY_RESPONSE_HEAD {
            return Err(OcspError::ProxyRefused("oversized response".to_owned()));
        }
        head.push(stream.read_u8().await.map_err(OcspError::Connect)?);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    if status_line.split_whitespace().nth(1) != Some("200") {
        return Err(OcspError::ProxyRefused(status_line.to_owned()));
    }

    tracing::trace!(proxy = %proxy.url(), "opened CONNECT tunnel");
    Ok(stream)
}

/// Finds the OCSP responder named in the certificate's Authority Information Access extension
fn responder_url(cert: &Certificate) -> Result<Option<String>, OcspError> {
    let extensions = match &cert.tbs_certificate.extensions {
        Some(extensions) => extensions,
        None => return Ok(None),
    };

    for ext in extensions
        .iter()
        .filter(|ext| ext.extn_id == ID_PE_AUTHORITY_INFO_ACCESS)
    {
        let aia = AuthorityInfoAccessSyntax::from_der(ext.extn_value.as_bytes())?;
        for access in aia.0.iter().filter(|a| a.access_method == ID_PKIX_OCSP) {
            if let GeneralName::UniformResourceIdentifier(uri) = &access.access_location {
                if let Ok(url) = std::str::from_utf8(uri.as_bytes()) {
                    return Ok(Some(url.to_owned()));
                }
            }
        }
    }

    Ok(None)
}

/// Identifies the certificate to the responder using SHA-1 hashes of its issuer
fn cert_id(cert: &Certificate, issuer: &Certificate) -> Result<CertId, OcspError> {
    let issuer_name = cert.tbs_certificate.issuer.to_der()?;
    let issuer_key = issuer
        .tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .raw_bytes();

    Ok(CertId {
        hash_algorithm: AlgorithmIdentifierOwned {
            oid: ID_SHA_1,
            parameters: Some(AnyRef::NULL.into()),
        },
        issuer_name_hash: OctetString::new(Sha1::digest(&issuer_name).to_vec())?,
        issuer_key_hash: OctetString::new(Sha1::digest(issuer_key).to_vec())?,
        serial_number: cert.tbs_certificate.serial_number.clone(),
    })
}

fn decode_basic_response(body: &[u8]) -> Result<BasicOcspResponse, OcspError> {
    let response = OcspResponse::from_der(body)?;

    if !matches!(response.response_status, OcspResponseStatus::Successful) {
        return Err(OcspError::Unsuccessful(format!(
            "{:?}",
            response.response_status
        )));
    }

    let bytes = response.response_bytes.ok_or(OcspError::EmptyResponse)?;
    if bytes.response_type != ID_PKIX_OCSP_BASIC {
        return Err(OcspError::UnsupportedResponseType(bytes.response_type));
    }

    Ok(BasicOcspResponse::from_der(bytes.response.as_bytes())?)
}

fn status_for(basic: BasicOcspResponse, cert_id: &CertId) -> Result<OcspStatus, OcspError> {
    let single = basic
        .tbs_response_data
        .responses
        .into_iter()
        .find(|r| {
            r.cert_id.serial_number == cert_id.serial_number
                && r.cert_id.issuer_key_hash == cert_id.issuer_key_hash
        })
        .ok_or(OcspError::NoMatchingResponse)?;

    Ok(match single.cert_status {
        CertStatus::Good(_) => OcspStatus::Good,
        CertStatus::Revoked(_) => OcspStatus::Revoked,
        CertStatus::Unknown(_) => OcspStatus::Unknown,
    })
}
