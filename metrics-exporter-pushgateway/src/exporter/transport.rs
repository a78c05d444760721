use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Request, Response};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use rustls::crypto::ring;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::client::WantsClientCert;
use rustls::{ClientConfig, ConfigBuilder, RootCertStore};
use thiserror::Error as ThisError;
use tracing::{debug, warn};

/// Default timeout applied to a whole push exchange, from connecting to reading the response body.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that could occur while sending a request to the push gateway.
#[derive(Debug, ThisError)]
pub enum TransportError {
    /// The exchange did not complete within the request timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The HTTP client failed to connect or to send the request.
    #[error("HTTP client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    /// The response body could not be read.
    #[error("failed to read response body: {0}")]
    Body(#[from] hyper::Error),
}

/// Convenience type for the future returned by a [`Transport`].
pub type TransportFuture =
    Pin<Box<dyn Future<Output = Result<Response<Bytes>, TransportError>> + Send + 'static>>;

/// Sends a single request to the push gateway and returns the buffered response.
///
/// The default implementation is a `hyper` client; tests substitute a recording double.
pub trait Transport: Send + Sync + 'static {
    /// Sends `request`, resolving once the full response body has been read.
    fn send(&self, request: Request<Full<Bytes>>) -> TransportFuture;
}

/// PEM-encoded certificates used to reach a push gateway over TLS.
///
/// `server_cert` seeds the root CA pool. The client certificate and key enable mutual TLS when
/// both are present and parse.
#[derive(Clone, Default)]
pub struct CertBundle {
    /// PEM-encoded CA certificate(s) trusted for the push gateway.
    pub server_cert: Vec<u8>,
    /// PEM-encoded client certificate chain.
    pub client_cert: Vec<u8>,
    /// PEM-encoded client private key.
    pub client_key: Vec<u8>,
}

impl CertBundle {
    /// Creates a bundle trusting the given CA certificate(s), without a client identity.
    pub fn new(server_cert: impl Into<Vec<u8>>) -> Self {
        Self { server_cert: server_cert.into(), ..Self::default() }
    }

    /// Adds a client certificate and key for mutual TLS.
    #[must_use]
    pub fn with_client_identity(
        mut self,
        client_cert: impl Into<Vec<u8>>,
        client_key: impl Into<Vec<u8>>,
    ) -> Self {
        self.client_cert = client_cert.into();
        self.client_key = client_key.into();
        self
    }

    fn client_identity(&self) -> Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        if self.client_cert.is_empty() || self.client_key.is_empty() {
            return None;
        }

        let certs = CertificateDer::pem_slice_iter(&self.client_cert)
            .collect::<Result<Vec<_>, _>>()
            .ok()
            .filter(|certs| !certs.is_empty())?;
        let key = PrivateKeyDer::from_pem_slice(&self.client_key).ok()?;
        Some((certs, key))
    }
}

impl fmt::Debug for CertBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertBundle")
            .field("server_cert_len", &self.server_cert.len())
            .field("client_cert_len", &self.client_cert.len())
            .field("client_key_len", &self.client_key.len())
            .finish()
    }
}

/// `hyper` client speaking HTTP/1 over plain TCP or rustls.
pub struct HyperTransport {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    timeout: Duration,
}

impl HyperTransport {
    /// Creates a transport trusting the platform's native roots.
    pub fn new(timeout: Duration) -> Self {
        let builder = match hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_native_roots(ring::default_provider())
        {
            Ok(builder) => builder,
            Err(e) => {
                debug!(error = %e, "no native root certificates available, continuing without them");
                hyper_rustls::HttpsConnectorBuilder::new()
                    .with_tls_config(base_config(RootCertStore::empty()).with_no_client_auth())
            }
        };

        let https = builder.https_or_http().enable_http1().build();
        Self::from_connector(https, timeout)
    }

    /// Creates a transport trusting the CA certificates of `bundle`, presenting its client
    /// identity when one parses.
    ///
    /// Malformed PEM yields an empty or partial root pool, and a client identity that does not
    /// parse is dropped with a warning. Neither is an error: the transport then fails at push time.
    pub fn with_cert_bundle(bundle: &CertBundle, timeout: Duration) -> Self {
        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(
            CertificateDer::pem_slice_iter(&bundle.server_cert).filter_map(Result::ok),
        );
        debug!(added, ignored, "loaded push gateway root certificates");

        let builder = base_config(roots);
        let config = match bundle.client_identity() {
            Some((certs, key)) => match builder.clone().with_client_auth_cert(certs, key) {
                Ok(config) => config,
                Err(e) => {
                    warn!(error = %e, "client certificate rejected, continuing without client authentication");
                    builder.with_no_client_auth()
                }
            },
            None => {
                if !bundle.client_cert.is_empty() || !bundle.client_key.is_empty() {
                    warn!("client certificate or key did not parse, continuing without client authentication");
                }
                builder.with_no_client_auth()
            }
        };

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(config)
            .https_or_http()
            .enable_http1()
            .build();
        Self::from_connector(https, timeout)
    }

    fn from_connector(https: HttpsConnector<HttpConnector>, timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(https);

        Self { client, timeout }
    }
}

impl Transport for HyperTransport {
    fn send(&self, request: Request<Full<Bytes>>) -> TransportFuture {
        let client = self.client.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let exchange = async {
                let response = client.request(request).await?;
                let (parts, body) = response.into_parts();
                let body = body.collect().await?.to_bytes();
                Ok::<_, TransportError>(Response::from_parts(parts, body))
            };

            tokio::time::timeout(timeout, exchange)
                .await
                .map_err(|_| TransportError::Timeout(timeout))?
        })
    }
}

fn base_config(roots: RootCertStore) -> ConfigBuilder<ClientConfig, WantsClientCert> {
    ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .expect("ring provider supports the default protocol versions")
        .with_root_certificates(roots)
}
