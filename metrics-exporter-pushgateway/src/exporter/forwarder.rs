use std::sync::Arc;

use base64::prelude::{BASE64_STANDARD, BASE64_URL_SAFE_NO_PAD};
use base64::Engine;
use http_body_util::Full;
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request, StatusCode, Uri};
use indexmap::IndexMap;
use parking_lot::RwLock;
use thiserror::Error as ThisError;

use super::transport::{Transport, TransportError};
use crate::common::{is_valid_label_name, BuildError};
use crate::formatting;
use crate::registry::Gatherer;

/// Errors that could occur during a single push to the gateway.
#[derive(Debug, ThisError)]
pub enum PushError {
    /// The push URL built from the remote address, job and grouping labels is not a valid URI.
    #[error("invalid push gateway endpoint {0}")]
    InvalidEndpoint(String),

    /// The HTTP request could not be assembled.
    #[error("failed to build push gateway request: {0}")]
    Request(String),

    /// The request could not be delivered.
    #[error("error sending request to push gateway: {0}")]
    Transport(#[from] TransportError),

    /// The gateway answered with a non-2xx status.
    #[error("unexpected status after pushing metrics to push gateway: {status}, body: {body}")]
    UnexpectedStatus {
        /// Status returned by the gateway.
        status: StatusCode,
        /// Response body, lossily decoded.
        body: String,
    },
}

/// Sends the gathered metrics to one grouping key of a push gateway.
pub(crate) struct Forwarder {
    base_url: String,
    job: String,
    grouping: RwLock<IndexMap<String, String>>,
    auth: Option<HeaderValue>,
    gatherer: RwLock<Arc<dyn Gatherer>>,
    transport: Arc<dyn Transport>,
    // At most one push in flight, periodic or manual.
    in_flight: tokio::sync::Mutex<()>,
}

impl Forwarder {
    pub(crate) fn new(
        remote_address: &str,
        job: String,
        auth: Option<HeaderValue>,
        gatherer: Arc<dyn Gatherer>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            base_url: normalize_base_url(remote_address),
            job,
            grouping: RwLock::new(IndexMap::new()),
            auth,
            gatherer: RwLock::new(gatherer),
            transport,
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn has_auth(&self) -> bool {
        self.auth.is_some()
    }

    pub(crate) fn set_gatherer(&self, gatherer: Arc<dyn Gatherer>) {
        *self.gatherer.write() = gatherer;
    }

    pub(crate) fn add_grouping(&self, name: String, value: String) -> Result<(), BuildError> {
        if name == "job" || !is_valid_label_name(&name) {
            return Err(BuildError::InvalidGroupingLabel(name));
        }

        self.grouping.write().insert(name, value);
        Ok(())
    }

    /// Full push URL: `<base>/metrics/job/<job>[/<label>/<value>...]`.
    pub(crate) fn endpoint(&self) -> String {
        let mut url = format!("{}/metrics/{}", self.base_url, path_segment("job", &self.job));
        for (name, value) in self.grouping.read().iter() {
            url.push('/');
            url.push_str(&path_segment(name, value));
        }
        url
    }

    /// Pushes the current metrics, `PUT` replacing and `POST` adding to the grouping key.
    pub(crate) async fn push(&self, method: Method) -> Result<(), PushError> {
        let _permit = self.in_flight.lock().await;

        let endpoint = self.endpoint();
        let uri = Uri::try_from(endpoint.as_str()).map_err(|_| PushError::InvalidEndpoint(endpoint))?;

        let gatherer = Arc::clone(&*self.gatherer.read());
        let output = formatting::render_families(&gatherer.gather());

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, HeaderValue::from_static(formatting::CONTENT_TYPE));
        if let Some(auth) = &self.auth {
            builder = builder.header(AUTHORIZATION, auth.clone());
        }
        let request =
            builder.body(Full::from(output)).map_err(|e| PushError::Request(e.to_string()))?;

        let response = self.transport.send(request).await?;
        if !response.status().is_success() {
            return Err(PushError::UnexpectedStatus {
                status: response.status(),
                body: String::from_utf8_lossy(response.body()).into_owned(),
            });
        }

        Ok(())
    }
}

fn normalize_base_url(remote_address: &str) -> String {
    let url = if remote_address.contains("://") {
        remote_address.to_string()
    } else {
        format!("http://{remote_address}")
    };
    url.trim_end_matches('/').to_string()
}

// Values outside the unreserved URL set go through the `@base64` form, which is also the only way
// to send an empty value.
fn path_segment(name: &str, value: &str) -> String {
    let plain = !value.is_empty()
        && value.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'));

    if plain {
        format!("{name}/{value}")
    } else if value.is_empty() {
        format!("{name}@base64/=")
    } else {
        format!("{name}@base64/{}", BASE64_URL_SAFE_NO_PAD.encode(value))
    }
}

/// Splits a `user:pass` credential, returning `None` unless it has exactly two parts.
pub(crate) fn parse_credential(credential: &str) -> Option<(&str, &str)> {
    let mut tokens = credential.trim().split(':');
    match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(user), Some(pass), None) => Some((user, pass)),
        _ => None,
    }
}

pub(crate) fn basic_auth(username: &str, password: &str) -> Option<HeaderValue> {
    let encoded = BASE64_STANDARD.encode(format!("{username}:{password}"));
    let mut header = HeaderValue::from_str(&format!("Basic {encoded}")).ok()?;
    header.set_sensitive(true);
    Some(header)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use base64::prelude::BASE64_STANDARD;
    use base64::Engine;
    use hyper::body::Bytes;
    use hyper::{Method, Response, StatusCode};
    use parking_lot::Mutex;

    use super::{basic_auth, parse_credential, Forwarder, PushError};
    use crate::common::BuildError;
    use crate::exporter::transport::{Transport, TransportFuture};
    use crate::registry::Registry;

    struct Fixed {
        status: StatusCode,
        seen: Mutex<Vec<(Method, String, Option<String>)>>,
    }

    impl Transport for Fixed {
        fn send(&self, request: hyper::Request<http_body_util::Full<Bytes>>) -> TransportFuture {
            let auth = request
                .headers()
                .get(hyper::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            self.seen.lock().push((request.method().clone(), request.uri().to_string(), auth));

            let mut response = Response::new(Bytes::from_static(b"nope"));
            *response.status_mut() = self.status;
            Box::pin(async move { Ok(response) })
        }
    }

    fn forwarder(address: &str, status: StatusCode) -> (Forwarder, Arc<Fixed>) {
        let transport = Arc::new(Fixed { status, seen: Mutex::new(Vec::new()) });
        let forwarder = Forwarder::new(
            address,
            "job-x".to_string(),
            basic_auth("user", "pass"),
            Arc::new(Registry::new()),
            transport.clone(),
        );
        (forwarder, transport)
    }

    #[test]
    fn test_endpoint_normalization() {
        let (fwd, _) = forwarder("localhost:9091/", StatusCode::OK);
        assert_eq!(fwd.endpoint(), "http://localhost:9091/metrics/job/job-x");

        let (fwd, _) = forwarder("https://gateway.example.com", StatusCode::OK);
        assert_eq!(fwd.endpoint(), "https://gateway.example.com/metrics/job/job-x");
    }

    #[test]
    fn test_grouping_labels() {
        let (fwd, _) = forwarder("localhost:9091", StatusCode::OK);
        fwd.add_grouping("instance".to_string(), "host-1".to_string()).unwrap();
        fwd.add_grouping("path".to_string(), "/var/tmp".to_string()).unwrap();
        fwd.add_grouping("empty".to_string(), String::new()).unwrap();

        assert_eq!(
            fwd.endpoint(),
            "http://localhost:9091/metrics/job/job-x/instance/host-1/path@base64/L3Zhci90bXA/empty@base64/="
        );

        assert!(matches!(
            fwd.add_grouping("job".to_string(), "other".to_string()),
            Err(BuildError::InvalidGroupingLabel(_))
        ));
        assert!(matches!(
            fwd.add_grouping("bad-name".to_string(), "x".to_string()),
            Err(BuildError::InvalidGroupingLabel(_))
        ));
    }

    #[test]
    fn test_parse_credential() {
        assert_eq!(parse_credential("user:pass"), Some(("user", "pass")));
        assert_eq!(parse_credential("  user:pass \n"), Some(("user", "pass")));
        assert_eq!(parse_credential("user:"), Some(("user", "")));
        assert_eq!(parse_credential("user"), None);
        assert_eq!(parse_credential("user:pass:extra"), None);
    }

    #[test]
    fn test_basic_auth() {
        let header = basic_auth("metrics", "123!_@ABC").unwrap();
        assert!(header.is_sensitive());

        let encoded = &header.as_bytes()["Basic ".len()..];
        let decoded = BASE64_STANDARD.decode(encoded).unwrap();
        assert_eq!(b"metrics:123!_@ABC", &decoded[..]);
    }

    #[test]
    fn test_push_methods_and_status() {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();

        let (fwd, transport) = forwarder("localhost:9091", StatusCode::OK);
        runtime.block_on(fwd.push(Method::PUT)).unwrap();
        runtime.block_on(fwd.push(Method::POST)).unwrap();

        let seen = transport.seen.lock().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, Method::PUT);
        assert_eq!(seen[1].0, Method::POST);
        assert_eq!(seen[0].1, "http://localhost:9091/metrics/job/job-x");
        assert!(seen[0].2.as_deref().unwrap_or_default().starts_with("Basic "));

        let (fwd, _) = forwarder("localhost:9091", StatusCode::BAD_REQUEST);
        match runtime.block_on(fwd.push(Method::PUT)) {
            Err(PushError::UnexpectedStatus { status, body }) => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(body, "nope");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_endpoint_is_a_push_error() {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let (fwd, transport) = forwarder("bad host:1", StatusCode::OK);

        let result = runtime.block_on(fwd.push(Method::PUT));
        assert!(matches!(result, Err(PushError::InvalidEndpoint(_))));
        assert!(transport.seen.lock().is_empty());
    }
}
