use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tracing::{debug, Dispatch};

use super::forwarder::{basic_auth, parse_credential, Forwarder};
use super::push_gateway::{NoopPushEvents, PushEvents, PushGatewayPublisher, Shared};
use super::transport::{CertBundle, HyperTransport, Transport, DEFAULT_TIMEOUT};
use super::in_dispatch;
use crate::common::BuildError;
use crate::registry::{Gatherer, Registry};

/// Default push interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Builder for creating a [`PushGatewayPublisher`].
///
/// Every option is independent; validation happens in [`build`][PushGatewayBuilder::build].
pub struct PushGatewayBuilder {
    interval: Duration,
    remote_address: String,
    job_name: String,
    basic_auth: Option<String>,
    cert_bundle: Option<CertBundle>,
    request_timeout: Duration,
    grouping: IndexMap<String, String>,
    transport: Option<Arc<dyn Transport>>,
    gatherer: Option<Arc<dyn Gatherer>>,
    events: Option<Arc<dyn PushEvents>>,
    dispatch: Option<Dispatch>,
}

impl PushGatewayBuilder {
    /// Creates a new [`PushGatewayBuilder`].
    pub fn new() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            remote_address: String::new(),
            job_name: String::new(),
            basic_auth: None,
            cert_bundle: None,
            request_timeout: DEFAULT_TIMEOUT,
            grouping: IndexMap::new(),
            transport: None,
            gatherer: None,
            events: None,
            dispatch: None,
        }
    }

    /// Sets the interval between two pushes.
    ///
    /// Defaults to one second. A zero interval is rejected by `build`.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the remote address of the push gateway, such as `localhost:9091`.
    ///
    /// `http://` is assumed when the address has no scheme.
    #[must_use]
    pub fn with_remote_address<A>(mut self, remote_address: A) -> Self
    where
        A: Into<String>,
    {
        self.remote_address = remote_address.into();
        self
    }

    /// Sets the job name, the first part of the grouping key.
    #[must_use]
    pub fn with_job_name<J>(mut self, job_name: J) -> Self
    where
        J: Into<String>,
    {
        self.job_name = job_name.into();
        self
    }

    /// Sets a `user:pass` credential for HTTP basic authentication.
    ///
    /// A credential that does not split into exactly two parts is ignored.
    #[must_use]
    pub fn with_basic_auth<C>(mut self, credential: C) -> Self
    where
        C: Into<String>,
    {
        self.basic_auth = Some(credential.into());
        self
    }

    /// Pushes over TLS, trusting the certificates of `bundle`.
    ///
    /// The remote address gets an `https://` prefix unless it already names a scheme.
    #[must_use]
    pub fn with_cert_bundle(mut self, bundle: CertBundle) -> Self {
        self.cert_bundle = Some(bundle);
        self
    }

    /// Sets the timeout of a single push exchange.
    ///
    /// Defaults to five seconds.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Adds a grouping label after the job name.
    #[must_use]
    pub fn with_grouping_label<K, V>(mut self, name: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.grouping.insert(name.into(), value.into());
        self
    }

    /// Replaces the HTTP transport, ignoring the certificate bundle and request timeout.
    #[must_use]
    pub fn with_transport<T>(mut self, transport: T) -> Self
    where
        T: Transport,
    {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Sets the source of the metrics being pushed.
    ///
    /// Defaults to an empty [`Registry`].
    #[must_use]
    pub fn with_gatherer<G>(mut self, gatherer: G) -> Self
    where
        G: Gatherer + 'static,
    {
        self.gatherer = Some(Arc::new(gatherer));
        self
    }

    /// Sets the observer notified around every periodic push.
    ///
    /// Defaults to [`NoopPushEvents`].
    #[must_use]
    pub fn with_events<E>(mut self, events: E) -> Self
    where
        E: PushEvents + 'static,
    {
        self.events = Some(Arc::new(events));
        self
    }

    /// Sends every diagnostic of the publisher to `dispatch`.
    ///
    /// Without one, the dispatcher current at `start` is used.
    #[must_use]
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// Builds the publisher, stopped.
    ///
    /// ## Errors
    ///
    /// Fails on a zero interval, an empty remote address or job name, or an invalid grouping
    /// label name.
    pub fn build(self) -> Result<PushGatewayPublisher, BuildError> {
        if self.interval.is_zero() {
            return Err(BuildError::InvalidInterval);
        }
        if self.remote_address.is_empty() {
            return Err(BuildError::InvalidAddress);
        }
        if self.job_name.is_empty() {
            return Err(BuildError::InvalidJobName);
        }

        let dispatch = self.dispatch;

        let mut remote_address = self.remote_address;
        if self.cert_bundle.is_some() && !has_scheme(&remote_address) {
            remote_address = format!("https://{remote_address}");
        }

        let auth = self.basic_auth.as_deref().and_then(|credential| {
            let auth = parse_credential(credential).and_then(|(user, pass)| basic_auth(user, pass));
            if auth.is_none() {
                in_dispatch(dispatch.as_ref(), || debug!("ignoring malformed basic auth credential"));
            }
            auth
        });

        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                let timeout = self.request_timeout;
                let cert_bundle = self.cert_bundle.as_ref();
                in_dispatch(dispatch.as_ref(), || -> Arc<dyn Transport> {
                    match cert_bundle {
                        Some(bundle) => Arc::new(HyperTransport::with_cert_bundle(bundle, timeout)),
                        None => Arc::new(HyperTransport::new(timeout)),
                    }
                })
            }
        };

        let gatherer = self.gatherer.unwrap_or_else(|| Arc::new(Registry::new()) as Arc<dyn Gatherer>);
        let forwarder =
            Forwarder::new(&remote_address, self.job_name.clone(), auth, gatherer, transport);
        for (name, value) in self.grouping {
            forwarder.add_grouping(name, value)?;
        }

        let events = self.events.unwrap_or_else(|| Arc::new(NoopPushEvents) as Arc<dyn PushEvents>);
        let shared =
            Shared::new(self.interval, remote_address, self.job_name, forwarder, events, dispatch);
        Ok(PushGatewayPublisher::from_shared(shared))
    }
}

impl Default for PushGatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn has_scheme(address: &str) -> bool {
    address.starts_with("http://") || address.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::PushGatewayBuilder;
    use crate::common::BuildError;
    use crate::exporter::transport::CertBundle;

    fn valid() -> PushGatewayBuilder {
        PushGatewayBuilder::new().with_remote_address("localhost:9091").with_job_name("job-x")
    }

    #[test]
    fn test_validation_order() {
        let err = PushGatewayBuilder::new().with_interval(Duration::ZERO).build().unwrap_err();
        assert!(matches!(err, BuildError::InvalidInterval));

        let err = PushGatewayBuilder::new().build().unwrap_err();
        assert!(matches!(err, BuildError::InvalidAddress));

        let err = PushGatewayBuilder::new().with_remote_address("localhost:9091").build().unwrap_err();
        assert!(matches!(err, BuildError::InvalidJobName));

        let err = valid().with_grouping_label("job", "other").build().unwrap_err();
        assert!(matches!(err, BuildError::InvalidGroupingLabel(_)));
    }

    #[test]
    fn test_defaults() {
        let publisher = valid().build().unwrap();
        assert_eq!(publisher.interval(), Duration::from_secs(1));
        assert_eq!(publisher.remote_address(), "localhost:9091");
        assert_eq!(publisher.job_name(), "job-x");
        assert!(!publisher.is_running());
        assert!(!publisher.has_basic_auth());
    }

    #[test]
    fn test_basic_auth_is_permissive() {
        assert!(valid().with_basic_auth("user:pass").build().unwrap().has_basic_auth());
        assert!(!valid().with_basic_auth("user:pass:extra").build().unwrap().has_basic_auth());
        assert!(!valid().with_basic_auth("nocolon").build().unwrap().has_basic_auth());
    }

    #[test]
    fn test_cert_bundle_forces_https() {
        let bundle = CertBundle::new(b"not a certificate".to_vec());

        let publisher = valid().with_cert_bundle(bundle.clone()).build().unwrap();
        assert_eq!(publisher.remote_address(), "https://localhost:9091");
        assert_eq!(publisher.endpoint(), "https://localhost:9091/metrics/job/job-x");

        let publisher = PushGatewayBuilder::new()
            .with_remote_address("http://localhost:9091")
            .with_job_name("job-x")
            .with_cert_bundle(bundle)
            .build()
            .unwrap();
        assert_eq!(publisher.remote_address(), "http://localhost:9091");
    }

    #[test]
    fn test_display_is_status_json() {
        let publisher = valid()
            .with_interval(Duration::from_millis(250))
            .with_basic_auth("user:secret")
            .build()
            .unwrap();

        assert_eq!(
            publisher.to_string(),
            r#"{"intervalMs":250,"remoteAddress":"localhost:9091","jobName":"job-x","running":false}"#
        );
        assert!(!publisher.to_string().contains("secret"));
    }
}
