use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, Dispatch};

use crate::common::{BuildError, MetricError};
use crate::exporter::http_listener::new_http_listener;
use crate::exporter::{in_dispatch, spawn_exporter};
use crate::metrics_set::MetricsSet;
use crate::process::{register_process_collectors, PROCESS_NAMESPACE};
use crate::registry::{Collector, Registry};
use crate::PushGatewayPublisher;

/// Name of an entry built without one.
pub const DEFAULT_ENTRY_NAME: &str = "PromDefault";

/// Type reported by every [`PromEntry`].
pub const ENTRY_TYPE: &str = "PromEntry";

/// Description of an entry built without one.
pub const DEFAULT_ENTRY_DESCRIPTION: &str =
    "Entry which serves metrics in the Prometheus exposition format.";

/// Port the pull endpoint listens on by default.
pub const DEFAULT_PORT: u16 = 1608;

/// Path the pull endpoint serves metrics at by default.
pub const DEFAULT_PATH: &str = "/metrics";

/// Builder for creating a [`PromEntry`].
pub struct PromEntryBuilder {
    name: String,
    description: String,
    port: u16,
    path: String,
    bind_address: IpAddr,
    registry: Option<Registry>,
    pusher: Option<PushGatewayPublisher>,
    process_collector: bool,
    dispatch: Option<Dispatch>,
}

impl PromEntryBuilder {
    /// Creates a new [`PromEntryBuilder`].
    pub fn new() -> Self {
        Self {
            name: DEFAULT_ENTRY_NAME.to_string(),
            description: DEFAULT_ENTRY_DESCRIPTION.to_string(),
            port: DEFAULT_PORT,
            path: DEFAULT_PATH.to_string(),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            registry: None,
            pusher: None,
            process_collector: true,
            dispatch: None,
        }
    }

    /// Sets the entry name. Empty names are ignored.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !name.is_empty() {
            self.name = name;
        }
        self
    }

    /// Sets the entry description. Empty descriptions are ignored.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        let description = description.into();
        if !description.is_empty() {
            self.description = description;
        }
        self
    }

    /// Sets the port of the pull endpoint.
    ///
    /// Port 0 binds an ephemeral port, reported by [`PromEntry::bootstrap`].
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the path of the pull endpoint.
    ///
    /// The path is trimmed and gets a leading `/` when missing; an empty path means `/metrics`.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Sets the address the pull endpoint binds to. Defaults to `0.0.0.0`.
    #[must_use]
    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    /// Uses `registry` instead of a fresh one.
    #[must_use]
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Attaches a publisher, started and stopped along with the pull endpoint.
    ///
    /// The publisher is rebound to push the entry's registry.
    #[must_use]
    pub fn with_pusher(mut self, pusher: PushGatewayPublisher) -> Self {
        self.pusher = Some(pusher);
        self
    }

    /// Sets whether `bootstrap` registers the `rk_process_*` families with the registry.
    ///
    /// Defaults to `true`.
    #[must_use]
    pub fn with_process_collector(mut self, enabled: bool) -> Self {
        self.process_collector = enabled;
        self
    }

    /// Sends the entry's lifecycle diagnostics to `dispatch`.
    #[must_use]
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// Builds the entry without starting anything.
    pub fn build(self) -> PromEntry {
        let registry = self.registry.unwrap_or_default();
        if let Some(pusher) = &self.pusher {
            pusher.set_gatherer(registry.clone());
        }

        PromEntry {
            name: self.name,
            description: self.description,
            port: self.port,
            path: normalize_path(&self.path),
            bind_address: self.bind_address,
            registry,
            pusher: self.pusher,
            process_collector: self.process_collector,
            dispatch: self.dispatch,
            server: Mutex::new(None),
        }
    }
}

impl Default for PromEntryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct RunningServer {
    local_address: SocketAddr,
    shutdown: oneshot::Sender<()>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EntryStatus<'a> {
    entry_name: &'a str,
    entry_type: &'a str,
    path: &'a str,
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pusher_remote_addr: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pusher_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pusher_job_name: Option<&'a str>,
}

/// Pull endpoint plus optional push gateway publisher, sharing one [`Registry`].
///
/// Dropping a bootstrapped entry interrupts it.
pub struct PromEntry {
    name: String,
    description: String,
    port: u16,
    path: String,
    bind_address: IpAddr,
    registry: Registry,
    pusher: Option<PushGatewayPublisher>,
    process_collector: bool,
    dispatch: Option<Dispatch>,
    server: Mutex<Option<RunningServer>>,
}

impl PromEntry {
    /// Starts the pull endpoint and, if any, the publisher, returning the bound address.
    ///
    /// Unless disabled on the builder, the process collector is registered first.
    ///
    /// Bootstrapping a running entry returns the address it is already bound to.
    ///
    /// ## Errors
    ///
    /// Fails if the listener cannot bind or no runtime can be created to drive it.
    pub fn bootstrap(&self) -> Result<SocketAddr, BuildError> {
        let mut server = self.server.lock();
        if let Some(running) = &*server {
            return Ok(running.local_address);
        }

        if self.process_collector {
            if let Err(e) = register_process_collectors(&self.registry, PROCESS_NAMESPACE) {
                in_dispatch(self.dispatch.as_ref(), || {
                    debug!(entry_name = %self.name, error = %e, "process collector not registered");
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        let (local_address, exporter) = new_http_listener(
            Arc::new(self.registry.clone()),
            SocketAddr::new(self.bind_address, self.port),
            self.path.clone(),
            rx,
        )?;
        spawn_exporter("http-listener", exporter)?;
        *server = Some(RunningServer { local_address, shutdown: tx });

        in_dispatch(self.dispatch.as_ref(), || {
            info!(entry_name = %self.name, prom_path = %self.path, %local_address, "starting prom entry");
        });

        if let Some(pusher) = &self.pusher {
            pusher.start();
        }

        Ok(local_address)
    }

    /// Stops the pull endpoint and the publisher. Does nothing when not bootstrapped.
    pub fn interrupt(&self) {
        let running = self.server.lock().take();
        if let Some(pusher) = &self.pusher {
            pusher.stop();
        }

        if let Some(running) = running {
            let _ = running.shutdown.send(());
            in_dispatch(self.dispatch.as_ref(), || {
                info!(entry_name = %self.name, local_address = %running.local_address, "stopping prom entry");
            });
        }
    }

    /// Returns the bound address while bootstrapped.
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.server.lock().as_ref().map(|running| running.local_address)
    }

    /// Registers collectors with the entry's registry, stopping at the first failure.
    ///
    /// ## Errors
    ///
    /// Fails if a collector with the same name is already registered.
    pub fn register_collector<C>(&self, collector: C) -> Result<(), MetricError>
    where
        C: Collector + 'static,
    {
        self.registry.register(collector)
    }

    /// Creates a [`MetricsSet`] backed by the entry's registry.
    pub fn metrics_set(&self, namespace: &str, subsystem: &str) -> MetricsSet {
        MetricsSet::new(namespace, subsystem, self.registry.clone())
    }

    /// Entry name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entry type, always [`ENTRY_TYPE`].
    pub fn entry_type(&self) -> &str {
        ENTRY_TYPE
    }

    /// Entry description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Configured port of the pull endpoint.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Normalized path of the pull endpoint.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Registry served by the pull endpoint and pushed by the publisher.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Attached publisher, if any.
    pub fn pusher(&self) -> Option<&PushGatewayPublisher> {
        self.pusher.as_ref()
    }
}

impl fmt::Display for PromEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.pusher.as_ref().map(PushGatewayPublisher::status);
        let entry = EntryStatus {
            entry_name: &self.name,
            entry_type: ENTRY_TYPE,
            path: &self.path,
            port: self.port,
            pusher_remote_addr: status.as_ref().map(|s| s.remote_address.as_str()),
            pusher_interval_ms: status.as_ref().map(|s| s.interval_ms),
            pusher_job_name: status.as_ref().map(|s| s.job_name.as_str()),
        };

        match serde_json::to_string(&entry) {
            Ok(json) => f.write_str(&json),
            Err(_) => f.write_str("{}"),
        }
    }
}

impl Drop for PromEntry {
    fn drop(&mut self) {
        if let Some(running) = self.server.get_mut().take() {
            if let Some(pusher) = &self.pusher {
                pusher.stop();
            }
            let _ = running.shutdown.send(());
        }
    }
}

fn normalize_path(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() {
        DEFAULT_PATH.to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}
