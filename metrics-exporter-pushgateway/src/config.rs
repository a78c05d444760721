//! Boot configuration, read from a TOML document.
//!
//! ```toml
//! [prom]
//! enabled = true
//! port = 1608
//! path = "/metrics"
//!
//! [prom.pusher]
//! enabled = true
//! intervalMs = 1000
//! jobName = "my-job"
//! remoteAddress = "localhost:9091"
//! basicAuth = "user:pass"
//!
//! [prom.pusher.cert]
//! serverCertPath = "ca.pem"
//! clientCertPath = "client.pem"
//! clientKeyPath = "client-key.pem"
//! ```
//!
//! Every field is optional. Certificate files are only read when a publisher is built.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error as ThisError;

use crate::common::BuildError;
use crate::entry::{PromEntry, PromEntryBuilder, DEFAULT_PATH, DEFAULT_PORT};
use crate::{CertBundle, PushGatewayBuilder};

const DEFAULT_INTERVAL_MS: i64 = 1000;

/// Errors that could occur while loading the boot configuration.
#[derive(Debug, ThisError)]
pub enum ConfigError {
    /// A file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// Path of the file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid TOML or does not match the expected layout.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configured values were rejected.
    #[error(transparent)]
    Build(#[from] BuildError),
}

/// Root of the boot configuration document.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BootConfig {
    /// `[prom]` section.
    #[serde(default)]
    pub prom: PromConfig,
}

impl BootConfig {
    /// Parses a TOML document.
    ///
    /// ## Errors
    ///
    /// Fails if the document is not valid TOML or a field has the wrong type.
    pub fn parse(document: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(document)?)
    }

    /// Reads and parses a TOML file.
    ///
    /// ## Errors
    ///
    /// Fails if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let document = read_to_string(path.as_ref())?;
        Self::parse(&document)
    }

    /// Builds the entry described by the `[prom]` section, or `None` when it is disabled.
    ///
    /// ## Errors
    ///
    /// Fails if the enabled publisher is misconfigured or its certificates cannot be read.
    pub fn build_entry(&self) -> Result<Option<PromEntry>, ConfigError> {
        if !self.prom.enabled {
            return Ok(None);
        }
        self.prom.entry_builder().map(|builder| Some(builder.build()))
    }
}

/// `[prom]` section: the pull endpoint and its optional publisher.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct PromConfig {
    /// Whether the entry is started at all.
    pub enabled: bool,
    /// Port of the pull endpoint.
    pub port: u16,
    /// Path of the pull endpoint.
    pub path: String,
    /// `[prom.pusher]` section.
    pub pusher: Option<PusherConfig>,
}

impl Default for PromConfig {
    fn default() -> Self {
        Self { enabled: false, port: DEFAULT_PORT, path: DEFAULT_PATH.to_string(), pusher: None }
    }
}

impl PromConfig {
    /// Creates an entry builder from this section, attaching the publisher when enabled.
    ///
    /// ## Errors
    ///
    /// Fails if the enabled publisher is misconfigured or its certificates cannot be read.
    pub fn entry_builder(&self) -> Result<PromEntryBuilder, ConfigError> {
        let mut builder = PromEntryBuilder::new().with_port(self.port).with_path(self.path.as_str());

        if let Some(pusher) = self.pusher.as_ref().filter(|pusher| pusher.enabled) {
            builder = builder.with_pusher(pusher.builder()?.build()?);
        }

        Ok(builder)
    }
}

/// `[prom.pusher]` section.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct PusherConfig {
    /// Whether the publisher is attached to the entry.
    pub enabled: bool,
    /// Push interval in milliseconds. Must be strictly positive.
    pub interval_ms: i64,
    /// Job name.
    pub job_name: String,
    /// Remote address of the push gateway.
    pub remote_address: String,
    /// `user:pass` credential for basic authentication. Empty means none.
    pub basic_auth: String,
    /// `[prom.pusher.cert]` section.
    pub cert: Option<CertConfig>,
}

impl Default for PusherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: DEFAULT_INTERVAL_MS,
            job_name: String::new(),
            remote_address: String::new(),
            basic_auth: String::new(),
            cert: None,
        }
    }
}

impl PusherConfig {
    /// Creates a publisher builder from this section, reading certificate files if configured.
    ///
    /// The remaining validation happens in [`PushGatewayBuilder::build`].
    ///
    /// ## Errors
    ///
    /// Fails on a non-positive interval or an unreadable certificate file.
    pub fn builder(&self) -> Result<PushGatewayBuilder, ConfigError> {
        let interval_ms = u64::try_from(self.interval_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .ok_or(BuildError::InvalidInterval)?;

        let mut builder = PushGatewayBuilder::new()
            .with_interval(Duration::from_millis(interval_ms))
            .with_remote_address(self.remote_address.as_str())
            .with_job_name(self.job_name.as_str());

        if !self.basic_auth.is_empty() {
            builder = builder.with_basic_auth(self.basic_auth.as_str());
        }
        if let Some(cert) = &self.cert {
            builder = builder.with_cert_bundle(cert.load()?);
        }

        Ok(builder)
    }
}

/// `[prom.pusher.cert]` section: PEM files used to reach the push gateway over TLS.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertConfig {
    /// CA certificate(s) trusted for the push gateway.
    pub server_cert_path: PathBuf,
    /// Client certificate chain for mutual TLS.
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,
    /// Private key matching the client certificate.
    #[serde(default)]
    pub client_key_path: Option<PathBuf>,
}

impl CertConfig {
    /// Reads the configured files into a [`CertBundle`].
    ///
    /// The client identity is only read when both its certificate and key paths are set.
    ///
    /// ## Errors
    ///
    /// Fails if a configured file cannot be read.
    pub fn load(&self) -> Result<CertBundle, ConfigError> {
        let bundle = CertBundle::new(read(&self.server_cert_path)?);

        match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert), Some(key)) => Ok(bundle.with_client_identity(read(cert)?, read(key)?)),
            _ => Ok(bundle),
        }
    }
}

fn read(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })
}

fn read_to_string(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path)
        .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })
}
