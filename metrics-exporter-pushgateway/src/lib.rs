//! Serves metrics in the Prometheus exposition format and periodically pushes them to a
//! Prometheus push gateway.
//!
//! Metrics live in a [`Registry`], usually populated through a namespaced [`MetricsSet`] whose
//! labeled vectors hand out [`metrics`] crate handles. A [`PushGatewayPublisher`], built with
//! [`PushGatewayBuilder`], pushes the registry's contents on a fixed interval until stopped. A
//! [`PromEntry`] ties a registry, a pull endpoint and an optional publisher together.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use metrics_exporter_pushgateway::{PromEntryBuilder, PushGatewayBuilder};
//!
//! let publisher = PushGatewayBuilder::new()
//!     .with_interval(Duration::from_secs(10))
//!     .with_remote_address("localhost:9091")
//!     .with_job_name("my-job")
//!     .build()
//!     .expect("valid publisher configuration");
//!
//! let entry = PromEntryBuilder::new().with_pusher(publisher).build();
//! let set = entry.metrics_set("app", "service");
//! set.register_counter("requests", &["method"]).expect("counter registered");
//!
//! entry.bootstrap().expect("entry started");
//! set.get_counter_with_values("requests", &["GET"]).expect("counter exists").increment(1);
//! ```
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(broken_intra_doc_links))]
mod common;
pub use self::common::{
    is_valid_label_name, is_valid_metric_name, BuildError, MetricError, MAX_NAME_LENGTH,
};

pub mod formatting;

mod distribution;
pub use self::distribution::{DEFAULT_BUCKETS, DEFAULT_QUANTILES};

mod registry;
pub use self::registry::{Collector, Gatherer, Metric, MetricFamily, MetricType, MetricValue, Registry};

mod metric;
pub use self::metric::{build_fq_name, CounterVec, Desc, GaugeVec, HistogramVec, SummaryVec};

mod metrics_set;
pub use self::metrics_set::{MetricsSet, DEFAULT_NAMESPACE, DEFAULT_SUBSYSTEM};

mod exporter;
pub use self::exporter::builder::{PushGatewayBuilder, DEFAULT_INTERVAL};
pub use self::exporter::forwarder::PushError;
pub use self::exporter::push_gateway::{
    NoopPushEvents, PublisherStatus, PushEvents, PushGatewayPublisher,
};
pub use self::exporter::transport::{
    CertBundle, HyperTransport, Transport, TransportError, TransportFuture, DEFAULT_TIMEOUT,
};
pub use self::exporter::{ExporterError, ExporterFuture};

mod process;
pub use self::process::{register_process_collectors, PROCESS_NAMESPACE};

mod entry;
pub use self::entry::{
    PromEntry, PromEntryBuilder, DEFAULT_ENTRY_DESCRIPTION, DEFAULT_ENTRY_NAME, DEFAULT_PATH,
    DEFAULT_PORT, ENTRY_TYPE,
};

pub mod config;
