use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::common::MetricError;
use crate::formatting;

/// Type of a metric family, as exposed in the `# TYPE` line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricType {
    /// Monotonically increasing counter.
    Counter,
    /// Arbitrary floating point value.
    Gauge,
    /// Client-side computed quantiles.
    Summary,
    /// Cumulative buckets.
    Histogram,
}

impl MetricType {
    /// Returns the name used for this type in the text exposition format.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Summary => "summary",
            MetricType::Histogram => "histogram",
        }
    }
}

/// Sampled value of a single labeled metric.
#[derive(Clone, Debug, PartialEq)]
pub enum MetricValue {
    /// Current counter value.
    Counter(u64),
    /// Current gauge value.
    Gauge(f64),
    /// Summary quantiles as `(quantile, value)` pairs, plus sum and count of observations.
    Summary {
        /// `(quantile, value)` pairs.
        quantiles: Vec<(f64, f64)>,
        /// Sum of all observations.
        sum: f64,
        /// Number of observations.
        count: u64,
    },
    /// Cumulative `(upper bound, count)` buckets, plus sum and count of observations.
    Histogram {
        /// `(upper bound, cumulative count)` pairs, without the implicit `+Inf` bucket.
        buckets: Vec<(f64, u64)>,
        /// Sum of all observations.
        sum: f64,
        /// Number of observations.
        count: u64,
    },
}

/// A single labeled sample within a [`MetricFamily`].
#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    /// Label pairs in declaration order.
    pub labels: Vec<(String, String)>,
    /// Sampled value.
    pub value: MetricValue,
}

/// All samples sharing one fully-qualified metric name.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricFamily {
    /// Fully-qualified metric name.
    pub name: String,
    /// Help text, rendered as `# HELP` when not empty.
    pub help: String,
    /// Metric type.
    pub metric_type: MetricType,
    /// Samples, one per distinct set of label values.
    pub metrics: Vec<Metric>,
}

/// Something that produces exactly one metric family when sampled.
pub trait Collector: Send + Sync {
    /// Fully-qualified name of the family this collector produces.
    fn name(&self) -> &str;

    /// Samples the current state of the collector.
    fn collect(&self) -> MetricFamily;
}

/// Capability to sample every metric family currently available from a source.
pub trait Gatherer: Send + Sync {
    /// Returns the current full set of metric families.
    fn gather(&self) -> Vec<MetricFamily>;
}

impl<F> Gatherer for F
where
    F: Fn() -> Vec<MetricFamily> + Send + Sync,
{
    fn gather(&self) -> Vec<MetricFamily> {
        (self)()
    }
}

/// A set of collectors keyed by fully-qualified metric name.
///
/// Cloning a registry is cheap and yields a handle to the same set of collectors.
#[derive(Clone, Default)]
pub struct Registry {
    collectors: Arc<RwLock<IndexMap<String, Arc<dyn Collector>>>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a collector.
    ///
    /// ## Errors
    ///
    /// Fails if a collector with the same name is already registered.
    pub fn register<C>(&self, collector: C) -> Result<(), MetricError>
    where
        C: Collector + 'static,
    {
        let name = collector.name().to_string();
        let mut collectors = self.collectors.write();
        if collectors.contains_key(&name) {
            return Err(MetricError::AlreadyRegistered(name));
        }

        collectors.insert(name, Arc::new(collector));
        Ok(())
    }

    /// Unregisters the collector with the given name, returning whether one was removed.
    pub fn unregister(&self, name: &str) -> bool {
        self.collectors.write().shift_remove(name).is_some()
    }

    /// Returns whether a collector is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.collectors.read().contains_key(name)
    }

    /// Renders every registered metric in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        formatting::render_families(&self.gather())
    }
}

impl Gatherer for Registry {
    fn gather(&self) -> Vec<MetricFamily> {
        let collectors = self.collectors.read().values().cloned().collect::<Vec<_>>();

        let mut families = collectors
            .iter()
            .map(|collector| collector.collect())
            .filter(|family| !family.metrics.is_empty())
            .collect::<Vec<_>>();
        families.sort_by(|a, b| a.name.cmp(&b.name));
        families
    }
}
