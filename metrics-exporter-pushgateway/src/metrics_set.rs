use std::collections::HashMap;

use indexmap::IndexMap;
use metrics::{Counter, Gauge, Histogram};
use parking_lot::Mutex;

use crate::common::{MetricError, MAX_NAME_LENGTH};
use crate::distribution::{DEFAULT_BUCKETS, DEFAULT_QUANTILES};
use crate::metric::{build_fq_name, CounterVec, Desc, GaugeVec, HistogramVec, SummaryVec};
use crate::registry::Registry;

/// Namespace used when none is given.
pub const DEFAULT_NAMESPACE: &str = "app";

/// Subsystem used when none is given.
pub const DEFAULT_SUBSYSTEM: &str = "service";

const KEY_SEPARATOR: &str = "::";

#[derive(Clone)]
enum RegisteredMetric {
    Counter(CounterVec),
    Gauge(GaugeVec),
    Summary(SummaryVec),
    Histogram(HistogramVec),
}

/// A namespaced collection of labeled metric vectors.
///
/// Every metric is keyed by `namespace::subsystem::name` and exposed under the fully-qualified name
/// `namespace_subsystem_name`. Registering a metric also registers it with the backing
/// [`Registry`], so it shows up on the pull endpoint and in pushes.
pub struct MetricsSet {
    namespace: String,
    subsystem: String,
    registry: Registry,
    metrics: Mutex<IndexMap<String, RegisteredMetric>>,
}

macro_rules! kind_accessors {
    ($variant:ident, $vec:ident, $handle:ident, $kind:literal, $get_vec:ident, $with_values:ident, $with_labels:ident, $list:ident) => {
        #[doc = concat!("Returns the ", $kind, " vector registered under `name`, if any.")]
        pub fn $get_vec(&self, name: &str) -> Option<$vec> {
            let key = self.key_for(name).ok()?;
            match self.metrics.lock().get(&key) {
                Some(RegisteredMetric::$variant(vec)) => Some(vec.clone()),
                _ => None,
            }
        }

        #[doc = concat!("Returns the ", $kind, " registered under `name` for the given label values.")]
        ///
        /// ## Errors
        ///
        /// Fails if no such metric is registered, or if the label values do not match its keys.
        pub fn $with_values(&self, name: &str, values: &[&str]) -> Result<$handle, MetricError> {
            self.$get_vec(name)
                .ok_or_else(|| MetricError::NotFound(self.key(name.trim())))?
                .with_label_values(values)
        }

        #[doc = concat!("Returns the ", $kind, " registered under `name` for the given label map.")]
        ///
        /// ## Errors
        ///
        /// Fails if no such metric is registered, or if the labels do not match its keys.
        pub fn $with_labels(
            &self,
            name: &str,
            labels: &HashMap<&str, &str>,
        ) -> Result<$handle, MetricError> {
            self.$get_vec(name)
                .ok_or_else(|| MetricError::NotFound(self.key(name.trim())))?
                .with_labels(labels)
        }

        #[doc = concat!("Lists every ", $kind, " vector in registration order.")]
        pub fn $list(&self) -> Vec<$vec> {
            self.metrics
                .lock()
                .values()
                .filter_map(|metric| match metric {
                    RegisteredMetric::$variant(vec) => Some(vec.clone()),
                    _ => None,
                })
                .collect()
        }
    };
}

impl MetricsSet {
    /// Creates a set backed by `registry`.
    ///
    /// Empty `namespace` or `subsystem` fall back to [`DEFAULT_NAMESPACE`] and
    /// [`DEFAULT_SUBSYSTEM`].
    pub fn new(namespace: &str, subsystem: &str, registry: Registry) -> Self {
        let namespace = if namespace.is_empty() { DEFAULT_NAMESPACE } else { namespace };
        let subsystem = if subsystem.is_empty() { DEFAULT_SUBSYSTEM } else { subsystem };

        Self {
            namespace: namespace.to_string(),
            subsystem: subsystem.to_string(),
            registry,
            metrics: Mutex::new(IndexMap::new()),
        }
    }

    /// Namespace of this set.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Subsystem of this set.
    pub fn subsystem(&self) -> &str {
        &self.subsystem
    }

    /// Registry the metrics of this set are registered with.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Registers a counter vector.
    ///
    /// ## Errors
    ///
    /// Fails on an invalid or duplicate name, invalid label keys, or a collector name clash in
    /// the registry.
    pub fn register_counter(&self, name: &str, label_keys: &[&str]) -> Result<(), MetricError> {
        self.register_with(name, |fq_name, name| {
            let desc = Desc::new(fq_name, help("Counter", name, label_keys), label_keys)?;
            let vec = CounterVec::new(desc);
            self.registry.register(vec.clone())?;
            Ok(RegisteredMetric::Counter(vec))
        })
    }

    /// Registers a gauge vector.
    ///
    /// ## Errors
    ///
    /// Fails on an invalid or duplicate name, invalid label keys, or a collector name clash in
    /// the registry.
    pub fn register_gauge(&self, name: &str, label_keys: &[&str]) -> Result<(), MetricError> {
        self.register_with(name, |fq_name, name| {
            let desc = Desc::new(fq_name, help("Gauge", name, label_keys), label_keys)?;
            let vec = GaugeVec::new(desc);
            self.registry.register(vec.clone())?;
            Ok(RegisteredMetric::Gauge(vec))
        })
    }

    /// Registers a summary vector reporting `quantiles`, or [`DEFAULT_QUANTILES`] when `None`.
    ///
    /// ## Errors
    ///
    /// Fails on an invalid or duplicate name, invalid label keys, empty quantiles, or a collector
    /// name clash in the registry.
    pub fn register_summary(
        &self,
        name: &str,
        quantiles: Option<&[f64]>,
        label_keys: &[&str],
    ) -> Result<(), MetricError> {
        let quantiles = quantiles.unwrap_or(&DEFAULT_QUANTILES);
        self.register_with(name, |fq_name, name| {
            let desc = Desc::new(fq_name, help("Summary", name, label_keys), label_keys)?;
            let vec = SummaryVec::new(desc, quantiles)?;
            self.registry.register(vec.clone())?;
            Ok(RegisteredMetric::Summary(vec))
        })
    }

    /// Registers a histogram vector with `buckets`, or [`DEFAULT_BUCKETS`] when `None`.
    ///
    /// ## Errors
    ///
    /// Fails on an invalid or duplicate name, invalid label keys, empty buckets, or a collector
    /// name clash in the registry.
    pub fn register_histogram(
        &self,
        name: &str,
        buckets: Option<&[f64]>,
        label_keys: &[&str],
    ) -> Result<(), MetricError> {
        let buckets = buckets.unwrap_or(&DEFAULT_BUCKETS);
        self.register_with(name, |fq_name, name| {
            let desc = Desc::new(fq_name, help("Histogram", name, label_keys), label_keys)?;
            let vec = HistogramVec::new(desc, buckets)?;
            self.registry.register(vec.clone())?;
            Ok(RegisteredMetric::Histogram(vec))
        })
    }

    /// Unregisters the metric named `name`, whatever its kind, returning whether one was removed.
    ///
    /// ## Errors
    ///
    /// Fails only if `name` is empty or too long.
    pub fn unregister(&self, name: &str) -> Result<bool, MetricError> {
        let key = self.key_for(name)?;
        let mut metrics = self.metrics.lock();
        if metrics.shift_remove(&key).is_none() {
            return Ok(false);
        }

        self.registry.unregister(&build_fq_name(&self.namespace, &self.subsystem, name.trim()));
        Ok(true)
    }

    kind_accessors!(
        Counter,
        CounterVec,
        Counter,
        "counter",
        get_counter_vec,
        get_counter_with_values,
        get_counter_with_labels,
        list_counters
    );

    kind_accessors!(
        Gauge,
        GaugeVec,
        Gauge,
        "gauge",
        get_gauge_vec,
        get_gauge_with_values,
        get_gauge_with_labels,
        list_gauges
    );

    kind_accessors!(
        Summary,
        SummaryVec,
        Histogram,
        "summary",
        get_summary_vec,
        get_summary_with_values,
        get_summary_with_labels,
        list_summaries
    );

    kind_accessors!(
        Histogram,
        HistogramVec,
        Histogram,
        "histogram",
        get_histogram_vec,
        get_histogram_with_values,
        get_histogram_with_labels,
        list_histograms
    );

    fn register_with<F>(&self, name: &str, make: F) -> Result<(), MetricError>
    where
        F: FnOnce(String, &str) -> Result<RegisteredMetric, MetricError>,
    {
        let key = self.key_for(name)?;
        let name = name.trim();

        let mut metrics = self.metrics.lock();
        if metrics.contains_key(&key) {
            return Err(MetricError::Duplicate(key));
        }

        let metric = make(build_fq_name(&self.namespace, &self.subsystem, name), name)?;
        metrics.insert(key, metric);
        Ok(())
    }

    fn key_for(&self, name: &str) -> Result<String, MetricError> {
        let name = name.trim();
        validate_raw_name(name)?;
        Ok(self.key(name))
    }

    fn key(&self, name: &str) -> String {
        [self.namespace.as_str(), self.subsystem.as_str(), name].join(KEY_SEPARATOR)
    }
}

fn validate_raw_name(name: &str) -> Result<(), MetricError> {
    if name.is_empty() {
        return Err(MetricError::EmptyName);
    }

    if name.len() > MAX_NAME_LENGTH {
        return Err(MetricError::NameTooLong { name: name.to_string(), max: MAX_NAME_LENGTH });
    }

    Ok(())
}

fn help(kind: &str, name: &str, label_keys: &[&str]) -> String {
    format!("{kind} for name:{name} and labels:{label_keys:?}")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::MetricsSet;
    use crate::common::{MetricError, MAX_NAME_LENGTH};
    use crate::registry::{Gatherer, MetricValue, Registry};

    fn new_set() -> MetricsSet {
        MetricsSet::new("", "", Registry::new())
    }

    #[test]
    fn test_defaults() {
        let set = new_set();
        assert_eq!(set.namespace(), "app");
        assert_eq!(set.subsystem(), "service");

        let set = MetricsSet::new("billing", "api", Registry::new());
        assert_eq!(set.namespace(), "billing");
        assert_eq!(set.subsystem(), "api");
    }

    #[test]
    fn test_register_counter_and_lookup() {
        let set = new_set();
        set.register_counter(" requests ", &["method"]).unwrap();

        set.get_counter_with_values("requests", &["GET"]).unwrap().increment(3);
        let labels = HashMap::from([("method", "GET")]);
        set.get_counter_with_labels("requests", &labels).unwrap().increment(1);

        let families = set.registry().gather();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].name, "app_service_requests");
        assert_eq!(families[0].help, "Counter for name:requests and labels:[\"method\"]");
        assert_eq!(families[0].metrics[0].value, MetricValue::Counter(4));
    }

    #[test]
    fn test_duplicate_keys_are_rejected() {
        let set = new_set();
        set.register_counter("requests", &[]).unwrap();

        let err = set.register_gauge("requests", &[]).unwrap_err();
        assert_eq!(err, MetricError::Duplicate("app::service::requests".to_string()));
        assert_eq!(set.list_counters().len(), 1);
        assert!(set.list_gauges().is_empty());
    }

    #[test]
    fn test_name_validation() {
        let set = new_set();
        assert_eq!(set.register_counter("   ", &[]).unwrap_err(), MetricError::EmptyName);

        let long = "a".repeat(MAX_NAME_LENGTH + 1);
        assert_eq!(
            set.register_counter(&long, &[]).unwrap_err(),
            MetricError::NameTooLong { name: long.clone(), max: MAX_NAME_LENGTH }
        );
        assert!(set.register_counter(&"a".repeat(MAX_NAME_LENGTH), &[]).is_ok());
    }

    #[test]
    fn test_lookup_of_wrong_kind_or_missing() {
        let set = new_set();
        set.register_gauge("temperature", &[]).unwrap();

        assert!(set.get_counter_vec("temperature").is_none());
        assert!(set.get_gauge_vec("temperature").is_some());
        assert_eq!(
            set.get_counter_with_values("missing", &[]).unwrap_err(),
            MetricError::NotFound("app::service::missing".to_string())
        );
    }

    #[test]
    fn test_summary_and_histogram_defaults() {
        let set = new_set();
        set.register_summary("latency", None, &["route"]).unwrap();
        set.register_histogram("size", Some(&[1.0, 2.0][..]), &[]).unwrap();
        assert_eq!(
            set.register_histogram("empty", Some(&[][..]), &[]).unwrap_err(),
            MetricError::EmptyBucketsOrQuantiles
        );

        set.get_summary_with_values("latency", &["/"]).unwrap().record(1.0);
        set.get_histogram_with_values("size", &[]).unwrap().record(1.5);

        let families = set.registry().gather();
        assert_eq!(families.len(), 2);
        match &families[0].metrics[0].value {
            MetricValue::Summary { quantiles, .. } => assert_eq!(quantiles.len(), 4),
            other => panic!("unexpected value: {other:?}"),
        }
        match &families[1].metrics[0].value {
            MetricValue::Histogram { buckets, .. } => assert_eq!(buckets, &vec![(1.0, 0), (2.0, 1)]),
            other => panic!("unexpected value: {other:?}"),
        }
        assert_eq!(set.list_summaries().len(), 1);
        assert_eq!(set.list_histograms().len(), 1);
    }

    #[test]
    fn test_unregister() {
        let set = new_set();
        set.register_counter("requests", &[]).unwrap();
        set.get_counter_with_values("requests", &[]).unwrap().increment(1);

        assert!(set.unregister("requests").unwrap());
        assert!(!set.unregister("requests").unwrap());
        assert!(set.registry().gather().is_empty());
        assert_eq!(set.unregister("").unwrap_err(), MetricError::EmptyName);

        set.register_counter("requests", &[]).unwrap();
    }

    #[test]
    fn test_registry_clash_is_reported() {
        let registry = Registry::new();
        let first = MetricsSet::new("app", "service", registry.clone());
        let second = MetricsSet::new("app", "service", registry);

        first.register_counter("requests", &[]).unwrap();
        assert_eq!(
            second.register_counter("requests", &[]).unwrap_err(),
            MetricError::AlreadyRegistered("app_service_requests".to_string())
        );
        assert!(second.list_counters().is_empty());
    }
}
