//! Labeled metric vectors backed by `metrics` handles.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use indexmap::IndexMap;
use metrics::atomics::AtomicU64;
use metrics::{Counter, Gauge, Histogram, HistogramFn};
use parking_lot::{Mutex, RwLock};

use crate::common::{is_valid_label_name, is_valid_metric_name, MetricError};
use crate::distribution::{Distribution, DistributionKind};
use crate::registry::{Collector, Metric, MetricFamily, MetricType, MetricValue};

/// Joins the non-empty parts of a metric name with `_`.
pub fn build_fq_name(namespace: &str, subsystem: &str, name: &str) -> String {
    [namespace, subsystem, name]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("_")
}

/// Immutable description of a metric vector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Desc {
    fq_name: String,
    help: String,
    label_keys: Vec<String>,
}

impl Desc {
    /// Creates a description, validating the fully-qualified name and the label keys.
    ///
    /// ## Errors
    ///
    /// Fails if the name is not a valid metric name, or if a label key is invalid or repeated.
    pub fn new(
        fq_name: impl Into<String>,
        help: impl Into<String>,
        label_keys: &[&str],
    ) -> Result<Self, MetricError> {
        let fq_name = fq_name.into();
        if !is_valid_metric_name(&fq_name) {
            return Err(MetricError::InvalidName(fq_name));
        }

        let mut keys: Vec<String> = Vec::with_capacity(label_keys.len());
        for key in label_keys {
            if !is_valid_label_name(key) || keys.iter().any(|k| k.as_str() == *key) {
                return Err(MetricError::InvalidLabel(key.to_string()));
            }
            keys.push(key.to_string());
        }

        Ok(Self { fq_name, help: help.into(), label_keys: keys })
    }

    /// Fully-qualified metric name.
    pub fn fq_name(&self) -> &str {
        &self.fq_name
    }

    /// Help text.
    pub fn help(&self) -> &str {
        &self.help
    }

    /// Label keys, in declaration order.
    pub fn label_keys(&self) -> &[String] {
        &self.label_keys
    }
}

/// Distribution storage behind summary and histogram handles.
pub(crate) struct DistributionCell(Mutex<Distribution>);

impl HistogramFn for DistributionCell {
    fn record(&self, value: f64) {
        self.0.lock().record(value);
    }
}

struct MetricVec<C> {
    desc: Desc,
    children: RwLock<IndexMap<Vec<String>, Arc<C>>>,
}

impl<C> MetricVec<C> {
    fn new(desc: Desc) -> Self {
        Self { desc, children: RwLock::new(IndexMap::new()) }
    }

    fn check_cardinality(&self, actual: usize) -> Result<(), MetricError> {
        let expected = self.desc.label_keys.len();
        if expected != actual {
            return Err(MetricError::InconsistentCardinality { expected, actual });
        }
        Ok(())
    }

    fn get_or_create<F>(&self, values: &[&str], make: F) -> Result<Arc<C>, MetricError>
    where
        F: FnOnce() -> C,
    {
        self.check_cardinality(values.len())?;
        let key = values.iter().map(|v| v.to_string()).collect::<Vec<_>>();

        if let Some(cell) = self.children.read().get(&key) {
            return Ok(Arc::clone(cell));
        }

        let mut children = self.children.write();
        let cell = children.entry(key).or_insert_with(|| Arc::new(make()));
        Ok(Arc::clone(cell))
    }

    fn values_from_labels<'a>(
        &self,
        labels: &HashMap<&str, &'a str>,
    ) -> Result<Vec<&'a str>, MetricError> {
        self.check_cardinality(labels.len())?;
        self.desc
            .label_keys
            .iter()
            .map(|key| {
                labels.get(key.as_str()).copied().ok_or_else(|| MetricError::InvalidLabel(key.clone()))
            })
            .collect()
    }

    fn remove(&self, values: &[&str]) -> bool {
        let key = values.iter().map(|v| v.to_string()).collect::<Vec<_>>();
        self.children.write().shift_remove(&key).is_some()
    }

    fn reset(&self) {
        self.children.write().clear();
    }

    fn collect<F>(&self, metric_type: MetricType, sample: F) -> MetricFamily
    where
        F: Fn(&C) -> MetricValue,
    {
        let mut metrics = self
            .children
            .read()
            .iter()
            .map(|(values, cell)| (values.clone(), sample(&**cell)))
            .collect::<Vec<_>>();
        metrics.sort_by(|a, b| a.0.cmp(&b.0));

        let metrics = metrics
            .into_iter()
            .map(|(values, value)| Metric {
                labels: self.desc.label_keys.iter().cloned().zip(values).collect(),
                value,
            })
            .collect();

        MetricFamily {
            name: self.desc.fq_name.clone(),
            help: self.desc.help.clone(),
            metric_type,
            metrics,
        }
    }
}

fn sample_counter(cell: &AtomicU64) -> MetricValue {
    MetricValue::Counter(cell.load(Ordering::Acquire))
}

fn sample_gauge(cell: &AtomicU64) -> MetricValue {
    MetricValue::Gauge(f64::from_bits(cell.load(Ordering::Acquire)))
}

fn sample_distribution(cell: &DistributionCell) -> MetricValue {
    cell.0.lock().snapshot()
}

macro_rules! impl_metric_vec {
    ($vec:ident, $handle:ident, $metric_type:expr, $sample:path) => {
        impl $vec {
            /// Returns the handle for the given label values, creating it on first use.
            ///
            /// ## Errors
            ///
            /// Fails if the number of values differs from the number of label keys.
            pub fn with_label_values(&self, values: &[&str]) -> Result<$handle, MetricError> {
                let cell = self.inner.get_or_create(values, || self.new_cell())?;
                Ok($handle::from_arc(cell))
            }

            /// Returns the handle for the given label map, creating it on first use.
            ///
            /// ## Errors
            ///
            /// Fails if the map does not name exactly the declared label keys.
            pub fn with_labels(&self, labels: &HashMap<&str, &str>) -> Result<$handle, MetricError> {
                let values = self.inner.values_from_labels(labels)?;
                self.with_label_values(&values)
            }

            /// Drops the child with the given label values, returning whether it existed.
            pub fn remove_label_values(&self, values: &[&str]) -> bool {
                self.inner.remove(values)
            }

            /// Drops every child.
            pub fn reset(&self) {
                self.inner.reset()
            }

            /// Description of this vector.
            pub fn desc(&self) -> &Desc {
                &self.inner.desc
            }
        }

        impl Collector for $vec {
            fn name(&self) -> &str {
                &self.inner.desc.fq_name
            }

            fn collect(&self) -> MetricFamily {
                self.inner.collect($metric_type, $sample)
            }
        }
    };
}

/// Counters partitioned by label values.
///
/// Clones share the same children.
#[derive(Clone)]
pub struct CounterVec {
    inner: Arc<MetricVec<AtomicU64>>,
}

impl CounterVec {
    /// Creates an empty counter vector.
    pub fn new(desc: Desc) -> Self {
        Self { inner: Arc::new(MetricVec::new(desc)) }
    }

    fn new_cell(&self) -> AtomicU64 {
        AtomicU64::new(0)
    }
}

impl_metric_vec!(CounterVec, Counter, MetricType::Counter, sample_counter);

/// Gauges partitioned by label values.
///
/// Clones share the same children.
#[derive(Clone)]
pub struct GaugeVec {
    inner: Arc<MetricVec<AtomicU64>>,
}

impl GaugeVec {
    /// Creates an empty gauge vector.
    pub fn new(desc: Desc) -> Self {
        Self { inner: Arc::new(MetricVec::new(desc)) }
    }

    fn new_cell(&self) -> AtomicU64 {
        AtomicU64::new(0.0f64.to_bits())
    }
}

impl_metric_vec!(GaugeVec, Gauge, MetricType::Gauge, sample_gauge);

/// Summaries partitioned by label values.
///
/// Clones share the same children.
#[derive(Clone)]
pub struct SummaryVec {
    inner: Arc<MetricVec<DistributionCell>>,
    kind: DistributionKind,
}

impl SummaryVec {
    /// Creates an empty summary vector reporting the given quantiles.
    ///
    /// ## Errors
    ///
    /// Fails if `quantiles` is empty.
    pub fn new(desc: Desc, quantiles: &[f64]) -> Result<Self, MetricError> {
        let kind = DistributionKind::summary(quantiles)?;
        Ok(Self { inner: Arc::new(MetricVec::new(desc)), kind })
    }

    fn new_cell(&self) -> DistributionCell {
        DistributionCell(Mutex::new(self.kind.new_distribution()))
    }
}

impl_metric_vec!(SummaryVec, Histogram, MetricType::Summary, sample_distribution);

/// Histograms partitioned by label values.
///
/// Clones share the same children.
#[derive(Clone)]
pub struct HistogramVec {
    inner: Arc<MetricVec<DistributionCell>>,
    kind: DistributionKind,
}

impl HistogramVec {
    /// Creates an empty histogram vector with the given bucket upper bounds.
    ///
    /// ## Errors
    ///
    /// Fails if `buckets` is empty.
    pub fn new(desc: Desc, buckets: &[f64]) -> Result<Self, MetricError> {
        let kind = DistributionKind::histogram(buckets)?;
        Ok(Self { inner: Arc::new(MetricVec::new(desc)), kind })
    }

    fn new_cell(&self) -> DistributionCell {
        DistributionCell(Mutex::new(self.kind.new_distribution()))
    }
}

impl_metric_vec!(HistogramVec, Histogram, MetricType::Histogram, sample_distribution);

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{build_fq_name, CounterVec, Desc, GaugeVec, HistogramVec, SummaryVec};
    use crate::common::MetricError;
    use crate::registry::{Collector, MetricValue};

    #[test]
    fn test_build_fq_name_skips_empty_parts() {
        assert_eq!(build_fq_name("app", "service", "requests"), "app_service_requests");
        assert_eq!(build_fq_name("", "service", "requests"), "service_requests");
        assert_eq!(build_fq_name("app", "", "requests"), "app_requests");
        assert_eq!(build_fq_name("", "", "requests"), "requests");
    }

    #[test]
    fn test_desc_validation() {
        assert_eq!(
            Desc::new("bad name", "", &[]).unwrap_err(),
            MetricError::InvalidName("bad name".to_string())
        );
        assert_eq!(
            Desc::new("ok", "", &["a", "a"]).unwrap_err(),
            MetricError::InvalidLabel("a".to_string())
        );
        assert_eq!(
            Desc::new("ok", "", &["__name"]).unwrap_err(),
            MetricError::InvalidLabel("__name".to_string())
        );
    }

    #[test]
    fn test_counter_vec_children() {
        let vec = CounterVec::new(Desc::new("requests", "help", &["method", "code"]).unwrap());
        vec.with_label_values(&["GET", "200"]).unwrap().increment(2);
        vec.with_label_values(&["GET", "200"]).unwrap().increment(3);
        vec.with_label_values(&["POST", "500"]).unwrap().increment(1);

        let family = vec.collect();
        assert_eq!(family.name, "requests");
        assert_eq!(family.help, "help");
        assert_eq!(family.metrics.len(), 2);
        assert_eq!(
            family.metrics[0].labels,
            vec![
                ("method".to_string(), "GET".to_string()),
                ("code".to_string(), "200".to_string())
            ]
        );
        assert_eq!(family.metrics[0].value, MetricValue::Counter(5));
        assert_eq!(family.metrics[1].value, MetricValue::Counter(1));
    }

    #[test]
    fn test_cardinality_is_enforced() {
        let vec = CounterVec::new(Desc::new("requests", "", &["method"]).unwrap());
        let err = vec.with_label_values(&["GET", "extra"]).unwrap_err();
        assert_eq!(err, MetricError::InconsistentCardinality { expected: 1, actual: 2 });
    }

    #[test]
    fn test_with_labels_map() {
        let vec = GaugeVec::new(Desc::new("temperature", "", &["room"]).unwrap());
        let labels = HashMap::from([("room", "kitchen")]);
        vec.with_labels(&labels).unwrap().set(21.5);
        vec.with_label_values(&["kitchen"]).unwrap().decrement(1.0);

        let family = vec.collect();
        assert_eq!(family.metrics[0].value, MetricValue::Gauge(20.5));

        let wrong = HashMap::from([("floor", "1")]);
        assert_eq!(vec.with_labels(&wrong).unwrap_err(), MetricError::InvalidLabel("room".to_string()));
    }

    #[test]
    fn test_remove_and_reset() {
        let vec = CounterVec::new(Desc::new("requests", "", &["method"]).unwrap());
        vec.with_label_values(&["GET"]).unwrap().increment(1);
        vec.with_label_values(&["PUT"]).unwrap().increment(1);

        assert!(vec.remove_label_values(&["GET"]));
        assert!(!vec.remove_label_values(&["GET"]));
        assert_eq!(vec.collect().metrics.len(), 1);

        vec.reset();
        assert!(vec.collect().metrics.is_empty());
    }

    #[test]
    fn test_distribution_vecs() {
        let summary = SummaryVec::new(Desc::new("latency", "", &[]).unwrap(), &[0.5]).unwrap();
        summary.with_label_values(&[]).unwrap().record(3.0);
        match &summary.collect().metrics[0].value {
            MetricValue::Summary { count, sum, .. } => {
                assert_eq!(*count, 1);
                assert_eq!(*sum, 3.0);
            }
            other => panic!("unexpected value: {other:?}"),
        }

        let histogram =
            HistogramVec::new(Desc::new("size", "", &["kind"]).unwrap(), &[1.0, 10.0]).unwrap();
        let handle = histogram.with_label_values(&["blob"]).unwrap();
        handle.record(0.5);
        handle.record(5.0);
        match &histogram.collect().metrics[0].value {
            MetricValue::Histogram { buckets, count, .. } => {
                assert_eq!(buckets, &vec![(1.0, 1), (10.0, 2)]);
                assert_eq!(*count, 2);
            }
            other => panic!("unexpected value: {other:?}"),
        }

        assert!(SummaryVec::new(Desc::new("empty", "", &[]).unwrap(), &[]).is_err());
    }
}
