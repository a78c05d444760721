use std::sync::Arc;

use metrics_util::storage::{Histogram, Summary};
use metrics_util::{parse_quantiles, Quantile};

use crate::common::MetricError;
use crate::registry::MetricValue;

/// Default summary quantiles.
pub const DEFAULT_QUANTILES: [f64; 4] = [0.5, 0.9, 0.99, 0.999];

/// Default histogram buckets, suited to latencies measured in seconds.
pub const DEFAULT_BUCKETS: [f64; 11] =
    [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Distribution type.
#[derive(Clone)]
pub enum Distribution {
    /// A Prometheus histogram.
    ///
    /// Exposes "bucketed" values, counting the number of samples below a given threshold.
    Histogram(Histogram),
    /// A Prometheus summary.
    ///
    /// Computes and exposes value quantiles directly.
    Summary(Summary, Arc<Vec<Quantile>>, f64),
}

impl Distribution {
    /// Records a single sample.
    pub fn record(&mut self, sample: f64) {
        match self {
            Distribution::Histogram(hist) => hist.record(sample),
            Distribution::Summary(summary, _, sum) => {
                summary.add(sample);
                *sum += sample;
            }
        }
    }

    /// Samples the current state of the distribution.
    pub fn snapshot(&self) -> MetricValue {
        match self {
            Distribution::Histogram(hist) => MetricValue::Histogram {
                buckets: hist.buckets(),
                sum: hist.sum(),
                count: hist.count(),
            },
            Distribution::Summary(summary, quantiles, sum) => {
                let quantiles = quantiles
                    .iter()
                    .map(|q| (q.value(), summary.quantile(q.value()).unwrap_or(0.0)))
                    .collect();

                MetricValue::Summary { quantiles, sum: *sum, count: summary.count() as u64 }
            }
        }
    }
}

/// Shape shared by every distribution of one registered summary or histogram.
#[derive(Clone)]
pub enum DistributionKind {
    /// Summary with the given quantiles.
    Summary(Arc<Vec<Quantile>>),
    /// Histogram cloned from an empty template holding the upper bounds.
    Histogram(Histogram),
}

impl DistributionKind {
    /// Creates a summary kind, clamping quantiles into `[0.0, 1.0]`.
    pub fn summary(quantiles: &[f64]) -> Result<Self, MetricError> {
        if quantiles.is_empty() {
            return Err(MetricError::EmptyBucketsOrQuantiles);
        }

        Ok(DistributionKind::Summary(Arc::new(parse_quantiles(quantiles))))
    }

    /// Creates a histogram kind. Bounds are sorted and deduplicated.
    pub fn histogram(buckets: &[f64]) -> Result<Self, MetricError> {
        let mut buckets = buckets.iter().copied().filter(|b| !b.is_nan()).collect::<Vec<_>>();
        if buckets.is_empty() {
            return Err(MetricError::EmptyBucketsOrQuantiles);
        }

        buckets.sort_by(f64::total_cmp);
        buckets.dedup();
        Histogram::new(&buckets)
            .map(DistributionKind::Histogram)
            .ok_or(MetricError::EmptyBucketsOrQuantiles)
    }

    /// Creates an empty distribution of this kind.
    pub fn new_distribution(&self) -> Distribution {
        match self {
            DistributionKind::Summary(quantiles) => {
                Distribution::Summary(Summary::with_defaults(), quantiles.clone(), 0.0)
            }
            DistributionKind::Histogram(template) => Distribution::Histogram(template.clone()),
        }
    }
}
