use thiserror::Error as ThisError;

/// Maximum length of a metric name registered through a [`MetricsSet`](crate::MetricsSet).
pub const MAX_NAME_LENGTH: usize = 128;

/// Errors that could occur while building a push gateway publisher or a metrics entry.
#[derive(Debug, ThisError)]
pub enum BuildError {
    /// The push interval was zero or negative.
    #[error("invalid push interval: must be strictly positive")]
    InvalidInterval,

    /// The remote address of the push gateway was empty.
    #[error("empty push gateway remote address")]
    InvalidAddress,

    /// The job name was empty.
    #[error("empty push gateway job name")]
    InvalidJobName,

    /// A grouping label had an invalid or reserved name.
    #[error("invalid grouping label name: {0}")]
    InvalidGroupingLabel(String),

    /// Creating the networking event loop did not succeed.
    #[error("failed to spawn Tokio runtime for exporter: {0}")]
    FailedToCreateRuntime(String),

    /// Binding/listening to the given address did not succeed.
    #[error("failed to create HTTP listener: {0}")]
    FailedToCreateHTTPListener(String),
}

/// Errors that could occur while registering or looking up metrics.
#[derive(Debug, PartialEq, Eq, ThisError)]
pub enum MetricError {
    /// The metric name was empty after trimming.
    #[error("empty metric name")]
    EmptyName,

    /// The metric name exceeded [`MAX_NAME_LENGTH`].
    #[error("metric name exceeds max length of {max}: {name}")]
    NameTooLong {
        /// Offending name.
        name: String,
        /// Maximum allowed length.
        max: usize,
    },

    /// The fully-qualified metric name is not valid under the Prometheus data model.
    #[error("invalid metric name: {0}")]
    InvalidName(String),

    /// A metric with the same `namespace::subsystem::name` key already exists in the set.
    #[error("duplicate metrics: {0}")]
    Duplicate(String),

    /// A collector with the same fully-qualified name is already registered.
    #[error("collector already registered: {0}")]
    AlreadyRegistered(String),

    /// No metric is registered under the given key.
    #[error("metric not found: {0}")]
    NotFound(String),

    /// The number of label values did not match the number of label keys.
    #[error("inconsistent label cardinality: expected {expected} label values but got {actual}")]
    InconsistentCardinality {
        /// Number of label keys declared by the metric.
        expected: usize,
        /// Number of label values supplied.
        actual: usize,
    },

    /// A label name was invalid, duplicated, or not declared by the metric.
    #[error("invalid label name: {0}")]
    InvalidLabel(String),

    /// Buckets or quantiles were empty.
    #[error("buckets or quantiles cannot be empty")]
    EmptyBucketsOrQuantiles,
}

/// Checks a label name against the Prometheus data model (`[a-zA-Z_][a-zA-Z0-9_]*`).
///
/// Names starting with `__` are reserved for internal use and rejected as well.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    let valid_start = match chars.next() {
        Some(c) => c.is_ascii_alphabetic() || c == '_',
        None => false,
    };

    valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && !name.starts_with("__")
}

/// Checks a metric name against the Prometheus data model (`[a-zA-Z_:][a-zA-Z0-9_:]*`).
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    let valid_start = match chars.next() {
        Some(c) => c.is_ascii_alphabetic() || c == '_' || c == ':',
        None => false,
    };

    valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

#[cfg(test)]
mod tests {
    use super::{is_valid_label_name, is_valid_metric_name};

    #[test]
    fn test_label_names() {
        let test_cases = [
            ("instance", true),
            ("_private", true),
            ("region2", true),
            ("", false),
            ("2region", false),
            ("with-dash", false),
            ("__reserved", false),
            ("ünicode", false),
        ];

        for (input, expected) in test_cases {
            assert_eq!(is_valid_label_name(input), expected, "label name {input:?}");
        }
    }

    #[test]
    fn test_metric_names() {
        let test_cases = [
            ("http_requests_total", true),
            ("app:requests", true),
            ("_x", true),
            ("", false),
            ("1abc", false),
            ("foo.bar", false),
        ];

        for (input, expected) in test_cases {
            assert_eq!(is_valid_metric_name(input), expected, "metric name {input:?}");
        }
    }
}
