//! Helpers for rendering metrics in the Prometheus exposition format.

use crate::registry::{MetricFamily, MetricValue};

/// Content type of the text exposition format, as sent to push gateways and scrapers.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Writes a help (description) line in the Prometheus [exposition format].
///
/// [exposition format]: https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md#text-format-details
pub fn write_help_line(buffer: &mut String, name: &str, desc: &str) {
    buffer.push_str("# HELP ");
    buffer.push_str(name);
    buffer.push(' ');
    buffer.push_str(&sanitize_description(desc));
    buffer.push('\n');
}

/// Writes a metric type line in the Prometheus [exposition format].
///
/// [exposition format]: https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md#text-format-details
pub fn write_type_line(buffer: &mut String, name: &str, metric_type: &str) {
    buffer.push_str("# TYPE ");
    buffer.push_str(name);
    buffer.push(' ');
    buffer.push_str(metric_type);
    buffer.push('\n');
}

/// Writes a metric in the Prometheus [exposition format].
///
/// When `suffix` is specified, it is appended to the `name`, which is useful for writing summary
/// statistics such as the sum or count of a histogram or summary. Likewise, `additional_label`
/// carries a type-specific label, such as `le` for histogram buckets or `quantile` for summaries.
///
/// [exposition format]: https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md#text-format-details
pub fn write_metric_line<T>(
    buffer: &mut String,
    name: &str,
    suffix: Option<&'static str>,
    labels: &[(String, String)],
    additional_label: Option<(&'static str, String)>,
    value: T,
) where
    T: std::fmt::Display,
{
    buffer.push_str(name);
    if let Some(suffix) = suffix {
        buffer.push('_');
        buffer.push_str(suffix);
    }

    if !labels.is_empty() || additional_label.is_some() {
        buffer.push('{');

        let mut first = true;
        for (key, value) in labels {
            if first {
                first = false;
            } else {
                buffer.push(',');
            }
            buffer.push_str(key);
            buffer.push_str("=\"");
            buffer.push_str(&sanitize_label_value(value));
            buffer.push('"');
        }

        if let Some((name, value)) = additional_label {
            if !first {
                buffer.push(',');
            }
            buffer.push_str(name);
            buffer.push_str("=\"");
            buffer.push_str(&value);
            buffer.push('"');
        }

        buffer.push('}');
    }

    buffer.push(' ');
    buffer.push_str(&value.to_string());
    buffer.push('\n');
}

/// Formats a float the way Prometheus expects, spelling out infinities and `NaN`.
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}

/// Renders metric families into the Prometheus text exposition format.
///
/// Families without samples are skipped. Each family is followed by an empty line.
pub fn render_families(families: &[MetricFamily]) -> String {
    let mut output = String::new();

    for family in families {
        if family.metrics.is_empty() {
            continue;
        }

        let name = family.name.as_str();
        if !family.help.is_empty() {
            write_help_line(&mut output, name, &family.help);
        }
        write_type_line(&mut output, name, family.metric_type.as_str());

        for metric in &family.metrics {
            let labels = &metric.labels;
            match &metric.value {
                MetricValue::Counter(value) => {
                    write_metric_line(&mut output, name, None, labels, None, value);
                }
                MetricValue::Gauge(value) => {
                    write_metric_line(&mut output, name, None, labels, None, format_float(*value));
                }
                MetricValue::Summary { quantiles, sum, count } => {
                    for (quantile, value) in quantiles {
                        write_metric_line(
                            &mut output,
                            name,
                            None,
                            labels,
                            Some(("quantile", format_float(*quantile))),
                            format_float(*value),
                        );
                    }
                    write_metric_line(&mut output, name, Some("sum"), labels, None, format_float(*sum));
                    write_metric_line(&mut output, name, Some("count"), labels, None, count);
                }
                MetricValue::Histogram { buckets, sum, count } => {
                    for (le, value) in buckets {
                        write_metric_line(
                            &mut output,
                            name,
                            Some("bucket"),
                            labels,
                            Some(("le", format_float(*le))),
                            value,
                        );
                    }
                    write_metric_line(
                        &mut output,
                        name,
                        Some("bucket"),
                        labels,
                        Some(("le", "+Inf".to_string())),
                        count,
                    );
                    write_metric_line(&mut output, name, Some("sum"), labels, None, format_float(*sum));
                    write_metric_line(&mut output, name, Some("count"), labels, None, count);
                }
            }
        }

        output.push('\n');
    }

    output
}

/// Sanitizes a label value to be valid under the Prometheus [data model].
///
/// [data model]: https://prometheus.io/docs/concepts/data_model/#metric-names-and-labels
pub fn sanitize_label_value(value: &str) -> String {
    sanitize_label_value_or_description(value, false)
}

/// Sanitizes a metric description to be valid under the Prometheus [exposition format].
///
/// [exposition format]: https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md#text-format-details
pub fn sanitize_description(value: &str) -> String {
    sanitize_label_value_or_description(value, true)
}

fn sanitize_label_value_or_description(value: &str, is_desc: bool) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for c in value.chars() {
        match c {
            '\n' => sanitized.push_str("\\n"),
            '\\' => sanitized.push_str("\\\\"),
            // Quotes only need escaping inside label values.
            '"' if !is_desc => sanitized.push_str("\\\""),
            c => sanitized.push(c),
        }
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::{format_float, render_families, sanitize_description, sanitize_label_value};
    use crate::registry::{Metric, MetricFamily, MetricType, MetricValue};
    use proptest::prelude::*;

    fn labels(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_sanitize_label_value_known_cases() {
        let cases = &[
            ("*", "*"),
            ("plain", "plain"),
            ("\"quoted\"", "\\\"quoted\\\""),
            ("back\\slash", "back\\\\slash"),
            ("new\nline", "new\\nline"),
        ];

        for (input, expected) in cases {
            assert_eq!(expected, &sanitize_label_value(input));
        }
    }

    #[test]
    fn test_sanitize_description_keeps_quotes() {
        assert_eq!(sanitize_description("a \"b\"\nc"), "a \"b\"\\nc");
    }

    #[test]
    fn test_format_float() {
        assert_eq!(format_float(f64::INFINITY), "+Inf");
        assert_eq!(format_float(f64::NEG_INFINITY), "-Inf");
        assert_eq!(format_float(f64::NAN), "NaN");
        assert_eq!(format_float(0.25), "0.25");
        assert_eq!(format_float(3.0), "3");
    }

    #[test]
    fn test_render_counter_and_gauge() {
        let families = vec![
            MetricFamily {
                name: "app_service_requests".to_string(),
                help: "Counter for requests".to_string(),
                metric_type: MetricType::Counter,
                metrics: vec![Metric {
                    labels: labels(&[("method", "GET")]),
                    value: MetricValue::Counter(42),
                }],
            },
            MetricFamily {
                name: "app_service_temperature".to_string(),
                help: String::new(),
                metric_type: MetricType::Gauge,
                metrics: vec![Metric { labels: Vec::new(), value: MetricValue::Gauge(-1.5) }],
            },
        ];

        let expected = concat!(
            "# HELP app_service_requests Counter for requests\n",
            "# TYPE app_service_requests counter\n",
            "app_service_requests{method=\"GET\"} 42\n",
            "\n",
            "# TYPE app_service_temperature gauge\n",
            "app_service_temperature -1.5\n",
            "\n",
        );
        assert_eq!(render_families(&families), expected);
    }

    #[test]
    fn test_render_histogram() {
        let families = vec![MetricFamily {
            name: "latency".to_string(),
            help: String::new(),
            metric_type: MetricType::Histogram,
            metrics: vec![Metric {
                labels: labels(&[("route", "/")]),
                value: MetricValue::Histogram {
                    buckets: vec![(0.5, 1), (1.0, 3)],
                    sum: 4.25,
                    count: 4,
                },
            }],
        }];

        let expected = concat!(
            "# TYPE latency histogram\n",
            "latency_bucket{route=\"/\",le=\"0.5\"} 1\n",
            "latency_bucket{route=\"/\",le=\"1\"} 3\n",
            "latency_bucket{route=\"/\",le=\"+Inf\"} 4\n",
            "latency_sum{route=\"/\"} 4.25\n",
            "latency_count{route=\"/\"} 4\n",
            "\n",
        );
        assert_eq!(render_families(&families), expected);
    }

    #[test]
    fn test_render_summary() {
        let families = vec![MetricFamily {
            name: "latency".to_string(),
            help: String::new(),
            metric_type: MetricType::Summary,
            metrics: vec![Metric {
                labels: Vec::new(),
                value: MetricValue::Summary {
                    quantiles: vec![(0.5, 2.0), (0.99, 9.0)],
                    sum: 11.0,
                    count: 2,
                },
            }],
        }];

        let expected = concat!(
            "# TYPE latency summary\n",
            "latency{quantile=\"0.5\"} 2\n",
            "latency{quantile=\"0.99\"} 9\n",
            "latency_sum 11\n",
            "latency_count 2\n",
            "\n",
        );
        assert_eq!(render_families(&families), expected);
    }

    #[test]
    fn test_render_skips_empty_families() {
        let families = vec![MetricFamily {
            name: "unused".to_string(),
            help: "never written".to_string(),
            metric_type: MetricType::Counter,
            metrics: Vec::new(),
        }];

        assert_eq!(render_families(&families), "");
    }

    proptest! {
        #[test]
        fn test_sanitize_label_value_has_no_raw_newlines(input in "(?s).{0,64}") {
            let result = sanitize_label_value(&input);
            prop_assert!(!result.contains('\n'));
        }
    }
}
