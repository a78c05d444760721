//! Resource usage of the current process.
//!
//! [`register_process_collectors`] adds one collector per `process_*` family to a registry, all
//! sharing a single sampler. Families come out empty, and are therefore skipped when rendering,
//! on platforms where the process cannot be inspected.

use std::sync::Arc;

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::common::MetricError;
use crate::metric::build_fq_name;
use crate::registry::{Collector, Metric, MetricFamily, MetricType, MetricValue, Registry};

/// Namespace prefixed to the process families registered by a [`PromEntry`](crate::PromEntry).
pub const PROCESS_NAMESPACE: &str = "rk";

/// Registers the process collectors under `namespace`, stopping at the first failure.
///
/// ## Errors
///
/// Fails if one of the process families is already registered.
pub fn register_process_collectors(registry: &Registry, namespace: &str) -> Result<(), MetricError> {
    let sampler = Arc::new(ProcessSampler::new());
    for stat in ProcessStat::ALL {
        registry.register(ProcessCollector::new(namespace, stat, Arc::clone(&sampler)))?;
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct ProcessSample {
    cpu_seconds: f64,
    resident_memory_bytes: u64,
    virtual_memory_bytes: u64,
    start_time_seconds: u64,
}

struct ProcessSampler {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl ProcessSampler {
    fn new() -> Self {
        Self { pid: sysinfo::get_current_pid().ok(), system: Mutex::new(System::new()) }
    }

    fn sample(&self) -> Option<ProcessSample> {
        let pid = self.pid?;
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );

        let process = system.process(pid)?;
        Some(ProcessSample {
            cpu_seconds: process.accumulated_cpu_time() as f64 / 1000.0,
            resident_memory_bytes: process.memory(),
            virtual_memory_bytes: process.virtual_memory(),
            start_time_seconds: process.start_time(),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ProcessStat {
    CpuSeconds,
    ResidentMemory,
    VirtualMemory,
    StartTime,
}

impl ProcessStat {
    const ALL: [ProcessStat; 4] = [
        ProcessStat::CpuSeconds,
        ProcessStat::ResidentMemory,
        ProcessStat::VirtualMemory,
        ProcessStat::StartTime,
    ];

    fn name(self) -> &'static str {
        match self {
            ProcessStat::CpuSeconds => "cpu_seconds_total",
            ProcessStat::ResidentMemory => "resident_memory_bytes",
            ProcessStat::VirtualMemory => "virtual_memory_bytes",
            ProcessStat::StartTime => "start_time_seconds",
        }
    }

    fn help(self) -> &'static str {
        match self {
            ProcessStat::CpuSeconds => "Total user and system CPU time spent in seconds.",
            ProcessStat::ResidentMemory => "Resident memory size in bytes.",
            ProcessStat::VirtualMemory => "Virtual memory size in bytes.",
            ProcessStat::StartTime => "Start time of the process since unix epoch in seconds.",
        }
    }

    fn metric_type(self) -> MetricType {
        match self {
            ProcessStat::CpuSeconds => MetricType::Counter,
            _ => MetricType::Gauge,
        }
    }

    // CPU time is fractional, so it is carried as a float even though the family is a counter.
    fn value(self, sample: &ProcessSample) -> MetricValue {
        match self {
            ProcessStat::CpuSeconds => MetricValue::Gauge(sample.cpu_seconds),
            ProcessStat::ResidentMemory => MetricValue::Gauge(sample.resident_memory_bytes as f64),
            ProcessStat::VirtualMemory => MetricValue::Gauge(sample.virtual_memory_bytes as f64),
            ProcessStat::StartTime => MetricValue::Gauge(sample.start_time_seconds as f64),
        }
    }
}

struct ProcessCollector {
    name: String,
    stat: ProcessStat,
    sampler: Arc<ProcessSampler>,
}

impl ProcessCollector {
    fn new(namespace: &str, stat: ProcessStat, sampler: Arc<ProcessSampler>) -> Self {
        Self { name: build_fq_name(namespace, "process", stat.name()), stat, sampler }
    }
}

impl Collector for ProcessCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn collect(&self) -> MetricFamily {
        let metrics = self
            .sampler
            .sample()
            .map(|sample| vec![Metric { labels: Vec::new(), value: self.stat.value(&sample) }])
            .unwrap_or_default();

        MetricFamily {
            name: self.name.clone(),
            help: self.stat.help().to_string(),
            metric_type: self.stat.metric_type(),
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{register_process_collectors, ProcessSampler, PROCESS_NAMESPACE};
    use crate::common::MetricError;
    use crate::registry::{Gatherer, MetricType, MetricValue, Registry};

    #[test]
    fn test_family_names() {
        let registry = Registry::new();
        register_process_collectors(&registry, PROCESS_NAMESPACE).unwrap();

        for name in [
            "rk_process_cpu_seconds_total",
            "rk_process_resident_memory_bytes",
            "rk_process_virtual_memory_bytes",
            "rk_process_start_time_seconds",
        ] {
            assert!(registry.contains(name), "{name} missing");
        }

        let err = register_process_collectors(&registry, PROCESS_NAMESPACE).unwrap_err();
        assert!(matches!(err, MetricError::AlreadyRegistered(name) if name == "rk_process_cpu_seconds_total"));

        let plain = Registry::new();
        register_process_collectors(&plain, "").unwrap();
        assert!(plain.contains("process_start_time_seconds"));
    }

    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
    #[test]
    fn test_samples_current_process() {
        let sample = ProcessSampler::new().sample().unwrap();
        assert!(sample.resident_memory_bytes > 0);
        assert!(sample.start_time_seconds > 0);
        assert!(sample.cpu_seconds >= 0.0);

        let registry = Registry::new();
        register_process_collectors(&registry, PROCESS_NAMESPACE).unwrap();
        let families = registry.gather();
        assert_eq!(families.len(), 4);

        let cpu = families.iter().find(|f| f.name == "rk_process_cpu_seconds_total").unwrap();
        assert_eq!(cpu.metric_type, MetricType::Counter);
        assert!(matches!(cpu.metrics[0].value, MetricValue::Gauge(seconds) if seconds >= 0.0));
    }
}
