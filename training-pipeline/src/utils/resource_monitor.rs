use std::sync::Mutex;

use chrono::Utc;
use common::jobs::events::ResourceUsage;
use nvml_wrapper::Nvml;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tracing::{debug, info};

use super::round_to;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Samples host CPU, memory and GPU utilization. Sampling never fails; a
/// component that cannot be read reports zero.
pub struct ResourceMonitor {
    system: Mutex<System>,
    nvml: Option<Nvml>,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new()
                .with_memory(MemoryRefreshKind::everything())
                .with_cpu(CpuRefreshKind::new().with_cpu_usage()),
        );

        let nvml = Nvml::init().ok();
        if nvml.is_some() {
            info!("NVML initialized, GPU utilization will be reported");
        } else {
            debug!("NVML not available, GPU utilization reported as 0");
        }

        Self {
            system: Mutex::new(system),
            nvml,
        }
    }

    pub fn gpu_available(&self) -> bool {
        self.nvml.is_some()
    }

    pub fn sample(&self) -> ResourceUsage {
        let (cpu, ram) = match self.system.lock() {
            Ok(mut system) => {
                system.refresh_cpu();
                system.refresh_memory();
                let cpu = f64::from(system.global_cpu_info().cpu_usage());
                let ram = system.used_memory() as f64 / BYTES_PER_GB;
                (cpu, ram)
            }
            Err(_) => (0.0, 0.0),
        };

        ResourceUsage {
            timestamp: Utc::now().timestamp_millis(),
            cpu: round_to(cpu, 2),
            ram: round_to(ram, 2),
            gpu: round_to(self.gpu_utilization(), 2),
        }
    }

    fn gpu_utilization(&self) -> f64 {
        let Some(nvml) = &self.nvml else {
            return 0.0;
        };

        match nvml
            .device_by_index(0)
            .and_then(|device| device.utilization_rates())
        {
            Ok(utilization) => f64::from(utilization.gpu),
            Err(err) => {
                debug!(error = %err, "GPU utilization unavailable");
                0.0
            }
        }
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_is_well_formed() {
        let monitor = ResourceMonitor::new();
        let before = Utc::now().timestamp_millis();
        let usage = monitor.sample();

        assert!(usage.timestamp >= before);
        assert!(usage.cpu >= 0.0);
        assert!(usage.ram >= 0.0);
        assert!(usage.gpu >= 0.0 && usage.gpu <= 100.0);
        if !monitor.gpu_available() {
            assert!(usage.gpu.abs() < f64::EPSILON);
        }
    }
}
