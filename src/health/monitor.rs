// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! System health sampling loop.
//!
//! Samples CPU / memory / disk / temperature every
//! `monitoring.health_check_interval` seconds, bumps the bus counters when
//! thresholds are exceeded, and requests a service restart when
//! `restart_on_failure` is set and CPU or memory stay over their limits.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Disks, System};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::NodeConfig;
use crate::health::{HealthBus, SystemSample};
use crate::service::ControlCommand;

const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";
const DISK_WARN_PERCENT: f32 = 90.0;
const TEMP_WARN_CELSIUS: f32 = 80.0;
const SUMMARY_EVERY_CHECKS: u64 = 60;

/// Take one system sample. CPU usage needs two refreshes a short interval
/// apart to be meaningful.
pub async fn sample_system(sys: &mut System) -> SystemSample {
    sys.refresh_cpu_usage();
    tokio::time::sleep(Duration::from_millis(200)).await;
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_percent = sys.global_cpu_info().cpu_usage();
    let total_mem = sys.total_memory() as f64;
    let used_mem = sys.used_memory() as f64;
    let memory_percent = if total_mem > 0.0 {
        (used_mem / total_mem * 100.0) as f32
    } else {
        0.0
    };

    let disks = Disks::new_with_refreshed_list();
    let (disk_used, disk_total) = disks
        .list()
        .iter()
        .find(|d| d.mount_point() == Path::new("/"))
        .map(|d| (d.total_space() - d.available_space(), d.total_space()))
        .unwrap_or((0, 0));
    let disk_percent = if disk_total > 0 {
        (disk_used as f64 / disk_total as f64 * 100.0) as f32
    } else {
        0.0
    };

    SystemSample {
        cpu_percent: (cpu_percent * 10.0).round() / 10.0,
        memory_percent: (memory_percent * 10.0).round() / 10.0,
        memory_used_mb: used_mem / 1024.0 / 1024.0,
        memory_total_mb: total_mem / 1024.0 / 1024.0,
        disk_percent: (disk_percent * 10.0).round() / 10.0,
        disk_used_gb: disk_used as f64 / 1024.0 / 1024.0 / 1024.0,
        disk_total_gb: disk_total as f64 / 1024.0 / 1024.0 / 1024.0,
        temperature: read_cpu_temperature(),
        uptime: 0,
    }
}

/// CPU temperature in °C, if the platform exposes a thermal zone.
pub fn read_cpu_temperature() -> Option<f32> {
    let raw = std::fs::read_to_string(THERMAL_ZONE).ok()?;
    let millideg: f32 = raw.trim().parse().ok()?;
    Some((millideg / 1000.0 * 10.0).round() / 10.0)
}

pub struct HealthMonitor {
    bus: Arc<HealthBus>,
    config: Arc<std::sync::RwLock<NodeConfig>>,
    control: mpsc::Sender<ControlCommand>,
}

impl HealthMonitor {
    pub fn new(
        bus: Arc<HealthBus>,
        config: Arc<std::sync::RwLock<NodeConfig>>,
        control: mpsc::Sender<ControlCommand>,
    ) -> Self {
        Self { bus, config, control }
    }

    pub async fn run(self, token: CancellationToken) {
        let mut sys = System::new();
        info!("Health monitor started");
        loop {
            let interval = {
                let cfg = match self.config.read() {
                    Ok(cfg) => cfg,
                    Err(_) => {
                        error!("Config lock poisoned, health monitor exiting");
                        return;
                    }
                };
                Duration::from_secs(cfg.monitoring.health_check_interval.max(1))
            };
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            self.check(&mut sys).await;
        }
        info!("Health monitor stopped");
    }

    async fn check(&self, sys: &mut System) {
        self.bus.record_check();
        let sample = sample_system(sys).await;

        let (max_cpu, max_mem, restart_on_failure) = {
            match self.config.read() {
                Ok(cfg) => (
                    cfg.monitoring.max_cpu_percent,
                    cfg.monitoring.max_memory_percent,
                    cfg.monitoring.restart_on_failure,
                ),
                Err(_) => return,
            }
        };

        if sample.cpu_percent > max_cpu {
            self.bus.record_warning();
            warn!(cpu = sample.cpu_percent, "High CPU usage");
        }
        if sample.memory_percent > max_mem {
            self.bus.record_warning();
            warn!(memory = sample.memory_percent, "High memory usage");
        }
        if sample.disk_percent > DISK_WARN_PERCENT {
            self.bus.record_warning();
            warn!(disk = sample.disk_percent, "High disk usage");
        }
        if let Some(temp) = sample.temperature {
            if temp > TEMP_WARN_CELSIUS {
                self.bus.record_warning();
                warn!(temperature = temp, "High CPU temperature");
            }
        }

        if restart_on_failure && (sample.cpu_percent > max_cpu || sample.memory_percent > max_mem) {
            error!("Critical resource usage detected, initiating restart");
            self.bus.record_error();
            let _ = self.control.send(ControlCommand::RestartService).await;
        }

        self.bus.set_system(sample);

        let (checks, warnings, errors) = self.bus.counters();
        if checks % SUMMARY_EVERY_CHECKS == 0 {
            info!(
                uptime_secs = self.bus.uptime_seconds(),
                warnings,
                errors,
                "Health metrics"
            );
        }
    }
}
