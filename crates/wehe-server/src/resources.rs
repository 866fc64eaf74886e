use std::time::Duration;

use sysinfo::{Disks, Networks, System};
use tracing::debug;

/// Admission is refused above these. The boundary is strict: exactly 95%
/// used still passes, anything above does not.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub memory_used_percent: f64,
    pub disk_used_percent: f64,
    pub upload_mbps: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            memory_used_percent: 95.0,
            disk_used_percent: 95.0,
            upload_mbps: 2000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeOutcome {
    Headroom,
    Overloaded { metric: &'static str, value: f64 },
    /// No probe could produce a reading. The standard prober skips
    /// individual probes that fail, so this is only seen when the whole
    /// probing step errors out.
    Unavailable,
}

/// Checks memory, root-filesystem disk, and upload bandwidth headroom.
/// A probe that cannot produce a reading is skipped rather than counted
/// against the client.
pub async fn probe(thresholds: &Thresholds) -> ProbeOutcome {
    let memory = memory_used_percent();
    let disk = root_disk_used_percent();
    let upload = upload_mbps_over_one_second().await;
    debug!(?memory, ?disk, ?upload, "resource probe");

    evaluate(thresholds, memory, disk, upload)
}

/// Compare readings against the thresholds, in the documented order.
/// Readings at exactly a threshold still pass; only strictly-above denies.
pub fn evaluate(
    thresholds: &Thresholds,
    memory_used_percent: Option<f64>,
    disk_used_percent: Option<f64>,
    upload_mbps: Option<f64>,
) -> ProbeOutcome {
    if let Some(used) = memory_used_percent {
        if used > thresholds.memory_used_percent {
            return ProbeOutcome::Overloaded {
                metric: "memory",
                value: used,
            };
        }
    }

    if let Some(used) = disk_used_percent {
        if used > thresholds.disk_used_percent {
            return ProbeOutcome::Overloaded {
                metric: "disk",
                value: used,
            };
        }
    }

    if let Some(mbps) = upload_mbps {
        if mbps > thresholds.upload_mbps {
            return ProbeOutcome::Overloaded {
                metric: "upload bandwidth",
                value: mbps,
            };
        }
    }

    ProbeOutcome::Headroom
}

fn memory_used_percent() -> Option<f64> {
    let mut system = System::new();
    system.refresh_memory();
    let total = system.total_memory();
    if total == 0 {
        return None;
    }
    Some(system.used_memory() as f64 / total as f64 * 100.0)
}

fn root_disk_used_percent() -> Option<f64> {
    let disks = Disks::new_with_refreshed_list();
    let root = disks
        .list()
        .iter()
        .find(|disk| disk.mount_point() == std::path::Path::new("/"))?;
    let total = root.total_space();
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(root.available_space());
    Some(used as f64 / total as f64 * 100.0)
}

/// Total bytes transmitted across all interfaces, sampled one second
/// apart.
async fn upload_mbps_over_one_second() -> Option<f64> {
    let mut networks = Networks::new_with_refreshed_list();
    let sent_before = total_transmitted(&networks);

    tokio::time::sleep(Duration::from_secs(1)).await;

    networks.refresh();
    let sent_after = total_transmitted(&networks);

    let bytes = sent_after.checked_sub(sent_before)?;
    Some(bytes as f64 * 8.0 / 1_000_000.0)
}

fn total_transmitted(networks: &Networks) -> u64 {
    networks
        .iter()
        .map(|(_, data)| data.total_transmitted())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_at_threshold_still_passes() {
        let thresholds = Thresholds::default();
        assert_eq!(
            evaluate(&thresholds, Some(95.0), Some(95.0), Some(2000.0)),
            ProbeOutcome::Headroom
        );
    }

    #[test]
    fn strictly_above_threshold_denies_with_the_metric_named() {
        let thresholds = Thresholds::default();
        assert_eq!(
            evaluate(&thresholds, Some(95.1), None, None),
            ProbeOutcome::Overloaded {
                metric: "memory",
                value: 95.1
            }
        );
        assert_eq!(
            evaluate(&thresholds, Some(10.0), Some(99.0), None),
            ProbeOutcome::Overloaded {
                metric: "disk",
                value: 99.0
            }
        );
        assert_eq!(
            evaluate(&thresholds, None, None, Some(2000.5)),
            ProbeOutcome::Overloaded {
                metric: "upload bandwidth",
                value: 2000.5
            }
        );
    }

    #[test]
    fn unavailable_readings_are_skipped() {
        let thresholds = Thresholds::default();
        assert_eq!(
            evaluate(&thresholds, None, None, None),
            ProbeOutcome::Headroom
        );
    }
}
