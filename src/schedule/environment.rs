//! Connectivity and power state used by the scan gates.

use std::fs;
use std::path::{Path, PathBuf};

/// Snapshot of the device conditions the policy cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Environment {
    pub on_wifi: bool,
    pub charging: bool,
}

pub trait EnvironmentProbe: Send + Sync {
    fn probe(&self) -> Environment;
}

/// Fixed answers, for command-line overrides and tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub Environment);

impl EnvironmentProbe for StaticProbe {
    fn probe(&self) -> Environment {
        self.0
    }
}

/// Reads Linux sysfs. On systems without sysfs both answers are `false`,
/// which keeps wifi-only/charging-only policies closed.
pub struct SysfsProbe {
    root: PathBuf,
}

impl SysfsProbe {
    pub fn new() -> Self {
        Self::with_root("/sys/class")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn wifi_up(&self) -> bool {
        let Ok(entries) = fs::read_dir(self.root.join("net")) else {
            return false;
        };
        entries.flatten().any(|entry| {
            let iface = entry.path();
            iface.join("wireless").exists()
                && read_trimmed(&iface.join("operstate")).as_deref() == Some("up")
        })
    }

    fn on_external_power(&self) -> bool {
        let Ok(entries) = fs::read_dir(self.root.join("power_supply")) else {
            return false;
        };
        entries.flatten().any(|entry| {
            let supply = entry.path();
            match read_trimmed(&supply.join("type")).as_deref() {
                Some("Mains") | Some("USB") => {
                    read_trimmed(&supply.join("online")).as_deref() == Some("1")
                }
                Some("Battery") => matches!(
                    read_trimmed(&supply.join("status")).as_deref(),
                    Some("Charging") | Some("Full")
                ),
                _ => false,
            }
        })
    }
}

impl Default for SysfsProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvironmentProbe for SysfsProbe {
    fn probe(&self) -> Environment {
        let env = Environment {
            on_wifi: self.wifi_up(),
            charging: self.on_external_power(),
        };
        tracing::debug!(on_wifi = env.on_wifi, charging = env.charging, "Probed environment");
        env
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(path: PathBuf, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_sysfs_probe_reads_wifi_and_mains() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(root.join("net/wlan0/operstate"), "up\n");
        fs::create_dir_all(root.join("net/wlan0/wireless")).unwrap();
        write(root.join("net/eth0/operstate"), "up\n");
        write(root.join("power_supply/AC/type"), "Mains\n");
        write(root.join("power_supply/AC/online"), "1\n");

        let env = SysfsProbe::with_root(root).probe();
        assert!(env.on_wifi);
        assert!(env.charging);
    }

    #[test]
    fn test_sysfs_probe_wired_only_on_battery() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(root.join("net/eth0/operstate"), "up\n");
        write(root.join("power_supply/BAT0/type"), "Battery\n");
        write(root.join("power_supply/BAT0/status"), "Discharging\n");

        let env = SysfsProbe::with_root(root).probe();
        assert!(!env.on_wifi);
        assert!(!env.charging);
    }

    #[test]
    fn test_missing_sysfs_is_closed() {
        let env = SysfsProbe::with_root("/nonexistent/sysfs").probe();
        assert_eq!(env, Environment::default());
    }
}
