//! User-facing settings: when background work may run and what it produces.
//!
//! These live in the persistent store, not the config file, because the user
//! edits them at runtime while the daemon may be reading them.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase", tag = "kind", content = "days")]
pub enum ScanFrequency {
    #[default]
    Daily,
    Weekly,
    Custom(u32),
}

impl ScanFrequency {
    /// Number of whole days that must pass between scans.
    pub fn interval_days(&self) -> i64 {
        match self {
            ScanFrequency::Daily => 1,
            ScanFrequency::Weekly => 7,
            ScanFrequency::Custom(days) => i64::from(*days),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "daily" => Ok(ScanFrequency::Daily),
            "weekly" => Ok(ScanFrequency::Weekly),
            other => match other.parse::<u32>() {
                Ok(days) if days > 0 => Ok(ScanFrequency::Custom(days)),
                _ => Err(anyhow!(
                    "Invalid frequency '{}': expected daily, weekly or a positive day count",
                    other
                )),
            },
        }
    }
}

impl std::fmt::Display for ScanFrequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanFrequency::Daily => f.write_str("daily"),
            ScanFrequency::Weekly => f.write_str("weekly"),
            ScanFrequency::Custom(days) => write!(f, "every {} days", days),
        }
    }
}

/// Time-of-day restriction in local minutes since midnight, both ends inclusive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeWindow {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_window_start")]
    pub start_minute: u16,
    #[serde(default = "default_window_end")]
    pub end_minute: u16,
}

fn default_window_start() -> u16 {
    9 * 60
}

fn default_window_end() -> u16 {
    21 * 60
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self {
            enabled: false,
            start_minute: default_window_start(),
            end_minute: default_window_end(),
        }
    }
}

impl TimeWindow {
    /// Whether the given minute of day falls inside the window.
    /// A window with `start > end` spans midnight (e.g. 22:00-06:00).
    pub fn contains(&self, minute_of_day: u16) -> bool {
        if self.start_minute <= self.end_minute {
            minute_of_day >= self.start_minute && minute_of_day <= self.end_minute
        } else {
            minute_of_day >= self.start_minute || minute_of_day <= self.end_minute
        }
    }
}

/// Parse "HH:MM" into minutes since midnight.
pub fn parse_clock(s: &str) -> Result<u16> {
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| anyhow!("Invalid time '{}': expected HH:MM", s))?;
    let hours: u16 = h.trim().parse()?;
    let minutes: u16 = m.trim().parse()?;
    if hours > 23 || minutes > 59 {
        bail!("Invalid time '{}': out of range", s);
    }
    Ok(hours * 60 + minutes)
}

pub fn format_clock(minute_of_day: u16) -> String {
    format!("{:02}:{:02}", minute_of_day / 60, minute_of_day % 60)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanPolicyConfig {
    #[serde(default)]
    pub auto_scan_enabled: bool,

    #[serde(default)]
    pub frequency: ScanFrequency,

    #[serde(default = "default_true")]
    pub wifi_only: bool,

    #[serde(default)]
    pub charging_only: bool,

    #[serde(default)]
    pub time_window: TimeWindow,

    /// Mirrors the store's last-scan timestamp; kept out of the settings blob.
    #[serde(skip)]
    pub last_scan_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl Default for ScanPolicyConfig {
    fn default() -> Self {
        Self {
            auto_scan_enabled: false,
            frequency: ScanFrequency::Daily,
            wifi_only: default_true(),
            charging_only: false,
            time_window: TimeWindow::default(),
            last_scan_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessingSettings {
    /// Queue newly imported or discovered images automatically.
    #[serde(default = "default_true")]
    pub auto_process_on_import: bool,

    /// Also request the long narrative caption after a short one succeeds.
    #[serde(default)]
    pub generate_detailed_caption: bool,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            auto_process_on_import: default_true(),
            generate_detailed_caption: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Settings {
    #[serde(default)]
    pub scan: ScanPolicyConfig,

    #[serde(default)]
    pub processing: ProcessingSettings,
}

impl Settings {
    /// Apply a single `key value` update as typed on the command line.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "auto_scan" => self.scan.auto_scan_enabled = parse_bool(value)?,
            "frequency" => self.scan.frequency = ScanFrequency::parse(value)?,
            "wifi_only" => self.scan.wifi_only = parse_bool(value)?,
            "charging_only" => self.scan.charging_only = parse_bool(value)?,
            "window" => {
                if value == "off" {
                    self.scan.time_window.enabled = false;
                } else {
                    let (start, end) = value.split_once('-').ok_or_else(|| {
                        anyhow!("Invalid window '{}': expected HH:MM-HH:MM or off", value)
                    })?;
                    self.scan.time_window = TimeWindow {
                        enabled: true,
                        start_minute: parse_clock(start)?,
                        end_minute: parse_clock(end)?,
                    };
                }
            }
            "auto_process" => self.processing.auto_process_on_import = parse_bool(value)?,
            "detailed" => self.processing.generate_detailed_caption = parse_bool(value)?,
            _ => bail!("Unknown setting '{}'", key),
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => Err(anyhow!("Invalid boolean '{}'", value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_first_launch() {
        let settings = Settings::default();
        assert!(!settings.scan.auto_scan_enabled);
        assert!(settings.scan.wifi_only);
        assert!(!settings.scan.charging_only);
        assert!(!settings.scan.time_window.enabled);
        assert_eq!(settings.scan.time_window.start_minute, 540);
        assert_eq!(settings.scan.time_window.end_minute, 1260);
        assert!(settings.processing.auto_process_on_import);
    }

    #[test]
    fn test_overnight_window() {
        let window = TimeWindow {
            enabled: true,
            start_minute: parse_clock("22:00").unwrap(),
            end_minute: parse_clock("06:00").unwrap(),
        };
        assert!(window.contains(parse_clock("23:30").unwrap()));
        assert!(window.contains(parse_clock("00:00").unwrap()));
        assert!(window.contains(parse_clock("06:00").unwrap()));
        assert!(!window.contains(parse_clock("06:01").unwrap()));
        assert!(!window.contains(parse_clock("12:00").unwrap()));
    }

    #[test]
    fn test_settings_json_skips_last_scan() {
        let mut settings = Settings::default();
        settings.scan.frequency = ScanFrequency::Custom(3);
        settings.scan.last_scan_at = Some(Utc::now());

        let json = serde_json::to_string(&settings).unwrap();
        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.scan.frequency, ScanFrequency::Custom(3));
        assert!(back.scan.last_scan_at.is_none());
    }

    #[test]
    fn test_set_from_cli() {
        let mut settings = Settings::default();
        settings.set("window", "22:00-06:30").unwrap();
        settings.set("frequency", "weekly").unwrap();
        settings.set("charging_only", "on").unwrap();

        assert!(settings.scan.time_window.enabled);
        assert_eq!(settings.scan.time_window.end_minute, 6 * 60 + 30);
        assert_eq!(settings.scan.frequency, ScanFrequency::Weekly);
        assert!(settings.scan.charging_only);
        assert!(settings.set("colour", "blue").is_err());
        assert!(parse_clock("24:00").is_err());
    }
}
