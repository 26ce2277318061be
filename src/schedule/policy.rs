//! Scan gating: decides whether background work may run right now.

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};

use crate::settings::ScanPolicyConfig;

/// Network and power gates only. User-initiated runs honour these and
/// nothing else.
pub fn connectivity_allows(config: &ScanPolicyConfig, is_on_wifi: bool, is_charging: bool) -> bool {
    !(config.wifi_only && !is_on_wifi) && !(config.charging_only && !is_charging)
}

/// Gates that depend only on the current environment: the auto-scan
/// switch, network, power and the time-of-day window.
pub fn environment_allows<Tz: TimeZone>(
    config: &ScanPolicyConfig,
    now: &DateTime<Tz>,
    is_on_wifi: bool,
    is_charging: bool,
) -> bool {
    if !config.auto_scan_enabled {
        return false;
    }
    if !connectivity_allows(config, is_on_wifi, is_charging) {
        return false;
    }
    if config.time_window.enabled {
        let minute_of_day = (now.hour() * 60 + now.minute()) as u16;
        if !config.time_window.contains(minute_of_day) {
            return false;
        }
    }
    true
}

/// Whether enough whole days have passed since the last scan.
pub fn scan_is_due<Tz: TimeZone>(config: &ScanPolicyConfig, now: &DateTime<Tz>) -> bool {
    let Some(last) = config.last_scan_at else {
        return true;
    };
    let elapsed = now.with_timezone(&Utc) - last;
    let days_since = elapsed.num_seconds().div_euclid(Duration::days(1).num_seconds());
    days_since >= config.frequency.interval_days()
}

/// Full scan decision: every environment gate plus the frequency check.
pub fn should_scan<Tz: TimeZone>(
    config: &ScanPolicyConfig,
    now: &DateTime<Tz>,
    is_on_wifi: bool,
    is_charging: bool,
) -> bool {
    environment_allows(config, now, is_on_wifi, is_charging) && scan_is_due(config, now)
}
