//! Persistent storage for records, queue, settings and scan bookkeeping.
//!
//! The CLI and the daemon open the same store from separate processes, so
//! nothing may be cached across calls: images and queue are changed through
//! `update`, which reads, edits and writes them under the store's write lock,
//! and at most one process drains at a time by holding the drain lease.

mod schema;
pub mod memory;
pub mod sqlite;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::pipeline::ImageRecord;
use crate::settings::Settings;

pub use memory::MemoryStore;
pub use schema::SCHEMA;
pub use sqlite::SqliteStore;

/// A drain lease not renewed for this long is considered abandoned.
pub const DRAIN_LEASE_SECS: i64 = 600;

/// Images and queue, read and written as one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Collections {
    pub images: Vec<ImageRecord>,
    pub queue: Vec<String>,
}

/// Whether a lease last renewed at `renewed_at` still excludes other owners.
pub fn lease_is_live(renewed_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - renewed_at < Duration::seconds(DRAIN_LEASE_SECS)
}

pub trait PersistentStore: Send + Sync {
    fn load_images(&self) -> Result<Vec<ImageRecord>>;
    fn save_images(&self, images: &[ImageRecord]) -> Result<()>;

    /// Stored settings, or defaults on first launch.
    fn load_settings(&self) -> Result<Settings>;
    fn save_settings(&self, settings: &Settings) -> Result<()>;

    fn load_queue(&self) -> Result<Vec<String>>;
    fn save_queue(&self, ids: &[String]) -> Result<()>;

    fn load_last_scan_at(&self) -> Result<Option<DateTime<Utc>>>;
    fn save_last_scan_at(&self, at: DateTime<Utc>) -> Result<()>;

    /// Load images and queue, hand them to `apply`, and write them back if it
    /// returns true. No other writer can interleave. `apply` must not call
    /// back into the store.
    fn update(&self, apply: &mut dyn FnMut(&mut Collections) -> Result<bool>) -> Result<()>;

    /// Take or renew the store-wide drain lease. Returns false while another
    /// owner holds a live lease.
    fn acquire_drain_lease(&self, owner: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Give the lease up if `owner` holds it.
    fn release_drain_lease(&self, owner: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_expiry() {
        let now = Utc::now();
        assert!(lease_is_live(now - Duration::seconds(DRAIN_LEASE_SECS - 1), now));
        assert!(!lease_is_live(now - Duration::seconds(DRAIN_LEASE_SECS), now));
    }
}
