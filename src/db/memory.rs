//! In-memory store for tests and throwaway runs.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{lease_is_live, Collections, PersistentStore};
use crate::pipeline::ImageRecord;
use crate::settings::Settings;

#[derive(Default)]
struct Inner {
    images: Vec<ImageRecord>,
    settings: Option<Settings>,
    queue: Vec<String>,
    last_scan_at: Option<DateTime<Utc>>,
    lease: Option<(String, DateTime<Utc>)>,
    saves: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with settings, as if a previous session had saved them.
    pub fn with_settings(settings: Settings) -> Self {
        let store = Self::new();
        store.lock().settings = Some(settings);
        store
    }

    /// Number of writes to the image collection so far.
    pub fn image_saves(&self) -> usize {
        self.lock().saves
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PersistentStore for MemoryStore {
    fn load_images(&self) -> Result<Vec<ImageRecord>> {
        Ok(self.lock().images.clone())
    }

    fn save_images(&self, images: &[ImageRecord]) -> Result<()> {
        let mut inner = self.lock();
        inner.images = images.to_vec();
        inner.saves += 1;
        Ok(())
    }

    fn load_settings(&self) -> Result<Settings> {
        Ok(self.lock().settings.clone().unwrap_or_default())
    }

    fn save_settings(&self, settings: &Settings) -> Result<()> {
        self.lock().settings = Some(settings.clone());
        Ok(())
    }

    fn load_queue(&self) -> Result<Vec<String>> {
        Ok(self.lock().queue.clone())
    }

    fn save_queue(&self, ids: &[String]) -> Result<()> {
        self.lock().queue = ids.to_vec();
        Ok(())
    }

    fn load_last_scan_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.lock().last_scan_at)
    }

    fn save_last_scan_at(&self, at: DateTime<Utc>) -> Result<()> {
        self.lock().last_scan_at = Some(at);
        Ok(())
    }

    fn update(&self, apply: &mut dyn FnMut(&mut Collections) -> Result<bool>) -> Result<()> {
        let mut inner = self.lock();
        let mut data = Collections {
            images: inner.images.clone(),
            queue: inner.queue.clone(),
        };
        if apply(&mut data)? {
            inner.images = data.images;
            inner.queue = data.queue;
            inner.saves += 1;
        }
        Ok(())
    }

    fn acquire_drain_lease(&self, owner: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.lock();
        if let Some((holder, renewed_at)) = &inner.lease {
            if holder != owner && lease_is_live(*renewed_at, now) {
                return Ok(false);
            }
        }
        inner.lease = Some((owner.to_string(), now));
        Ok(true)
    }

    fn release_drain_lease(&self, owner: &str) -> Result<()> {
        let mut inner = self.lock();
        if inner.lease.as_ref().is_some_and(|(holder, _)| holder == owner) {
            inner.lease = None;
        }
        Ok(())
    }
}
