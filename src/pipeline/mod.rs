//! The captioning pipeline: record store, processing queue and the worker
//! that drains it, shared between user actions and periodic triggers.
//!
//! All mutable state sits behind one mutex. The only blocking work, the
//! provider call and the library scan, runs with that mutex released.
//!
//! Another process may share the store, so every mutation reloads images and
//! queue from it first and writes them back in the same store transaction.
//! Queries read the copy left by the most recent operation.

pub mod queue;
pub mod record;
mod worker;

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::caption::CaptionProvider;
use crate::config::{Config, WorkerConfig};
use crate::db::{Collections, PersistentStore};
use crate::error::{PipelineError, Result};
use crate::scanner::{scan_for_new, AssetSource};
use crate::schedule::{connectivity_allows, environment_allows, should_scan, Environment};
use crate::settings::Settings;
use crate::tasks::TaskUpdate;

pub use queue::ProcessingQueue;
pub use record::{ImageRecord, ImageStatus, RecordStore};
pub use worker::DrainOutcome;

/// Reason recorded on images that were mid-call when the last session ended.
pub const INTERRUPTED_REASON: &str = "Interrupted before a caption was received";

/// What a background firing reports back to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundFetchResult {
    NewData,
    NoData,
    Failed,
}

/// Who asked for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Periodic wake-up: every gate applies and at most one item is drained.
    Background,
    /// User request: only network and power gates apply; drains everything.
    Foreground { scan: bool },
}

pub struct RunContext {
    pub trigger: Trigger,
    pub environment: Environment,
    pub cancel: Arc<AtomicBool>,
    pub progress: Option<mpsc::Sender<TaskUpdate>>,
}

impl RunContext {
    pub fn new(trigger: Trigger, environment: Environment) -> Self {
        Self {
            trigger,
            environment,
            cancel: Arc::new(AtomicBool::new(false)),
            progress: None,
        }
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: mpsc::Sender<TaskUpdate>) -> Self {
        self.progress = Some(progress);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// The run was refused by a gate before doing anything.
    pub gated: bool,
    pub scanned: bool,
    pub discovered: usize,
    pub drain: DrainOutcome,
}

impl RunReport {
    pub fn fetch_result(&self) -> BackgroundFetchResult {
        if self.discovered > 0 || self.drain.processed > 0 || self.drain.failed > 0 {
            BackgroundFetchResult::NewData
        } else {
            BackgroundFetchResult::NoData
        }
    }
}

/// Point-in-time view handed to observers.
#[derive(Debug, Clone)]
pub struct PipelineSnapshot {
    pub records: Vec<ImageRecord>,
    pub queue_len: usize,
    pub is_processing: bool,
    pub last_scan_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub worker: WorkerConfig,
    pub page_size: usize,
    pub scan_batch_size: usize,
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            worker: config.worker.clone(),
            page_size: config.library.page_size,
            scan_batch_size: config.library.scan_batch_size,
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

struct State {
    records: RecordStore,
    queue: ProcessingQueue,
    last_scan_at: Option<DateTime<Utc>>,
}

pub struct Pipeline {
    state: Mutex<State>,
    settings: RwLock<Settings>,
    is_processing: AtomicBool,
    observers: Mutex<Vec<mpsc::Sender<PipelineSnapshot>>>,
    /// Identifies this pipeline as holder of the store's drain lease.
    owner: String,
    store: Arc<dyn PersistentStore>,
    provider: Arc<dyn CaptionProvider>,
    source: Arc<dyn AssetSource>,
    options: PipelineOptions,
}

impl Pipeline {
    /// Load persisted state and build the pipeline around it.
    ///
    /// Images left in `processing` by an interrupted session are marked
    /// `error` so that Reprocess can recover them; queued ids that no longer
    /// point at an unprocessed image are dropped. Both are skipped while
    /// another process is draining the same store.
    pub fn open(
        store: Arc<dyn PersistentStore>,
        provider: Arc<dyn CaptionProvider>,
        source: Arc<dyn AssetSource>,
        options: PipelineOptions,
    ) -> Result<Self> {
        let owner = uuid::Uuid::new_v4().simple().to_string();
        recover_interrupted(store.as_ref(), &owner)?;

        let records = RecordStore::from_records(store.load_images()?);
        let queue = ProcessingQueue::from_ids(store.load_queue()?);
        let mut settings = store.load_settings()?;
        let last_scan_at = store.load_last_scan_at()?;
        settings.scan.last_scan_at = last_scan_at;

        tracing::info!(
            images = records.len(),
            queued = queue.len(),
            provider = provider.provider_name(),
            "Pipeline loaded"
        );

        Ok(Self {
            state: Mutex::new(State {
                records,
                queue,
                last_scan_at,
            }),
            settings: RwLock::new(settings),
            is_processing: AtomicBool::new(false),
            observers: Mutex::new(Vec::new()),
            owner,
            store,
            provider,
            source,
            options,
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reload images and queue from the store, run `apply` on them, and
    /// write them back if it succeeded and changed anything.
    ///
    /// The state lock is held throughout, so `apply` must not call back into
    /// the pipeline or the store. A failed `apply` leaves both untouched.
    fn mutate<T>(&self, apply: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let mut apply = Some(apply);
        let mut outcome = None;

        self.store.update(&mut |data: &mut Collections| -> anyhow::Result<bool> {
            let loaded = data.clone();
            state.records = RecordStore::from_records(std::mem::take(&mut data.images));
            state.queue = ProcessingQueue::from_ids(std::mem::take(&mut data.queue));
            let Some(apply) = apply.take() else {
                return Ok(false);
            };

            let result = apply(&mut *state);
            let write = match &result {
                Ok(_) => {
                    data.images = state.records.records().to_vec();
                    data.queue = state.queue.ids();
                    *data != loaded
                }
                Err(_) => {
                    state.records = RecordStore::from_records(loaded.images.clone());
                    state.queue = ProcessingQueue::from_ids(loaded.queue.clone());
                    false
                }
            };
            outcome = Some(result);
            Ok(write)
        })?;

        outcome.unwrap_or_else(|| {
            Err(PipelineError::Storage(anyhow::anyhow!("Store skipped the update")))
        })
    }

    /// Refresh the local copy with whatever another process has written.
    fn reload(&self) -> Result<()> {
        self.mutate(|_| Ok(()))?;
        let last_scan_at = self.store.load_last_scan_at()?;
        self.lock().last_scan_at = last_scan_at;
        Ok(())
    }

    // --- observers ---

    /// Receive a snapshot after every state change.
    pub fn subscribe(&self) -> mpsc::Receiver<PipelineSnapshot> {
        let (tx, rx) = mpsc::channel();
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        let state = self.lock();
        PipelineSnapshot {
            records: state.records.records().to_vec(),
            queue_len: state.queue.len(),
            is_processing: self.is_processing(),
            last_scan_at: state.last_scan_at,
        }
    }

    fn notify(&self) {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        if observers.is_empty() {
            return;
        }
        let snapshot = self.snapshot();
        observers.retain(|tx| tx.send(snapshot.clone()).is_ok());
    }

    // --- queries ---

    pub fn is_processing(&self) -> bool {
        self.is_processing.load(Ordering::SeqCst)
    }

    pub fn get(&self, id: &str) -> Option<ImageRecord> {
        self.lock().records.get(id).cloned()
    }

    pub fn records(&self) -> Vec<ImageRecord> {
        self.lock().records.records().to_vec()
    }

    pub fn queued_ids(&self) -> Vec<String> {
        self.lock().queue.ids()
    }

    pub fn last_scan_at(&self) -> Option<DateTime<Utc>> {
        self.lock().last_scan_at
    }

    pub fn provider(&self) -> &dyn CaptionProvider {
        self.provider.as_ref()
    }

    // --- settings ---

    /// The stored settings; `scan.last_scan_at` is filled in.
    ///
    /// Falls back to the last copy read if the store cannot be read.
    pub fn settings(&self) -> Settings {
        match self.store.load_settings() {
            Ok(stored) => {
                *self.settings.write().unwrap_or_else(PoisonError::into_inner) = stored;
            }
            Err(e) => tracing::warn!(error = %e, "Using cached settings"),
        }
        let mut settings = self
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        settings.scan.last_scan_at = self.last_scan_at();
        settings
    }

    /// Apply `update` to the settings and persist the result.
    pub fn update_settings<F>(&self, update: F) -> Result<Settings>
    where
        F: FnOnce(&mut Settings) -> anyhow::Result<()>,
    {
        let mut guard = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = self.store.load_settings()?;
        update(&mut next).map_err(|e| PipelineError::InvalidSetting(e.to_string()))?;
        self.store.save_settings(&next)?;
        *guard = next;
        drop(guard);

        tracing::info!("Settings updated");
        Ok(self.settings())
    }

    // --- record operations ---

    /// Register an image the user picked or captured.
    ///
    /// Importing a location that is already known returns the existing
    /// record unchanged.
    pub fn import(&self, source_ref: &str) -> Result<ImageRecord> {
        let auto_process = self.settings().processing.auto_process_on_import;
        let (record, created) = self.mutate(|state| {
            if let Some(existing) = state.records.find_by_source(source_ref) {
                return Ok((existing.clone(), false));
            }

            let file_name = std::path::Path::new(source_ref)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| source_ref.to_string());
            let record = ImageRecord::new(
                format!("img_{}", uuid::Uuid::new_v4().simple()),
                source_ref,
                file_name,
            );

            state.records.insert(record.clone());
            if auto_process {
                state.queue.enqueue(record.id.clone());
            }
            Ok((record, true))
        })?;

        if !created {
            tracing::debug!(id = %record.id, "Image already imported");
            return Ok(record);
        }
        tracing::info!(id = %record.id, source = %source_ref, "Imported image");
        self.notify();
        Ok(record)
    }

    /// Scan the asset source for images not yet in the store and insert them.
    pub fn scan(&self) -> Result<Vec<ImageRecord>> {
        self.scan_at(Utc::now())
    }

    /// Scan as of `now`, which becomes the recorded scan time.
    ///
    /// Returns the records added. Records the scan time even when nothing new
    /// turned up.
    pub fn scan_at(&self, now: DateTime<Utc>) -> Result<Vec<ImageRecord>> {
        self.reload()?;
        let existing = self.records();
        let found = scan_for_new(
            self.source.as_ref(),
            &existing,
            self.options.scan_batch_size,
            self.options.page_size,
        )?;

        let auto_process = self.settings().processing.auto_process_on_import;
        let added = self.mutate(|state| {
            let mut added = Vec::with_capacity(found.len());
            for record in found {
                // Something may have been imported while the scan ran unlocked.
                if state.records.find_by_source(&record.source_ref).is_some() {
                    continue;
                }
                if !state.records.insert(record.clone()) {
                    continue;
                }
                if auto_process {
                    state.queue.enqueue(record.id.clone());
                }
                added.push(record);
            }
            Ok(added)
        })?;
        self.store.save_last_scan_at(now)?;
        self.lock().last_scan_at = Some(now);

        tracing::info!(new = added.len(), "Library scan complete");
        self.notify();
        Ok(added)
    }

    /// Queue an unprocessed image. Returns false if it was already queued.
    pub fn enqueue(&self, id: &str) -> Result<bool> {
        let added = self.mutate(|state| {
            let record = state
                .records
                .get(id)
                .ok_or_else(|| PipelineError::NotFound(id.to_string()))?;
            if record.status != ImageStatus::Unprocessed {
                return Err(PipelineError::InvalidTransition {
                    id: id.to_string(),
                    from: record.status,
                    to: ImageStatus::Processing,
                });
            }
            Ok(state.queue.enqueue(id))
        })?;

        if added {
            self.notify();
        }
        Ok(added)
    }

    /// Reset a processed or failed image to `unprocessed`.
    ///
    /// The image is only queued again when `enqueue` is set.
    pub fn reprocess(&self, id: &str, enqueue: bool) -> Result<ImageRecord> {
        let record = self.mutate(|state| {
            let record = state.records.get_mut(id)?;
            record.reprocess()?;
            let record = record.clone();
            if enqueue {
                state.queue.enqueue(id);
            }
            Ok(record)
        })?;

        tracing::info!(id = %id, enqueue, "Image reset for reprocessing");
        self.notify();
        Ok(record)
    }

    /// Remove an image and purge it from the queue.
    ///
    /// Deleting an image whose caption is in flight is allowed; the eventual
    /// result is discarded.
    pub fn delete(&self, id: &str) -> Result<ImageRecord> {
        let removed = self.mutate(|state| {
            let removed = state
                .records
                .remove(id)
                .ok_or_else(|| PipelineError::NotFound(id.to_string()))?;
            state.queue.remove(id);
            Ok(removed)
        })?;

        tracing::info!(id = %id, "Image deleted");
        self.notify();
        Ok(removed)
    }

    /// Generate the long caption for a processed image.
    ///
    /// Returns the stored text without calling the provider if one exists.
    pub fn generate_detailed_caption(&self, id: &str) -> Result<String> {
        self.reload()?;
        let source_ref = {
            let state = self.lock();
            let record = state
                .records
                .get(id)
                .ok_or_else(|| PipelineError::NotFound(id.to_string()))?;
            if record.status != ImageStatus::Processed {
                return Err(PipelineError::InvalidTransition {
                    id: id.to_string(),
                    from: record.status,
                    to: ImageStatus::Processed,
                });
            }
            if let Some(ref existing) = record.detailed_caption {
                return Ok(existing.clone());
            }
            record.source_ref.clone()
        };

        let text = self.provider.generate_detailed_caption(&source_ref)?;

        let (stored, written) = self.mutate(|state| {
            let record = state.records.get_mut(id)?;
            if let Some(ref existing) = record.detailed_caption {
                // Another caller won the race.
                return Ok((existing.clone(), false));
            }
            record.set_detailed_caption(&text)?;
            Ok((record.detailed_caption.clone().unwrap_or_default(), true))
        })?;
        if !written {
            return Ok(stored);
        }

        tracing::info!(id = %id, "Detailed caption stored");
        self.notify();
        Ok(stored)
    }

    // --- triggers ---

    /// Single entry point for periodic and user-initiated runs.
    pub fn run<Tz: TimeZone>(&self, ctx: &RunContext, now: &DateTime<Tz>) -> Result<RunReport> {
        self.reload()?;
        let settings = self.settings();
        let scan_time = now.with_timezone(&Utc);
        let env = ctx.environment;
        let mut report = RunReport::default();

        match ctx.trigger {
            Trigger::Background => {
                if should_scan(&settings.scan, now, env.on_wifi, env.charging) {
                    report.scanned = true;
                    report.discovered = self.scan_at(scan_time)?.len();
                }
                if !environment_allows(&settings.scan, now, env.on_wifi, env.charging) {
                    report.gated = !report.scanned;
                    return Ok(report);
                }
                match self.drain(Some(1), ctx) {
                    Ok(outcome) => report.drain = outcome,
                    Err(PipelineError::Busy) => {
                        tracing::debug!("Worker busy; skipping background drain");
                    }
                    Err(e) => return Err(e),
                }
            }
            Trigger::Foreground { scan } => {
                if !connectivity_allows(&settings.scan, env.on_wifi, env.charging) {
                    tracing::info!(
                        on_wifi = env.on_wifi,
                        charging = env.charging,
                        "Network or power requirements not met"
                    );
                    report.gated = true;
                    return Ok(report);
                }
                let guard = self.begin_drain()?;
                if scan {
                    report.scanned = true;
                    report.discovered = self.scan_at(scan_time)?.len();
                }
                report.drain = self.drain_holding(guard, None, ctx)?;
            }
        }

        Ok(report)
    }

    /// Periodic entry point. Never fails; errors are folded into the result.
    pub fn run_background<Tz: TimeZone>(
        &self,
        environment: Environment,
        now: &DateTime<Tz>,
    ) -> BackgroundFetchResult {
        let ctx = RunContext::new(Trigger::Background, environment);
        match self.run(&ctx, now) {
            Ok(report) => report.fetch_result(),
            Err(e) if e.aborts_pass() => {
                tracing::warn!(error = %e, "Background run aborted");
                BackgroundFetchResult::NoData
            }
            Err(e) => {
                tracing::error!(error = %e, "Background run failed");
                BackgroundFetchResult::Failed
            }
        }
    }
}

/// Fail images left in `processing` by a session that died mid-call and drop
/// queued ids that no longer point at an unprocessed image.
///
/// Skipped while another process holds the drain lease, since its in-flight
/// images are still being captioned.
fn recover_interrupted(store: &dyn PersistentStore, owner: &str) -> Result<()> {
    let now = Utc::now();
    if !store.acquire_drain_lease(owner, now)? {
        tracing::info!("Another process is draining; leaving in-flight images alone");
        return Ok(());
    }

    let result = store.update(&mut |data: &mut Collections| -> anyhow::Result<bool> {
        let mut records = RecordStore::from_records(std::mem::take(&mut data.images));
        let stale = records.stale_processing();
        for id in &stale {
            records.get_mut(id)?.fail(INTERRUPTED_REASON, now)?;
        }
        if !stale.is_empty() {
            tracing::warn!(count = stale.len(), "Marked interrupted images as failed");
        }

        let queued = data.queue.len();
        data.queue.retain(|id| {
            records
                .get(id)
                .is_some_and(|r| r.status == ImageStatus::Unprocessed)
        });
        data.images = records.records().to_vec();
        Ok(!stale.is_empty() || data.queue.len() != queued)
    });
    store.release_drain_lease(owner)?;
    Ok(result?)
}
