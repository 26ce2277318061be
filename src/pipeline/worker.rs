//! The caption worker: claims queued images one at a time, calls the
//! provider with the state lock released, and applies the outcome.
//!
//! A drain holds both the in-process slot and the store's drain lease, so
//! only one drain runs per store even across processes.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::{Pipeline, RunContext, State};
use crate::db::PersistentStore;
use crate::error::{PipelineError, Result};
use crate::tasks::{TaskProgress, TaskUpdate};

const PAUSE_SLICE: Duration = Duration::from_millis(50);

/// Totals for one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    pub processed: usize,
    pub failed: usize,
    /// Results thrown away because the image was deleted mid-call.
    pub discarded: usize,
    pub cancelled: bool,
    /// Queue length when the drain stopped.
    pub remaining: usize,
}

/// Holds the single processing slot, and the store lease once taken.
/// Releases both on drop.
pub(super) struct DrainGuard<'a> {
    flag: &'a AtomicBool,
    lease: Option<(&'a dyn PersistentStore, &'a str)>,
}

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag, lease: None })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if let Some((store, owner)) = self.lease.take() {
            if let Err(e) = store.release_drain_lease(owner) {
                tracing::warn!(error = %e, "Failed to release drain lease");
            }
        }
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// An image moved to `processing` and awaiting its provider call.
struct Claimed {
    id: String,
    source_ref: String,
    file_name: String,
}

/// Sleep for `duration` unless `cancel` fires first. Returns false if cancelled.
fn pause(duration: Duration, cancel: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(PAUSE_SLICE.min(deadline - now));
    }
}

/// Record the provider's answer on a claimed image.
///
/// Returns the stored caption. Any error other than `NotFound` (image
/// deleted mid-call), `ProviderUnconfigured` or `Cancelled` (image handed
/// back to the queue untouched) has been written to the record.
fn apply_result(
    state: &mut State,
    item: &Claimed,
    result: Result<String>,
    now: DateTime<Utc>,
) -> Result<String> {
    let record = match state.records.get_mut(&item.id) {
        Ok(record) => record,
        Err(e) => {
            tracing::info!(id = %item.id, "Image deleted while captioning; result discarded");
            return Err(e);
        }
    };

    let applied = match result {
        Ok(text) => match record.complete(&text, now) {
            Ok(()) => Ok(record.caption.clone().unwrap_or_default()),
            Err(e) => {
                if let Err(fe) = record.fail(e.to_string(), now) {
                    tracing::warn!(id = %item.id, error = %fe, "Could not record failure");
                }
                Err(e)
            }
        },
        Err(e @ (PipelineError::ProviderUnconfigured(_) | PipelineError::Cancelled)) => {
            if let Err(re) = record.release() {
                tracing::warn!(id = %item.id, error = %re, "Could not release image");
            }
            state.queue.requeue_front(item.id.clone());
            Err(e)
        }
        Err(e) => {
            if let Err(fe) = record.fail(e.to_string(), now) {
                tracing::warn!(id = %item.id, error = %fe, "Could not record failure");
            }
            Err(e)
        }
    };

    match &applied {
        Ok(_) => tracing::info!(id = %item.id, "Image captioned"),
        Err(PipelineError::Cancelled) => {
            tracing::info!(id = %item.id, "Cancelled before retry; image requeued")
        }
        Err(e) => tracing::warn!(id = %item.id, error = %e, "Captioning failed"),
    }
    applied
}

impl Pipeline {
    /// Process queued images until the queue is empty, `limit` items have
    /// been attempted, or the cancel flag is raised.
    ///
    /// Fails with `Busy` if another drain owns the worker, in this process or
    /// another one, and with `ProviderUnconfigured` before touching any image
    /// if the provider cannot run. Storage failures are logged, not returned.
    pub fn drain(&self, limit: Option<usize>, ctx: &RunContext) -> Result<DrainOutcome> {
        let guard = self.begin_drain()?;
        self.drain_holding(guard, limit, ctx)
    }

    /// Take the processing slot and the drain lease, then reload the store.
    pub(super) fn begin_drain(&self) -> Result<DrainGuard<'_>> {
        let mut guard = DrainGuard::acquire(&self.is_processing).ok_or(PipelineError::Busy)?;
        if !self.store.acquire_drain_lease(&self.owner, Utc::now())? {
            tracing::debug!("Another process holds the drain lease");
            return Err(PipelineError::Busy);
        }
        guard.lease = Some((self.store.as_ref(), self.owner.as_str()));
        self.reload()?;
        Ok(guard)
    }

    pub(super) fn drain_holding(
        &self,
        guard: DrainGuard<'_>,
        limit: Option<usize>,
        ctx: &RunContext,
    ) -> Result<DrainOutcome> {
        self.notify();
        let result = self.drain_claimed(limit, ctx);
        drop(guard);
        self.notify();
        result
    }

    fn drain_claimed(&self, limit: Option<usize>, ctx: &RunContext) -> Result<DrainOutcome> {
        let queued = self.lock().queue.len();
        let total = limit.map_or(queued, |l| l.min(queued));
        if let Some(ref tx) = ctx.progress {
            let _ = tx.send(TaskUpdate::Started { total });
        }

        let detailed = self.settings().processing.generate_detailed_caption;
        let mut outcome = DrainOutcome::default();
        let mut attempted = 0usize;

        loop {
            if limit.is_some_and(|l| attempted >= l) {
                break;
            }
            if ctx.cancel.load(Ordering::SeqCst) {
                outcome.cancelled = true;
                break;
            }
            if self.lock().queue.is_empty() {
                break;
            }
            if !self.provider.is_configured() {
                return Err(PipelineError::ProviderUnconfigured(format!(
                    "{} is missing credentials",
                    self.provider.provider_name()
                )));
            }
            if attempted > 0 && !pause(self.options.worker.rate_limit_delay(), &ctx.cancel) {
                outcome.cancelled = true;
                break;
            }
            if !self.renew_lease() {
                break;
            }

            let Some(item) = self.claim_next() else {
                break;
            };
            attempted += 1;
            if let Some(ref tx) = ctx.progress {
                let _ = tx.send(TaskUpdate::Progress(
                    TaskProgress::new(attempted, total.max(attempted)).with_item(&item.file_name),
                ));
            }

            match self.process_one(&item, &ctx.cancel) {
                Ok(_) => {
                    outcome.processed += 1;
                    if detailed {
                        if let Err(e) = self.generate_detailed_caption(&item.id) {
                            tracing::warn!(id = %item.id, error = %e, "Detailed caption failed");
                        }
                    }
                }
                Err(PipelineError::NotFound(_)) => outcome.discarded += 1,
                Err(PipelineError::Cancelled) => {
                    outcome.cancelled = true;
                    break;
                }
                Err(e) if e.aborts_pass() => return Err(e),
                Err(_) => outcome.failed += 1,
            }
        }

        outcome.remaining = self.lock().queue.len();
        tracing::info!(
            processed = outcome.processed,
            failed = outcome.failed,
            discarded = outcome.discarded,
            remaining = outcome.remaining,
            cancelled = outcome.cancelled,
            "Drain finished"
        );
        Ok(outcome)
    }

    /// Extend the drain lease. Returns false if another process has taken it.
    fn renew_lease(&self) -> bool {
        match self.store.acquire_drain_lease(&self.owner, Utc::now()) {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!("Drain lease taken by another process; stopping");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not renew drain lease");
                true
            }
        }
    }

    /// Pop ids until one can enter `processing`. Ids whose image vanished or
    /// is no longer unprocessed are dropped from the queue.
    fn claim_next(&self) -> Option<Claimed> {
        let claimed = self.mutate(|state| {
            while let Some(id) = state.queue.dequeue() {
                match state.records.get_mut(&id) {
                    Ok(record) => match record.begin_processing(Utc::now()) {
                        Ok(()) => {
                            return Ok(Some(Claimed {
                                source_ref: record.source_ref.clone(),
                                file_name: record.file_name.clone(),
                                id,
                            }));
                        }
                        Err(e) => tracing::warn!(id = %id, error = %e, "Skipping queued image"),
                    },
                    Err(_) => tracing::debug!(id = %id, "Queued image no longer exists"),
                }
            }
            Ok(None)
        });

        self.notify();
        claimed.unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to claim next image");
            None
        })
    }

    /// Caption one claimed image and record the outcome on it.
    fn process_one(&self, item: &Claimed, cancel: &AtomicBool) -> Result<String> {
        tracing::debug!(id = %item.id, "Requesting caption");
        let result = self.caption_with_retry(&item.source_ref, cancel);
        let now = Utc::now();

        let applied = self
            .mutate(|state| Ok(apply_result(state, item, result, now)))
            .unwrap_or_else(|e| {
                tracing::error!(id = %item.id, error = %e, "Failed to store caption outcome");
                Err(e)
            });
        self.notify();
        applied
    }

    /// Ask for the short caption, retrying transient failures with backoff.
    ///
    /// A cancel raised during a backoff ends with `Cancelled`.
    fn caption_with_retry(&self, source_ref: &str, cancel: &AtomicBool) -> Result<String> {
        let worker = &self.options.worker;
        let max_attempts = worker.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let err = match self.provider.generate_short_caption(source_ref) {
                Ok(text) => return Ok(text),
                Err(e) => PipelineError::from(e),
            };
            if !err.is_transient() || attempt >= max_attempts {
                return Err(err);
            }

            let backoff = worker.backoff(attempt);
            tracing::warn!(
                attempt,
                max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Caption attempt failed; retrying"
            );
            if !pause(backoff, cancel) {
                return Err(PipelineError::Cancelled);
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caption::{CaptionError, CaptionKind, CaptionProvider, CaptionResult};
    use crate::config::WorkerConfig;
    use crate::db::MemoryStore;
    use crate::pipeline::{ImageStatus, PipelineOptions, Trigger};
    use crate::scanner::{AssetPage, AssetSource};
    use crate::schedule::Environment;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    struct NoAssets;

    impl AssetSource for NoAssets {
        fn fetch_page(&self, _after: Option<&str>, _limit: usize) -> Result<AssetPage> {
            Ok(AssetPage::default())
        }
    }

    /// Replays a fixed list of responses, then fails.
    struct Replay {
        responses: Mutex<VecDeque<CaptionResult<String>>>,
        calls: Mutex<usize>,
    }

    impl Replay {
        fn new(responses: Vec<CaptionResult<String>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    impl CaptionProvider for Replay {
        fn caption(&self, _source_ref: &str, _kind: CaptionKind) -> CaptionResult<String> {
            *self.calls.lock().unwrap() += 1;
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(CaptionError::Unavailable))
        }

        fn provider_name(&self) -> &'static str {
            "replay"
        }
    }

    fn pipeline_with(provider: Arc<Replay>, worker: WorkerConfig) -> Pipeline {
        let options = PipelineOptions {
            worker,
            ..PipelineOptions::default()
        };
        Pipeline::open(Arc::new(MemoryStore::new()), provider, Arc::new(NoAssets), options)
            .unwrap()
    }

    fn pipeline(provider: Arc<Replay>, max_attempts: u32) -> Pipeline {
        pipeline_with(
            provider,
            WorkerConfig {
                rate_limit_delay_ms: 0,
                max_attempts,
                retry_backoff_ms: 1,
            },
        )
    }

    fn ctx() -> RunContext {
        RunContext::new(Trigger::Foreground { scan: false }, Environment::default())
    }

    #[test]
    fn test_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let first = DrainGuard::acquire(&flag).unwrap();
        assert!(DrainGuard::acquire(&flag).is_none());
        drop(first);
        assert!(!flag.load(Ordering::SeqCst));
        assert!(DrainGuard::acquire(&flag).is_some());
    }

    #[test]
    fn test_pause_stops_on_cancel() {
        let cancel = AtomicBool::new(true);
        let started = Instant::now();
        assert!(!pause(Duration::from_secs(5), &cancel));
        assert!(started.elapsed() < Duration::from_secs(1));

        let cancel = AtomicBool::new(false);
        assert!(pause(Duration::from_millis(5), &cancel));
    }

    #[test]
    fn test_transient_failure_is_retried() {
        let provider = Replay::new(vec![
            Err(CaptionError::Unavailable),
            Err(CaptionError::Request("timeout".into())),
            Ok("A lighthouse at dusk".into()),
        ]);
        let p = pipeline(provider.clone(), 3);
        let record = p.import("/photos/light.jpg").unwrap();

        let outcome = p.drain(None, &ctx()).unwrap();
        assert_eq!(outcome.processed, 1);
        assert_eq!(provider.calls(), 3);
        let stored = p.get(&record.id).unwrap();
        assert_eq!(stored.status, ImageStatus::Processed);
        assert_eq!(stored.caption.as_deref(), Some("A lighthouse at dusk"));
    }

    #[test]
    fn test_single_attempt_fails_immediately() {
        let provider = Replay::new(vec![Err(CaptionError::Unavailable), Ok("never".into())]);
        let p = pipeline(provider.clone(), 1);
        let record = p.import("/photos/a.jpg").unwrap();

        let outcome = p.drain(None, &ctx()).unwrap();
        assert_eq!(outcome.failed, 1);
        assert_eq!(provider.calls(), 1);
        let stored = p.get(&record.id).unwrap();
        assert_eq!(stored.status, ImageStatus::Error);
        assert!(stored.caption.is_none());
        assert!(stored.error.is_some());
    }

    #[test]
    fn test_empty_result_is_not_retried() {
        let provider = Replay::new(vec![Err(CaptionError::Empty), Ok("late".into())]);
        let p = pipeline(provider.clone(), 3);
        let record = p.import("/photos/a.jpg").unwrap();

        p.drain(None, &ctx()).unwrap();
        assert_eq!(provider.calls(), 1);
        assert_eq!(p.get(&record.id).unwrap().status, ImageStatus::Error);
    }

    #[test]
    fn test_unconfigured_mid_call_requeues() {
        let provider = Replay::new(vec![
            Err(CaptionError::NotConfigured("key revoked".into())),
            Ok("A quiet street".into()),
        ]);
        let p = pipeline(provider, 3);
        let record = p.import("/photos/a.jpg").unwrap();

        let err = p.drain(None, &ctx()).unwrap_err();
        assert!(matches!(err, PipelineError::ProviderUnconfigured(_)));
        let stored = p.get(&record.id).unwrap();
        assert_eq!(stored.status, ImageStatus::Unprocessed);
        assert!(stored.processing_started_at.is_none());
        assert_eq!(p.queued_ids(), vec![record.id.clone()]);
        assert!(!p.is_processing());

        // Released images enter processing again without a reprocess.
        let outcome = p.drain(None, &ctx()).unwrap();
        assert_eq!(outcome.processed, 1);
        let stored = p.get(&record.id).unwrap();
        assert_eq!(stored.status, ImageStatus::Processed);
        assert_eq!(stored.caption.as_deref(), Some("A quiet street"));
    }

    #[test]
    fn test_cancel_during_backoff_requeues() {
        let provider = Replay::new(vec![Err(CaptionError::Unavailable), Ok("A harbour".into())]);
        let p = pipeline_with(
            provider.clone(),
            WorkerConfig {
                rate_limit_delay_ms: 0,
                max_attempts: 3,
                retry_backoff_ms: 30_000,
            },
        );
        let record = p.import("/photos/harbour.jpg").unwrap();

        let run = ctx();
        let cancel = run.cancel.clone();
        let watched = provider.clone();
        let canceller = std::thread::spawn(move || {
            while watched.calls() == 0 {
                std::thread::sleep(Duration::from_millis(5));
            }
            cancel.store(true, Ordering::SeqCst);
        });

        let started = Instant::now();
        let outcome = p.drain(None, &run).unwrap();
        canceller.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(outcome.cancelled);
        assert_eq!(outcome.failed, 0);
        assert_eq!(outcome.remaining, 1);
        assert_eq!(provider.calls(), 1);
        let stored = p.get(&record.id).unwrap();
        assert_eq!(stored.status, ImageStatus::Unprocessed);
        assert!(stored.error.is_none());
        assert_eq!(p.queued_ids(), vec![record.id.clone()]);

        let outcome = p.drain(None, &ctx()).unwrap();
        assert_eq!(outcome.processed, 1);
        assert_eq!(p.get(&record.id).unwrap().caption.as_deref(), Some("A harbour"));
    }

    #[test]
    fn test_limit_caps_attempts() {
        let provider = Replay::new(vec![Ok("one".into()), Ok("two".into())]);
        let p = pipeline(provider.clone(), 1);
        p.import("/photos/a.jpg").unwrap();
        p.import("/photos/b.jpg").unwrap();

        let outcome = p.drain(Some(1), &ctx()).unwrap();
        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.remaining, 1);
        assert_eq!(provider.calls(), 1);
    }

    #[test]
    fn test_drain_is_busy_while_another_owner_holds_the_lease() {
        let store = Arc::new(MemoryStore::new());
        let provider = Replay::new(vec![Ok("A field".into())]);
        let p = Pipeline::open(
            store.clone(),
            provider.clone(),
            Arc::new(NoAssets),
            PipelineOptions::default(),
        )
        .unwrap();
        p.import("/photos/field.jpg").unwrap();

        assert!(store.acquire_drain_lease("elsewhere", Utc::now()).unwrap());
        assert!(matches!(p.drain(None, &ctx()), Err(PipelineError::Busy)));
        assert!(!p.is_processing());
        assert_eq!(provider.calls(), 0);

        store.release_drain_lease("elsewhere").unwrap();
        assert_eq!(p.drain(None, &ctx()).unwrap().processed, 1);
        // The lease is given back once the drain ends.
        assert!(store.acquire_drain_lease("elsewhere", Utc::now()).unwrap());
    }
}
