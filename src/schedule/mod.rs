//! Periodic wake-ups for background captioning, plus the gates that decide
//! whether a wake-up may do any work.

pub mod environment;
pub mod policy;

use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub use environment::{Environment, EnvironmentProbe, StaticProbe, SysfsProbe};
pub use policy::{connectivity_allows, environment_allows, scan_is_due, should_scan};

/// Shortest interval a periodic registration may request.
pub const MIN_PERIODIC_INTERVAL: Duration = Duration::from_secs(15);

pub type PeriodicCallback = Arc<dyn Fn() + Send + Sync>;

/// Whether the host lets us schedule background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerStatus {
    Available,
    /// Background work was switched off by the user.
    Denied,
    /// The host cannot run periodic work (no async runtime).
    Restricted,
}

impl SchedulerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerStatus::Available => "available",
            SchedulerStatus::Denied => "denied",
            SchedulerStatus::Restricted => "restricted",
        }
    }
}

/// Host-side periodic registration. The callback owns whatever handles it
/// needs; the scheduler never reaches into pipeline state.
pub trait Scheduler {
    fn register_periodic(
        &mut self,
        min_interval: Duration,
        callback: PeriodicCallback,
    ) -> Result<()>;
    fn unregister(&mut self);
    fn status(&self) -> SchedulerStatus;
}

/// Runs the callback on tokio's blocking pool at a fixed interval.
pub struct TokioScheduler {
    handle: Option<Handle>,
    task: Option<JoinHandle<()>>,
    enabled: bool,
    floor: Duration,
}

impl TokioScheduler {
    /// Bind to the current runtime, if there is one.
    pub fn new() -> Self {
        Self {
            handle: Handle::try_current().ok(),
            task: None,
            enabled: true,
            floor: MIN_PERIODIC_INTERVAL,
        }
    }

    pub fn with_floor(mut self, floor: Duration) -> Self {
        self.floor = floor;
        self
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.unregister();
        }
    }

    pub fn is_registered(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TokioScheduler {
    fn register_periodic(
        &mut self,
        min_interval: Duration,
        callback: PeriodicCallback,
    ) -> Result<()> {
        let handle = match (self.status(), self.handle.as_ref()) {
            (SchedulerStatus::Available, Some(handle)) => handle.clone(),
            (status, _) => bail!("Background scheduling is {}", status.as_str()),
        };

        // Re-registering replaces the previous wake-up.
        self.unregister();

        let interval = min_interval.max(self.floor);
        tracing::info!(
            interval_secs = interval.as_secs_f64(),
            "Registering periodic background task"
        );

        self.task = Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; wait a full interval instead.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let callback = Arc::clone(&callback);
                if let Err(e) = tokio::task::spawn_blocking(move || callback()).await {
                    tracing::error!(error = %e, "Background task panicked");
                }
            }
        }));

        Ok(())
    }

    fn unregister(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::info!("Periodic background task unregistered");
        }
    }

    fn status(&self) -> SchedulerStatus {
        if !self.enabled {
            SchedulerStatus::Denied
        } else if self.handle.is_none() {
            SchedulerStatus::Restricted
        } else {
            SchedulerStatus::Available
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        self.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_restricted_without_runtime() {
        let mut scheduler = TokioScheduler::new();
        assert_eq!(scheduler.status(), SchedulerStatus::Restricted);
        assert!(scheduler
            .register_periodic(Duration::from_secs(60), Arc::new(|| {}))
            .is_err());
    }

    #[tokio::test]
    async fn test_denied_when_disabled() {
        let mut scheduler = TokioScheduler::new();
        scheduler.set_enabled(false);
        assert_eq!(scheduler.status(), SchedulerStatus::Denied);
        assert!(scheduler
            .register_periodic(Duration::from_secs(60), Arc::new(|| {}))
            .is_err());
    }

    #[tokio::test]
    async fn test_periodic_fires_until_unregistered() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let mut scheduler = TokioScheduler::new().with_floor(Duration::from_millis(10));
        assert_eq!(scheduler.status(), SchedulerStatus::Available);
        scheduler
            .register_periodic(
                Duration::from_millis(20),
                Arc::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert!(scheduler.is_registered());

        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.unregister();
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 2, "fired {} times", fired);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(count.load(Ordering::SeqCst) <= fired + 1);
        assert!(!scheduler.is_registered());
    }
}
