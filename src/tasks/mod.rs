//! Long-running CLI work (scans, caption batches) run off the main thread.
//!
//! The worker thread sends `TaskUpdate`s and checks a cancel flag between
//! images. The manager on the main thread folds the updates into per-task
//! progress and raises the flag when the user interrupts.

pub mod manager;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use manager::BackgroundTaskManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Scan,
    CaptionBatch,
    DetailedCaption,
}

impl TaskType {
    pub fn display_name(&self) -> &'static str {
        match self {
            TaskType::Scan => "Library scan",
            TaskType::CaptionBatch => "Caption queue",
            TaskType::DetailedCaption => "Detailed caption",
        }
    }
}

/// Position within a batch; `current` counts images started so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskProgress {
    pub current: usize,
    pub total: usize,
    pub current_item: Option<String>,
}

impl TaskProgress {
    pub fn new(current: usize, total: usize) -> Self {
        Self {
            current,
            total,
            current_item: None,
        }
    }

    pub fn with_item(mut self, item: impl Into<String>) -> Self {
        self.current_item = Some(item.into());
        self
    }

    /// Whole percent done, capped at 100. An empty batch reads as 0.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        (self.current.min(self.total) * 100 / self.total) as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Completed,
    Cancelled,
    Failed(String),
}

/// Messages a task sends while it runs. The last one is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskUpdate {
    Started { total: usize },
    Progress(TaskProgress),
    Completed { message: String },
    Cancelled,
    Failed { error: String },
}

pub struct BackgroundTask {
    pub id: TaskId,
    pub task_type: TaskType,
    pub state: TaskState,
    pub progress: Option<TaskProgress>,
    cancel_flag: Arc<AtomicBool>,
    receiver: mpsc::Receiver<TaskUpdate>,
    started_at: Instant,
}

impl BackgroundTask {
    fn new(
        task_type: TaskType,
        cancel_flag: Arc<AtomicBool>,
        receiver: mpsc::Receiver<TaskUpdate>,
    ) -> Self {
        Self {
            id: TaskId::next(),
            task_type,
            state: TaskState::Running,
            progress: None,
            cancel_flag,
            receiver,
            started_at: Instant::now(),
        }
    }

    fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_running(&self) -> bool {
        self.state == TaskState::Running
    }
}

/// A task that reached a terminal state during the last poll.
#[derive(Debug, Clone)]
pub struct TaskCompletionInfo {
    pub id: TaskId,
    pub task_type: TaskType,
    pub state: TaskState,
    pub message: String,
    pub elapsed: Duration,
}

impl TaskCompletionInfo {
    pub fn succeeded(&self) -> bool {
        self.state == TaskState::Completed
    }
}
